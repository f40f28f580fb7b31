use crate::error::{Result, TilerError};
use crate::pipeline::job_queue::JobQueue;
use crate::pipeline::pyramid::{PyramidReader, SlideOpener};
use crate::pipeline::stain_normalizer::StainNormalizer;
use crate::pipeline::task_meta::{TileCommand, TileJob, TileResult};
use crate::pipeline::tile_filter::TileFilter;
use crate::pipeline::tile_writer::{binarize_mask, TileWriter};
use crossbeam_channel::Sender;
use image::RgbImage;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::Span;

/// worker 处理一张切片所需的全部只读信息
#[derive(Clone)]
pub struct WorkerContext {
    pub slide_path: PathBuf,
    pub opener: Arc<dyn SlideOpener>,
    /// 参考染色的基准图，worker 启动时在其上拟合字典
    pub baseline: Arc<RgbImage>,
    pub filter: TileFilter,
    pub writer: TileWriter,
}

/// 消费 job 队列的 tile worker
pub struct TileWorker {
    handle: JoinHandle<()>,
}

impl TileWorker {
    pub fn spawn(
        context: WorkerContext,
        jobs: JobQueue,
        results: Sender<TileResult>,
        span: Span,
    ) -> Self {
        let mut inner = TileWorkerInner {
            context,
            jobs,
            results,
        };

        let handle = std::thread::spawn(move || {
            let _entered = span.enter();
            inner.execute();
        });

        Self { handle }
    }

    pub fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!("[TileWorker] Worker thread panicked");
        }
    }
}

/// 每个 worker 独占的可变状态
struct WorkerState {
    normalizer: StainNormalizer,
    slide: Box<dyn PyramidReader>,
    // 最近一次使用的 associated image
    associated: Option<(String, Box<dyn PyramidReader>)>,
}

impl WorkerState {
    fn reader_for(&mut self, associated: Option<&str>) -> Result<&mut dyn PyramidReader> {
        let Some(name) = associated else {
            return Ok(self.slide.as_mut());
        };

        let cached = matches!(&self.associated, Some((current, _)) if current == name);
        if !cached {
            let reader = self.slide.associated(name)?;
            self.associated = Some((name.to_string(), reader));
        }
        match self.associated.as_mut() {
            Some((_, reader)) => Ok(reader.as_mut()),
            None => Err(TilerError::AssociatedImage(name.to_string())),
        }
    }
}

struct TileWorkerInner {
    context: WorkerContext,
    jobs: JobQueue,
    results: Sender<TileResult>,
}

impl TileWorkerInner {
    fn execute(&mut self) {
        tracing::debug!("[TileWorker] Started");

        let prepared = panic::catch_unwind(AssertUnwindSafe(|| self.prepare()))
            .unwrap_or_else(|_| Err(TilerError::numerical("worker initialization panicked")));
        let mut state = match prepared {
            Ok(state) => Some(state),
            Err(e) => {
                // 仍然要确认所有消息，否则生产者会一直阻塞在 join 上
                tracing::error!("[TileWorker] Initialization failed, jobs will be skipped: {}", e);
                None
            }
        };

        let mut written = 0usize;
        let mut rejected = 0usize;
        loop {
            let command = match self.jobs.get() {
                Ok(command) => command,
                Err(_) => break,
            };

            match command {
                TileCommand::Stop => {
                    self.jobs.task_done();
                    break;
                }
                TileCommand::Fetch(job) => {
                    if let Some(state) = state.as_mut() {
                        // 单个 tile 的 panic 按失败处理，确认照常进行
                        let outcome =
                            panic::catch_unwind(AssertUnwindSafe(|| self.process(state, &job)));
                        match outcome {
                            Ok(Ok(true)) => written += 1,
                            Ok(Ok(false)) => rejected += 1,
                            Ok(Err(e)) => tracing::warn!(
                                "[TileWorker] Tile {:?} at level {} skipped: {}",
                                job.address,
                                job.level,
                                e
                            ),
                            Err(_) => {
                                tracing::error!(
                                    "[TileWorker] Tile {:?} at level {} panicked, skipped",
                                    job.address,
                                    job.level
                                );
                                state.associated = None;
                            }
                        }
                    }
                    self.jobs.task_done();
                }
            }
        }

        tracing::debug!(
            "[TileWorker] Stopped, {} tiles written, {} rejected",
            written,
            rejected
        );
    }

    fn prepare(&self) -> Result<WorkerState> {
        let normalizer = StainNormalizer::from_reference_image(&self.context.baseline)?;
        let slide = self.context.opener.open(&self.context.slide_path)?;
        Ok(WorkerState {
            normalizer,
            slide,
            associated: None,
        })
    }

    /// 返回 tile 是否被保留
    fn process(&self, state: &mut WorkerState, job: &TileJob) -> Result<bool> {
        let tile = state
            .reader_for(job.associated.as_deref())?
            .get_tile(job.level, job.address)?;

        let decision = self.context.filter.accept(&tile, Some(job.roi_fraction));
        if !decision.accepted {
            tracing::trace!(
                "[TileWorker] Rejected {} (background {:.2})",
                job.output_path.display(),
                decision.background_fraction
            );
            return Ok(false);
        }

        let normalized = state.normalizer.normalize(&tile)?;
        self.context
            .writer
            .write_tile(&normalized, &job.output_path, &job.format)?;
        self.results
            .send(TileResult::Tile(job.output_path.clone()))
            .map_err(|_| TilerError::QueueDisconnected)?;

        if job.save_masks {
            let mask = binarize_mask(job.tile_mask.as_ref(), &tile);
            if let Err(e) = self.context.writer.write_mask(&mask, &job.mask_path, &job.format) {
                tracing::warn!("[TileWorker] Mask not written: {}", e);
            }
        }

        Ok(true)
    }
}
