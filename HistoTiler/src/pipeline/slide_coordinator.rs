use crate::config::TilingConfig;
use crate::error::Result;
use crate::pipeline::image_tiler::{ImageTiler, TilingStats};
use crate::pipeline::job_queue::JobQueue;
use crate::pipeline::pyramid::{slugify, ImageKind, PyramidReader, SlideOpener};
use crate::pipeline::roi_mask::RoiMask;
use crate::pipeline::task_meta::{TileCommand, TileResult};
use crate::pipeline::tile_filter::TileFilter;
use crate::pipeline::tile_worker::{TileWorker, WorkerContext};
use crate::pipeline::tile_writer::TileWriter;
use crossbeam_channel::Sender;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 一张切片的输入与输出位置
#[derive(Debug, Clone)]
pub struct SlideTask {
    pub slide_id: String,
    pub slide_path: PathBuf,
    /// `<output_base>/<label>/<slide-id>`
    pub output_dir: PathBuf,
}

impl SlideTask {
    /// 主图的文件名前缀
    pub fn main_stem(&self, with_viewer: bool) -> PathBuf {
        if with_viewer {
            self.output_dir.join("slide")
        } else {
            self.output_dir.join(&self.slide_id)
        }
    }

    pub fn associated_stem(&self, name: &str) -> PathBuf {
        self.output_dir.join(slugify(name))
    }
}

/// 管理单张切片的 worker 池与 job 队列
pub struct SlideTilingCoordinator {
    settings: TilingConfig,
    opener: Arc<dyn SlideOpener>,
    baseline: Arc<RgbImage>,
}

impl SlideTilingCoordinator {
    pub fn new(settings: TilingConfig, opener: Arc<dyn SlideOpener>, baseline: Arc<RgbImage>) -> Self {
        Self {
            settings,
            opener,
            baseline,
        }
    }

    /// 切分一张切片，结果写入 `results`
    ///
    /// 只要 worker 已经启动，结束时一定会发送 [`TileResult::Done`]。
    /// 打开切片失败时直接返回错误，不会发送任何消息。
    pub fn tile_slide(&self, task: &SlideTask, results: &Sender<TileResult>) -> Result<TilingStats> {
        let reader = self.opener.open(&task.slide_path)?;
        let roi = self.load_roi(&task.slide_id);

        let workers = self.settings.workers.max(1);
        let jobs = JobQueue::bounded(2 * workers);
        let context = WorkerContext {
            slide_path: task.slide_path.clone(),
            opener: self.opener.clone(),
            baseline: self.baseline.clone(),
            filter: TileFilter::from_percent(
                self.settings.background_percent,
                self.settings.roi_percent,
            ),
            writer: TileWriter::new(self.settings.quality),
        };

        let handles: Vec<TileWorker> = (0..workers)
            .map(|index| {
                let span = tracing::info_span!("tile_worker", slide = %task.slide_id, worker = index);
                TileWorker::spawn(context.clone(), jobs.clone(), results.clone(), span)
            })
            .collect();
        tracing::info!(
            "[SlideTilingCoordinator] Tiling {} with {} workers (queue capacity {})",
            task.slide_id,
            workers,
            jobs.capacity()
        );

        let outcome = self.enqueue_all(task, reader.as_ref(), roi.as_ref(), &jobs, results);

        // 无论是否成功都要让 worker 退出
        for _ in 0..workers {
            if let Err(e) = jobs.put(TileCommand::Stop) {
                tracing::error!("[SlideTilingCoordinator] Failed to stop worker: {}", e);
            }
        }
        jobs.join();
        if results.send(TileResult::Done).is_err() {
            tracing::warn!("[SlideTilingCoordinator] Result receiver dropped before completion");
        }
        for handle in handles {
            handle.join();
        }

        match &outcome {
            Ok(stats) => tracing::info!(
                "[SlideTilingCoordinator] {} finished: {} queued, {} already present",
                task.slide_id,
                stats.enqueued,
                stats.already_present
            ),
            Err(e) => tracing::warn!("[SlideTilingCoordinator] {} failed: {}", task.slide_id, e),
        }
        outcome
    }

    fn enqueue_all(
        &self,
        task: &SlideTask,
        reader: &dyn PyramidReader,
        roi: Option<&RoiMask>,
        jobs: &JobQueue,
        results: &Sender<TileResult>,
    ) -> Result<TilingStats> {
        let kind = ImageKind::from_path(&task.slide_path);
        let with_viewer = self.settings.with_viewer;

        let mut stats = ImageTiler::new(&self.settings, task.main_stem(with_viewer), kind)
            .with_roi(roi)
            .run(reader, jobs, results)?;

        if with_viewer {
            for name in reader.associated_names() {
                let associated = reader.associated(&name)?;
                let part = ImageTiler::new(&self.settings, task.associated_stem(&name), kind)
                    .with_associated(&name)
                    .run(associated.as_ref(), jobs, results)?;
                stats.merge(part);
            }
        }
        Ok(stats)
    }

    fn load_roi(&self, slide_id: &str) -> Option<RoiMask> {
        let dir = self.settings.roi_mask_dir.as_deref()?;
        let path = RoiMask::locate(dir, slide_id)?;
        match RoiMask::load(&path) {
            Ok(mask) => Some(mask),
            Err(e) => {
                tracing::warn!(
                    "[SlideTilingCoordinator] Ignoring ROI mask {}: {}",
                    path.display(),
                    e
                );
                None
            }
        }
    }
}

/// 从磁盘读取参考染色基准图
pub fn load_baseline(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)?.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TilerError;
    use crate::pipeline::deep_zoom::FlatImagePyramid;
    use crossbeam_channel::unbounded;
    use image::Rgb;

    /// 纹理足够丰富、可以通过过滤的图片
    fn tissue_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let v = ((x * 7 + y * 13) % 150) as u8;
            Rgb([60 + v, 30 + v / 2, 90 + v / 3])
        })
    }

    struct MemoryOpener {
        image: RgbImage,
    }

    impl SlideOpener for MemoryOpener {
        fn open(&self, path: &Path) -> Result<Box<dyn PyramidReader>> {
            if path.to_string_lossy().contains("missing") {
                return Err(TilerError::SlideOpen {
                    path: path.to_path_buf(),
                    reason: "not found".to_string(),
                });
            }
            Ok(Box::new(
                FlatImagePyramid::new(self.image.clone(), 32, 0)
                    .with_objective(20.0)
                    .with_associated("Macro Image", self.image.clone()),
            ))
        }
    }

    fn coordinator(with_viewer: bool) -> SlideTilingCoordinator {
        let settings = TilingConfig {
            tile_size: 32,
            workers: 2,
            format: "png".to_string(),
            background_percent: 50.0,
            with_viewer,
            ..TilingConfig::default()
        };
        let image = tissue_image(64, 64);
        SlideTilingCoordinator::new(
            settings,
            Arc::new(MemoryOpener { image: image.clone() }),
            Arc::new(image),
        )
    }

    fn collect(rx: &crossbeam_channel::Receiver<TileResult>) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for result in rx.try_iter() {
            match result {
                TileResult::Tile(path) => paths.push(path),
                TileResult::Done => break,
            }
        }
        paths.sort();
        paths
    }

    #[test]
    fn test_tile_slide_writes_tiles_and_done() {
        let dir = tempfile::tempdir().unwrap();
        let task = SlideTask {
            slide_id: "s1".to_string(),
            slide_path: PathBuf::from("s1.tiff"),
            output_dir: dir.path().join("A/s1"),
        };
        let (tx, rx) = unbounded();

        let stats = coordinator(false).tile_slide(&task, &tx).unwrap();
        assert_eq!(stats.enqueued, 4);

        let results: Vec<TileResult> = rx.try_iter().collect();
        assert_eq!(results.last(), Some(&TileResult::Done));
        assert_eq!(results.len(), 5);
        assert!(dir.path().join("A/s1/s1_1_1.png").is_file());
    }

    #[test]
    fn test_with_viewer_layout() {
        let dir = tempfile::tempdir().unwrap();
        let task = SlideTask {
            slide_id: "s2".to_string(),
            slide_path: PathBuf::from("s2.tiff"),
            output_dir: dir.path().join("B/s2"),
        };
        let (tx, rx) = unbounded();

        coordinator(true).tile_slide(&task, &tx).unwrap();
        let paths = collect(&rx);
        assert!(paths.contains(&dir.path().join("B/s2/slide_0_0.png")));
        assert!(paths.contains(&dir.path().join("B/s2/macro_image_0_0.png")));
    }

    #[test]
    fn test_open_failure_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let task = SlideTask {
            slide_id: "missing".to_string(),
            slide_path: PathBuf::from("missing.tiff"),
            output_dir: dir.path().join("A/missing"),
        };
        let (tx, rx) = unbounded();

        assert!(coordinator(false).tile_slide(&task, &tx).is_err());
        assert!(rx.try_recv().is_err());
    }
}
