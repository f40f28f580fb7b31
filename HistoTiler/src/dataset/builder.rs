use crate::config::TilerConfig;
use crate::dataset::augmentation::{compute_plan, AugmentationEngine, AugmentationPlan, AugmentationReport};
use crate::dataset::labels::{scan_slides, LabelIndex, SlideFile};
use crate::dataset::split::train_valid_split;
use crate::dataset::tile_dict::TileDict;
use crate::error::{Result, TilerError};
use crate::pipeline::slide_coordinator::{load_baseline, SlideTask, SlideTilingCoordinator};
use crate::pipeline::task_meta::TileResult;
use crate::pipeline::SlideOpener;
use crossbeam_channel::unbounded;
use std::sync::Arc;

/// 处理失败被跳过的切片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSlide {
    pub slide_id: String,
    pub reason: String,
}

/// 一次完整运行的结果
#[derive(Debug, Clone, Default)]
pub struct DatasetOutcome {
    pub train: TileDict,
    pub validation: TileDict,
    pub plan: AugmentationPlan,
    pub augmentation: AugmentationReport,
    pub skipped: Vec<SkippedSlide>,
}

pub struct DatasetBuilder {
    config: TilerConfig,
    opener: Arc<dyn SlideOpener>,
}

impl DatasetBuilder {
    pub fn new(config: TilerConfig, opener: Arc<dyn SlideOpener>) -> Self {
        Self { config, opener }
    }

    pub fn run(&self) -> Result<DatasetOutcome> {
        let dataset = &self.config.dataset;

        let labels = LabelIndex::from_file(&dataset.label_file, &self.config.labels)?;
        tracing::info!("[DatasetBuilder] Loaded labels for {} slides", labels.len());

        for label in self.config.labels.keys() {
            std::fs::create_dir_all(dataset.output_dir.join(label))?;
        }

        let slides = scan_slides(&dataset.input_dir, &dataset.slide_extension)?;
        tracing::info!(
            "[DatasetBuilder] Found {} slides in {}",
            slides.len(),
            dataset.input_dir.display()
        );
        let split = train_valid_split(&slides, &labels, dataset.validation_split, dataset.seed)?;

        let baseline = load_baseline(&self.config.tiling.baseline_image).map_err(|e| {
            TilerError::config(format!(
                "cannot load baseline image {}: {}",
                self.config.tiling.baseline_image.display(),
                e
            ))
        })?;
        let coordinator = SlideTilingCoordinator::new(
            self.config.tiling.clone(),
            self.opener.clone(),
            Arc::new(baseline),
        );

        let mut outcome = DatasetOutcome::default();

        tracing::info!("[DatasetBuilder] Creating training tiles");
        outcome.train = self.collect_tiles(&coordinator, &split.train, &labels, &mut outcome.skipped)?;

        outcome.plan = compute_plan(&outcome.train.class_counts());
        for (label, class) in &outcome.plan {
            tracing::info!(
                "[DatasetBuilder] Class {}: {} tiles, augmentation factor {}",
                label,
                class.tile_count,
                class.factor
            );
        }
        if dataset.augment {
            tracing::info!("[DatasetBuilder] Augmenting tiles");
            outcome.augmentation = AugmentationEngine::new(&outcome.plan).run(&mut outcome.train);
        }

        tracing::info!("[DatasetBuilder] Creating validation tiles");
        outcome.validation =
            self.collect_tiles(&coordinator, &split.validation, &labels, &mut outcome.skipped)?;

        for (label, count) in outcome.validation.class_counts() {
            tracing::info!("[DatasetBuilder] Validation class {}: {} tiles", label, count);
        }
        if !outcome.skipped.is_empty() {
            tracing::warn!("[DatasetBuilder] {} slides skipped", outcome.skipped.len());
        }
        Ok(outcome)
    }

    /// 依次切分每张切片，收集保留下来的 tile
    ///
    /// 只有致命错误会向上返回，其余错误记录到 `skipped` 后继续。
    pub fn collect_tiles(
        &self,
        coordinator: &SlideTilingCoordinator,
        slides: &[SlideFile],
        labels: &LabelIndex,
        skipped: &mut Vec<SkippedSlide>,
    ) -> Result<TileDict> {
        let mut tiles = TileDict::with_labels(self.config.labels.keys().cloned());

        for (index, slide) in slides.iter().enumerate() {
            let label = labels.label_of(&slide.slide_id)?;
            let span = tracing::info_span!("slide", id = %slide.slide_id);
            let _entered = span.enter();
            tracing::debug!(
                "[DatasetBuilder] ({}/{}) {} -> {}",
                index + 1,
                slides.len(),
                slide.path.display(),
                label
            );

            let task = SlideTask {
                slide_id: slide.slide_id.clone(),
                slide_path: slide.path.clone(),
                output_dir: self
                    .config
                    .dataset
                    .output_dir
                    .join(label)
                    .join(&slide.slide_id),
            };

            let (tx, rx) = unbounded();
            let result = coordinator.tile_slide(&task, &tx);
            drop(tx);

            let mut paths = Vec::new();
            for message in rx.iter() {
                match message {
                    TileResult::Tile(path) => paths.push(path),
                    TileResult::Done => break,
                }
            }

            match result {
                Ok(_) => {
                    paths.sort();
                    if let Some(entry) = tiles.slide_entry(label, &slide.slide_id) {
                        entry.extend(paths);
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        "[DatasetBuilder] Failed to process {}: {}",
                        slide.path.display(),
                        e
                    );
                    skipped.push(SkippedSlide {
                        slide_id: slide.slide_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(tiles)
    }
}
