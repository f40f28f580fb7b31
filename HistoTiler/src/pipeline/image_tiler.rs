use crate::config::TilingConfig;
use crate::error::{Result, TilerError};
use crate::pipeline::job_queue::JobQueue;
use crate::pipeline::pyramid::{level_magnifications, resolve_objective, ImageKind, PyramidReader};
use crate::pipeline::roi_mask::RoiMask;
use crate::pipeline::task_meta::{TileCommand, TileJob, TileResult};
use crossbeam_channel::Sender;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// 每处理这么多 tile 输出一次进度
const PROGRESS_INTERVAL: u64 = 100;

/// 放大倍率相等的容差
const MAGNIFICATION_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TilingStats {
    /// 新入队的 job 数
    pub enqueued: u64,
    /// 输出文件已存在、直接上报的 tile 数
    pub already_present: u64,
    /// 被选中层级上的 tile 总数
    pub total: u64,
}

impl TilingStats {
    pub fn merge(&mut self, other: TilingStats) {
        self.enqueued += other.enqueued;
        self.already_present += other.already_present;
        self.total += other.total;
    }
}

/// 为一个金字塔（主图或某个 associated image）生成 tile job
pub struct ImageTiler<'a> {
    settings: &'a TilingConfig,
    // 输出文件名前缀，tile 文件为 `<stem>_<col>_<row>.<fmt>`
    stem: PathBuf,
    kind: ImageKind,
    associated: Option<String>,
    roi: Option<&'a RoiMask>,
}

impl<'a> ImageTiler<'a> {
    pub fn new(settings: &'a TilingConfig, stem: PathBuf, kind: ImageKind) -> Self {
        Self {
            settings,
            stem,
            kind,
            associated: None,
            roi: None,
        }
    }

    pub fn with_associated(mut self, name: &str) -> Self {
        self.associated = Some(name.to_string());
        self
    }

    pub fn with_roi(mut self, roi: Option<&'a RoiMask>) -> Self {
        self.roi = roi;
        self
    }

    pub fn tile_path(&self, address: (u32, u32)) -> PathBuf {
        suffixed(&self.stem, &format!("_{}_{}.{}", address.0, address.1, self.settings.format))
    }

    pub fn mask_path(&self, address: (u32, u32)) -> PathBuf {
        suffixed(
            &self.stem,
            &format!("_{}_{}_mask.{}", address.0, address.1, self.settings.format),
        )
    }

    /// 被选中的层级，从全分辨率开始向下
    pub fn selected_levels(&self, reader: &dyn PyramidReader) -> Vec<usize> {
        let Some(objective) = resolve_objective(reader, self.kind) else {
            return Vec::new();
        };
        let target = self.settings.target_magnification;

        level_magnifications(reader, objective)
            .into_iter()
            .enumerate()
            .rev()
            .filter(|(_, magnification)| match magnification {
                Some(m) => target <= 0.0 || (m - target).abs() < MAGNIFICATION_EPSILON,
                None => false,
            })
            .map(|(level, _)| level)
            .collect()
    }

    pub fn run(
        &self,
        reader: &dyn PyramidReader,
        jobs: &JobQueue,
        results: &Sender<TileResult>,
    ) -> Result<TilingStats> {
        let mut stats = TilingStats::default();
        let name = self.stem.display().to_string();

        if resolve_objective(reader, self.kind).is_none() {
            tracing::warn!(
                "[ImageTiler] No objective power for {}, nothing to tile",
                name
            );
            return Ok(stats);
        }

        let levels = self.selected_levels(reader);
        if levels.is_empty() {
            tracing::info!(
                "[ImageTiler] No level of {} matches magnification {}",
                name,
                self.settings.target_magnification
            );
            return Ok(stats);
        }

        let planned: u64 = if levels.len() == reader.level_count() {
            reader.tile_count()
        } else {
            levels
                .iter()
                .filter_map(|level| reader.level_tiles(*level))
                .map(|(cols, rows)| cols as u64 * rows as u64)
                .sum()
        };

        // 不同层级可能映射到同一个文件名，每个路径只处理一次
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for level in levels {
            let Some((cols, rows)) = reader.level_tiles(level) else {
                continue;
            };
            let level_dims = reader.level_dimensions(level).unwrap_or((0, 0));

            for row in 0..rows {
                for col in 0..cols {
                    let address = (col, row);
                    let output_path = self.tile_path(address);
                    if !seen.insert(output_path.clone()) {
                        continue;
                    }
                    stats.total += 1;

                    if output_path.exists() {
                        results
                            .send(TileResult::Tile(output_path))
                            .map_err(|_| TilerError::QueueDisconnected)?;
                        stats.already_present += 1;
                    } else {
                        let (roi_fraction, tile_mask) = match self.roi {
                            Some(roi) => {
                                let region = tile_bounds(level_dims, self.settings.tile_size, address);
                                let (fraction, patch) = roi.tile_coverage(level_dims, region);
                                (fraction, Some(patch))
                            }
                            None => (1.0, None),
                        };

                        let job = TileJob {
                            associated: self.associated.clone(),
                            level,
                            address,
                            output_path,
                            format: self.settings.format.clone(),
                            mask_path: self.mask_path(address),
                            roi_fraction,
                            save_masks: self.settings.save_masks,
                            tile_mask,
                        };
                        jobs.put(TileCommand::Fetch(Box::new(job)))?;
                        stats.enqueued += 1;
                    }

                    if stats.total % PROGRESS_INTERVAL == 0 {
                        tracing::debug!(
                            "[ImageTiler] {}: {}/{} tiles ({} already present)",
                            name,
                            stats.total,
                            planned,
                            stats.already_present
                        );
                    }
                }
            }
        }

        tracing::info!(
            "[ImageTiler] {}: {} tiles, {} queued, {} already present",
            name,
            stats.total,
            stats.enqueued,
            stats.already_present
        );
        Ok(stats)
    }
}

fn suffixed(stem: &Path, suffix: &str) -> PathBuf {
    let mut os = stem.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// tile 在层级坐标中的区域，不含 overlap
fn tile_bounds(level_dims: (u32, u32), tile_size: u32, address: (u32, u32)) -> (u32, u32, u32, u32) {
    let x = address.0 * tile_size;
    let y = address.1 * tile_size;
    let w = tile_size.min(level_dims.0.saturating_sub(x)).max(1);
    let h = tile_size.min(level_dims.1.saturating_sub(y)).max(1);
    (x, y, w, h)
}
