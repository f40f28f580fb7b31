//! 按类别不平衡程度对训练 tile 做旋转/镜像增广

use crate::dataset::tile_dict::TileDict;
use image::DynamicImage;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// tile 最少的类别使用的增广倍数
pub const MAX_AUGMENTATION_FACTOR: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassAugmentation {
    pub tile_count: usize,
    pub factor: u32,
}

/// label -> (tile 数, 增广倍数)
pub type AugmentationPlan = BTreeMap<String, ClassAugmentation>;

/// 最少的类别得到 8，其余为 round(m * 8 / n)（四舍五入远离零），至少为 1
pub fn compute_plan(class_counts: &BTreeMap<String, usize>) -> AugmentationPlan {
    let smallest = class_counts.values().copied().min().unwrap_or(0);

    class_counts
        .iter()
        .map(|(label, &count)| {
            let factor = if count == smallest {
                MAX_AUGMENTATION_FACTOR
            } else {
                let ratio = smallest as f64 * MAX_AUGMENTATION_FACTOR as f64 / count as f64;
                (ratio.round() as u32).max(1)
            };
            (
                label.clone(),
                ClassAugmentation {
                    tile_count: count,
                    factor,
                },
            )
        })
        .collect()
}

/// 第 i 个增广版本：逆时针旋转角度与是否镜像
pub fn variant(i: u32) -> (u32, bool) {
    ((90 * i) % 360, i > 3)
}

/// `<stem>_<deg>[_mirror].<ext>`
pub fn derived_path(original: &Path, degrees: u32, mirror: bool) -> PathBuf {
    let suffix = if mirror {
        format!("_{}_mirror", degrees)
    } else {
        format!("_{}", degrees)
    };

    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match original.extension() {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}{}", stem, suffix),
    };
    original.with_file_name(name)
}

/// 逆时针旋转并（可选）左右翻转
pub fn rotate_and_mirror(image: &DynamicImage, degrees: u32, mirror: bool) -> DynamicImage {
    let rotated = match degrees {
        90 => image.rotate270(),
        180 => image.rotate180(),
        270 => image.rotate90(),
        _ => image.clone(),
    };
    if mirror {
        rotated.fliph()
    } else {
        rotated
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AugmentationReport {
    pub written: usize,
    pub already_present: usize,
    pub failed: usize,
}

impl std::ops::Add for AugmentationReport {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            written: self.written + other.written,
            already_present: self.already_present + other.already_present,
            failed: self.failed + other.failed,
        }
    }
}

/// 就地向 TileDict 追加增广后的 tile
pub struct AugmentationEngine<'a> {
    plan: &'a AugmentationPlan,
}

impl<'a> AugmentationEngine<'a> {
    pub fn new(plan: &'a AugmentationPlan) -> Self {
        Self { plan }
    }

    /// 重复执行不会产生新的文件或重复的条目
    pub fn run(&self, tiles: &mut TileDict) -> AugmentationReport {
        let mut report = AugmentationReport::default();

        for (label, slides) in tiles.iter_mut() {
            let factor = self.plan.get(label).map_or(1, |c| c.factor);
            if factor <= 1 {
                continue;
            }

            let part = slides
                .par_iter_mut()
                .map(|(_, list)| augment_slide(list, factor))
                .reduce(AugmentationReport::default, |a, b| a + b);
            tracing::info!(
                "[AugmentationEngine] {}: factor {}, {} written, {} already present",
                label,
                factor,
                part.written,
                part.already_present
            );
            report = report + part;
        }

        report
    }
}

fn augment_slide(list: &mut Vec<PathBuf>, factor: u32) -> AugmentationReport {
    let mut report = AugmentationReport::default();

    // 上一次运行追加的条目不是原始 tile
    let derived: HashSet<PathBuf> = list
        .iter()
        .flat_map(|path| {
            (1..MAX_AUGMENTATION_FACTOR).map(move |i| {
                let (degrees, mirror) = variant(i);
                derived_path(path, degrees, mirror)
            })
        })
        .collect();
    let originals: Vec<PathBuf> = list.iter().filter(|p| !derived.contains(*p)).cloned().collect();

    let mut additions = Vec::new();
    for original in &originals {
        let mut image: Option<DynamicImage> = None;

        for i in 1..factor {
            let (degrees, mirror) = variant(i);
            let target = derived_path(original, degrees, mirror);

            if target.exists() {
                report.already_present += 1;
                additions.push(target);
                continue;
            }

            if image.is_none() {
                match image::open(original) {
                    Ok(decoded) => image = Some(decoded),
                    Err(e) => {
                        tracing::warn!(
                            "[AugmentationEngine] Cannot read {}: {}",
                            original.display(),
                            e
                        );
                        report.failed += 1;
                        break;
                    }
                }
            }
            let Some(source) = image.as_ref() else {
                break;
            };

            match rotate_and_mirror(source, degrees, mirror).save(&target) {
                Ok(()) => {
                    report.written += 1;
                    additions.push(target);
                }
                Err(e) => {
                    tracing::warn!(
                        "[AugmentationEngine] Cannot write {}: {}",
                        target.display(),
                        e
                    );
                    report.failed += 1;
                }
            }
        }
    }

    let mut rebuilt = originals;
    rebuilt.extend(additions);
    *list = rebuilt;
    report
}
