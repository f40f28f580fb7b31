use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const DEFAULT_TILE_SIZE: u32 = 512;
pub const DEFAULT_OVERLAP: u32 = 0;
pub const DEFAULT_FORMAT: &str = "jpeg";
pub const DEFAULT_QUALITY: u8 = 90;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_BACKGROUND_PERCENT: f32 = 25.0;
pub const DEFAULT_TARGET_MAGNIFICATION: f64 = 20.0;
pub const DEFAULT_VALIDATION_SPLIT: f32 = 0.2;

/// 单张切片的切块参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilingConfig {
    /// tile 边长（像素，不含 overlap）
    pub tile_size: u32,
    /// 相邻 tile 的重叠像素
    pub overlap: u32,
    /// 输出格式（同时作为文件扩展名）
    pub format: String,
    /// JPEG 编码质量 1-100
    pub quality: u8,
    /// 每张切片的 worker 数量
    pub workers: usize,
    /// 允许的近白背景像素百分比上限
    pub background_percent: f32,
    /// ROI 覆盖率下限（百分比）
    pub roi_percent: f32,
    /// 目标放大倍率，0 表示处理所有层级
    pub target_magnification: f64,
    /// 是否额外保存二值 mask
    pub save_masks: bool,
    /// 是否同时切分 associated images（缩略图、标签等）
    pub with_viewer: bool,
    /// 用于拟合参考染色字典的基准图片
    pub baseline_image: PathBuf,
    /// ROI mask 所在目录（`<dir>/<slide-id>mask.jpg`）
    pub roi_mask_dir: Option<PathBuf>,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            overlap: DEFAULT_OVERLAP,
            format: DEFAULT_FORMAT.to_string(),
            quality: DEFAULT_QUALITY,
            workers: DEFAULT_WORKERS,
            background_percent: DEFAULT_BACKGROUND_PERCENT,
            roi_percent: 0.0,
            target_magnification: DEFAULT_TARGET_MAGNIFICATION,
            save_masks: false,
            with_viewer: false,
            baseline_image: PathBuf::from("baseline.jpg"),
            roi_mask_dir: None,
        }
    }
}

/// 数据集构建参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub input_dir: PathBuf,
    /// 切片文件扩展名（不带点），同时决定缺省物镜倍率
    pub slide_extension: String,
    pub output_dir: PathBuf,
    /// 每行 `<slide-id> <label>`
    pub label_file: PathBuf,
    pub validation_split: f32,
    pub augment: bool,
    /// 训练/验证划分的随机种子，None 时每次运行不同
    pub seed: Option<u64>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("slides"),
            slide_extension: "tiff".to_string(),
            output_dir: PathBuf::from("tiles"),
            label_file: PathBuf::from("labels.txt"),
            validation_split: DEFAULT_VALIDATION_SPLIT,
            augment: true,
            seed: None,
        }
    }
}

/// 完整的运行配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TilerConfig {
    pub tiling: TilingConfig,
    pub dataset: DatasetConfig,
    /// 标签名 -> 类别编号
    pub labels: BTreeMap<String, usize>,
}

impl TilerConfig {
    /// 验证配置的有效性
    /// 可以修正的值（例如 workers = 0）会被自动调整并给出警告
    pub fn validate(mut self) -> Result<Self> {
        let tiling = &mut self.tiling;

        if tiling.tile_size == 0 {
            return Err(anyhow!("Tile size must be greater than 0"));
        }
        if tiling.format.is_empty() {
            return Err(anyhow!("Output format cannot be empty"));
        }
        if image::ImageFormat::from_extension(&tiling.format).is_none() {
            return Err(anyhow!("Unknown output format '{}'", tiling.format));
        }
        if !(1..=100).contains(&tiling.quality) {
            return Err(anyhow!(
                "Quality must be within 1-100, got {}",
                tiling.quality
            ));
        }
        if !(0.0..=100.0).contains(&tiling.background_percent) {
            return Err(anyhow!(
                "Background percent must be within 0-100, got {}",
                tiling.background_percent
            ));
        }
        if !(0.0..=100.0).contains(&tiling.roi_percent) {
            return Err(anyhow!(
                "ROI percent must be within 0-100, got {}",
                tiling.roi_percent
            ));
        }
        if tiling.target_magnification < 0.0 {
            return Err(anyhow!(
                "Target magnification cannot be negative: {}",
                tiling.target_magnification
            ));
        }

        if tiling.workers == 0 {
            tracing::warn!("[TilerConfig] workers = 0, auto-adjusting to 1");
            tiling.workers = 1;
        }

        if !(0.0..1.0).contains(&self.dataset.validation_split) {
            return Err(anyhow!(
                "Validation split must be within [0, 1), got {}",
                self.dataset.validation_split
            ));
        }

        if self.labels.is_empty() {
            return Err(anyhow!("Label map cannot be empty"));
        }

        tracing::info!(
            "[TilerConfig] Validated: tile={} overlap={} format={} workers={} mag={} labels={:?}",
            self.tiling.tile_size,
            self.tiling.overlap,
            self.tiling.format,
            self.tiling.workers,
            self.tiling.target_magnification,
            self.labels.keys().collect::<Vec<_>>()
        );

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_labels() -> TilerConfig {
        let mut config = TilerConfig::default();
        config.labels.insert("benign".to_string(), 0);
        config.labels.insert("sarcoma".to_string(), 1);
        config
    }

    #[test]
    fn test_validate_workers_auto_adjust() {
        let mut config = config_with_labels();
        config.tiling.workers = 0;

        let validated = config.validate().unwrap();
        assert_eq!(validated.tiling.workers, 1);
    }

    #[test]
    fn test_validate_rejects_bad_quality() {
        let mut config = config_with_labels();
        config.tiling.quality = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_split_of_one() {
        let mut config = config_with_labels();
        config.dataset.validation_split = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_labels() {
        assert!(TilerConfig::default().validate().is_err());
    }

    #[test]
    fn test_validate_unknown_format() {
        let mut config = config_with_labels();
        config.tiling.format = "xyz".to_string();
        assert!(config.validate().is_err());
    }
}
