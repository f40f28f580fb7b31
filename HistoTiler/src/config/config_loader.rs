use super::tiler_config::{DatasetConfig, TilerConfig, TilingConfig};
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// 从 TOML 文件加载并校验配置
pub fn load_config_file<P: AsRef<Path>>(file_path: P) -> Result<TilerConfig> {
    parse_config_file(file_path)?.validate()
}

/// 从 TOML 字符串加载并校验配置
pub fn load_config_str(content: &str) -> Result<TilerConfig> {
    parse_config_str(content)?.validate()
}

/// 只解析不校验，调用方在覆盖参数之后自行调用 [`TilerConfig::validate`]
pub fn parse_config_file<P: AsRef<Path>>(file_path: P) -> Result<TilerConfig> {
    let file_path = file_path.as_ref();
    let content = std::fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read config file {}", file_path.display()))?;

    parse_config_str(&content)
}

/// 所有键都是可选的，缺省时使用 [`TilingConfig::default`] / [`DatasetConfig::default`]，
/// 但 `[labels]` 至少需要一个条目。
pub fn parse_config_str(content: &str) -> Result<TilerConfig> {
    let config: toml::Value =
        toml::from_str(content).map_err(|e| anyhow!("Failed to parse TOML config: {}", e))?;

    let tiling = match config.get("tiling") {
        Some(table) => parse_tiling(table)?,
        None => TilingConfig::default(),
    };

    let dataset = match config.get("dataset") {
        Some(table) => parse_dataset(table)?,
        None => DatasetConfig::default(),
    };

    let labels = match config.get("labels").and_then(|v| v.as_table()) {
        Some(table) => parse_labels(table)?,
        None => return Err(anyhow!("No 'labels' section found in config")),
    };

    Ok(TilerConfig {
        tiling,
        dataset,
        labels,
    })
}

fn parse_tiling(table: &toml::Value) -> Result<TilingConfig> {
    let defaults = TilingConfig::default();

    let tile_size = get_u32(table, "tile_size")?.unwrap_or(defaults.tile_size);
    let overlap = get_u32(table, "overlap")?.unwrap_or(defaults.overlap);
    let format = get_str(table, "format")?.unwrap_or(defaults.format);
    let quality = match get_u64(table, "quality")? {
        Some(q) if q > 100 => return Err(anyhow!("'tiling.quality' must be within 1-100")),
        Some(q) => q as u8,
        None => defaults.quality,
    };
    let workers = match get_u64(table, "workers")? {
        Some(v) => usize::try_from(v).map_err(|_| anyhow!("'workers' is too large: {}", v))?,
        None => defaults.workers,
    };
    let background_percent = get_f64(table, "background_percent")?
        .map(|v| v as f32)
        .unwrap_or(defaults.background_percent);
    let roi_percent = get_f64(table, "roi_percent")?
        .map(|v| v as f32)
        .unwrap_or(defaults.roi_percent);
    let target_magnification =
        get_f64(table, "target_magnification")?.unwrap_or(defaults.target_magnification);
    let save_masks = get_bool(table, "save_masks")?.unwrap_or(defaults.save_masks);
    let with_viewer = get_bool(table, "with_viewer")?.unwrap_or(defaults.with_viewer);
    let baseline_image = get_str(table, "baseline_image")?
        .map(PathBuf::from)
        .unwrap_or(defaults.baseline_image);
    let roi_mask_dir = get_str(table, "roi_mask_dir")?.map(PathBuf::from);

    Ok(TilingConfig {
        tile_size,
        overlap,
        format,
        quality,
        workers,
        background_percent,
        roi_percent,
        target_magnification,
        save_masks,
        with_viewer,
        baseline_image,
        roi_mask_dir,
    })
}

fn parse_dataset(table: &toml::Value) -> Result<DatasetConfig> {
    let defaults = DatasetConfig::default();

    Ok(DatasetConfig {
        input_dir: get_str(table, "input_dir")?
            .map(PathBuf::from)
            .unwrap_or(defaults.input_dir),
        slide_extension: get_str(table, "slide_extension")?
            .map(|s| s.trim_start_matches('.').to_string())
            .unwrap_or(defaults.slide_extension),
        output_dir: get_str(table, "output_dir")?
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir),
        label_file: get_str(table, "label_file")?
            .map(PathBuf::from)
            .unwrap_or(defaults.label_file),
        validation_split: get_f64(table, "validation_split")?
            .map(|v| v as f32)
            .unwrap_or(defaults.validation_split),
        augment: get_bool(table, "augment")?.unwrap_or(defaults.augment),
        seed: get_u64(table, "seed")?,
    })
}

fn parse_labels(table: &toml::map::Map<String, toml::Value>) -> Result<BTreeMap<String, usize>> {
    let mut labels = BTreeMap::new();
    for (name, value) in table.iter() {
        let index = value
            .as_integer()
            .filter(|v| *v >= 0)
            .ok_or_else(|| anyhow!("Label '{}' must map to a non-negative integer", name))?;
        labels.insert(name.to_string(), index as usize);
    }
    Ok(labels)
}

fn get_str(table: &toml::Value, key: &str) -> Result<Option<String>> {
    match table.get(key) {
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| anyhow!("'{}' must be a string", key)),
        None => Ok(None),
    }
}

fn get_u64(table: &toml::Value, key: &str) -> Result<Option<u64>> {
    match table.get(key) {
        Some(v) => v
            .as_integer()
            .filter(|i| *i >= 0)
            .map(|i| Some(i as u64))
            .ok_or_else(|| anyhow!("'{}' must be a non-negative integer", key)),
        None => Ok(None),
    }
}

fn get_u32(table: &toml::Value, key: &str) -> Result<Option<u32>> {
    get_u64(table, key)?
        .map(|v| u32::try_from(v).map_err(|_| anyhow!("'{}' is too large: {}", key, v)))
        .transpose()
}

// 整数也接受为浮点数，`target_magnification = 20` 与 `20.0` 等价
fn get_f64(table: &toml::Value, key: &str) -> Result<Option<f64>> {
    match table.get(key) {
        Some(v) => v
            .as_float()
            .or_else(|| v.as_integer().map(|i| i as f64))
            .map(Some)
            .ok_or_else(|| anyhow!("'{}' must be a number", key)),
        None => Ok(None),
    }
}

fn get_bool(table: &toml::Value, key: &str) -> Result<Option<bool>> {
    match table.get(key) {
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| anyhow!("'{}' must be a boolean", key)),
        None => Ok(None),
    }
}
