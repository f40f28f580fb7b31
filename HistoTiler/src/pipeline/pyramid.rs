//! 多分辨率金字塔读取器的边界定义
//!
//! 真正的 WSI 解码器（svs/ndpi 等）不在本 crate 范围内，只要实现
//! [`PyramidReader`] 与 [`SlideOpener`] 即可接入流水线。

use crate::error::Result;
use image::RgbImage;
use std::path::Path;

/// 一个可以按 (level, col, row) 读取 tile 的金字塔
///
/// level 编号与 Deep Zoom 一致：0 是最小的缩略层，`level_count() - 1` 是全分辨率。
pub trait PyramidReader: Send {
    fn level_count(&self) -> usize;

    /// 该层相对全分辨率的下采样倍数
    fn level_downsample(&self, level: usize) -> Option<f64>;

    /// 该层的 tile 网格 (cols, rows)
    fn level_tiles(&self, level: usize) -> Option<(u32, u32)>;

    /// 该层的像素尺寸 (width, height)
    fn level_dimensions(&self, level: usize) -> Option<(u32, u32)>;

    /// 读取一个 tile，返回 RGB 像素
    fn get_tile(&mut self, level: usize, address: (u32, u32)) -> Result<RgbImage>;

    /// 元数据中的物镜倍率，缺失时返回 None
    fn objective_power(&self) -> Option<f64>;

    /// associated images 的名称（缩略图、标签图等）
    fn associated_names(&self) -> Vec<String>;

    /// 以金字塔的形式打开某个 associated image
    fn associated(&self, name: &str) -> Result<Box<dyn PyramidReader>>;

    /// 所有层级的 tile 总数
    fn tile_count(&self) -> u64 {
        (0..self.level_count())
            .filter_map(|level| self.level_tiles(level))
            .map(|(cols, rows)| cols as u64 * rows as u64)
            .sum()
    }
}

/// 按路径打开金字塔
///
/// 每个 worker 各自调用一次，得到独立的句柄，读取时无需加锁。
pub trait SlideOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn PyramidReader>>;
}

/// 根据扩展名推断的图片类别，用于元数据缺失时的缺省物镜倍率
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// jpg / png / dcm 等普通图片
    Photographic,
    /// tiff / btf 等
    TiffLike,
    Other,
}

impl ImageKind {
    pub fn from_extension(extension: &str) -> Self {
        let ext = extension.trim_start_matches('.').to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "bmp" | "dcm" => ImageKind::Photographic,
            "tif" | "tiff" | "btf" => ImageKind::TiffLike,
            _ => ImageKind::Other,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|s| s.to_str())
            .map(Self::from_extension)
            .unwrap_or(ImageKind::Other)
    }

    /// 元数据缺失时使用的物镜倍率
    pub fn default_objective(self) -> Option<f64> {
        match self {
            ImageKind::Photographic => Some(1.0),
            ImageKind::TiffLike => Some(20.0),
            ImageKind::Other => None,
        }
    }
}

/// 优先使用元数据中的物镜倍率，否则按图片类别推断
pub fn resolve_objective(reader: &dyn PyramidReader, kind: ImageKind) -> Option<f64> {
    reader
        .objective_power()
        .filter(|v| v.is_finite() && *v > 0.0)
        .or_else(|| kind.default_objective())
}

/// 每一层的有效放大倍率 = objective / downsample
pub fn level_magnifications(reader: &dyn PyramidReader, objective: f64) -> Vec<Option<f64>> {
    (0..reader.level_count())
        .map(|level| {
            reader
                .level_downsample(level)
                .filter(|d| *d > 0.0)
                .map(|d| objective / d)
        })
        .collect()
}

/// 把 associated image 名称转换成适合做目录名的形式
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_sep = false;
    for ch in text.to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_sep {
                slug.push('_');
                pending_sep = false;
            }
            slug.push(ch);
        } else if ch.is_ascii() {
            pending_sep = true;
        }
        // 非 ASCII 字符直接丢弃
    }
    if pending_sep {
        slug.push('_');
    }
    slug
}
