//! 普通栅格图片上的 Deep Zoom 金字塔
//!
//! 每一层尺寸为上一层的一半（向上取整），直到 1x1。tile 在内部边上带有
//! `overlap` 像素的重叠，边缘 tile 被裁剪到图像范围内。

use crate::error::{Result, TilerError};
use crate::pipeline::pyramid::{PyramidReader, SlideOpener};
use image::imageops::{self, FilterType};
use image::{ImageError, RgbImage};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// 金字塔的几何信息
#[derive(Debug, Clone)]
pub struct DeepZoomLayout {
    pub tile_size: u32,
    pub overlap: u32,
    // 下标即 level，0 为最小层
    level_dims: Vec<(u32, u32)>,
}

impl DeepZoomLayout {
    pub fn new(width: u32, height: u32, tile_size: u32, overlap: u32) -> Self {
        let mut dims = vec![(width.max(1), height.max(1))];
        let (mut w, mut h) = dims[0];
        while w > 1 || h > 1 {
            w = w.div_ceil(2).max(1);
            h = h.div_ceil(2).max(1);
            dims.push((w, h));
        }
        dims.reverse();

        Self {
            tile_size: tile_size.max(1),
            overlap,
            level_dims: dims,
        }
    }

    pub fn level_count(&self) -> usize {
        self.level_dims.len()
    }

    pub fn level_dimensions(&self, level: usize) -> Option<(u32, u32)> {
        self.level_dims.get(level).copied()
    }

    pub fn level_tiles(&self, level: usize) -> Option<(u32, u32)> {
        self.level_dimensions(level)
            .map(|(w, h)| (w.div_ceil(self.tile_size), h.div_ceil(self.tile_size)))
    }

    pub fn downsample(&self, level: usize) -> Option<f64> {
        if level >= self.level_count() {
            return None;
        }
        let steps = (self.level_count() - 1 - level) as i32;
        Some(2f64.powi(steps))
    }

    /// tile 在该层坐标系中的区域 (x, y, width, height)
    pub fn tile_region(&self, level: usize, address: (u32, u32)) -> Option<(u32, u32, u32, u32)> {
        let (width, height) = self.level_dimensions(level)?;
        let (cols, rows) = self.level_tiles(level)?;
        let (col, row) = address;
        if col >= cols || row >= rows {
            return None;
        }

        let (x, w) = self.axis_span(col, cols, width);
        let (y, h) = self.axis_span(row, rows, height);
        Some((x, y, w, h))
    }

    fn axis_span(&self, index: u32, count: u32, limit: u32) -> (u32, u32) {
        let overlap_tl = if index > 0 { self.overlap } else { 0 };
        let overlap_br = if index + 1 < count { self.overlap } else { 0 };

        let start = (index * self.tile_size).saturating_sub(overlap_tl);
        let end = ((index * self.tile_size).saturating_add(self.tile_size) + overlap_br).min(limit);
        (start, end - start)
    }
}

/// 由一张完整图片构成的金字塔（对应没有多分辨率结构的 jpg/png/tiff）
pub struct FlatImagePyramid {
    base: RgbImage,
    layout: DeepZoomLayout,
    objective: Option<f64>,
    associated: BTreeMap<String, RgbImage>,
    level_cache: HashMap<usize, RgbImage>,
}

impl FlatImagePyramid {
    pub fn new(base: RgbImage, tile_size: u32, overlap: u32) -> Self {
        let layout = DeepZoomLayout::new(base.width(), base.height(), tile_size, overlap);
        Self {
            base,
            layout,
            objective: None,
            associated: BTreeMap::new(),
            level_cache: HashMap::new(),
        }
    }

    pub fn with_objective(mut self, objective: f64) -> Self {
        self.objective = Some(objective);
        self
    }

    pub fn with_associated(mut self, name: &str, image: RgbImage) -> Self {
        self.associated.insert(name.to_string(), image);
        self
    }

    fn level_image(&mut self, level: usize) -> Option<&RgbImage> {
        let (w, h) = self.layout.level_dimensions(level)?;
        if (w, h) == self.base.dimensions() {
            return Some(&self.base);
        }
        if !self.level_cache.contains_key(&level) {
            let scaled = imageops::resize(&self.base, w, h, FilterType::Triangle);
            self.level_cache.insert(level, scaled);
        }
        self.level_cache.get(&level)
    }
}

impl PyramidReader for FlatImagePyramid {
    fn level_count(&self) -> usize {
        self.layout.level_count()
    }

    fn level_downsample(&self, level: usize) -> Option<f64> {
        self.layout.downsample(level)
    }

    fn level_tiles(&self, level: usize) -> Option<(u32, u32)> {
        self.layout.level_tiles(level)
    }

    fn level_dimensions(&self, level: usize) -> Option<(u32, u32)> {
        self.layout.level_dimensions(level)
    }

    fn get_tile(&mut self, level: usize, address: (u32, u32)) -> Result<RgbImage> {
        let fetch_error = |reason: &str| TilerError::Fetch {
            level,
            address,
            reason: reason.to_string(),
        };

        let (x, y, w, h) = self
            .layout
            .tile_region(level, address)
            .ok_or_else(|| fetch_error("address outside of tile grid"))?;
        let image = self
            .level_image(level)
            .ok_or_else(|| fetch_error("level does not exist"))?;

        Ok(imageops::crop_imm(image, x, y, w, h).to_image())
    }

    fn objective_power(&self) -> Option<f64> {
        self.objective
    }

    fn associated_names(&self) -> Vec<String> {
        self.associated.keys().cloned().collect()
    }

    fn associated(&self, name: &str) -> Result<Box<dyn PyramidReader>> {
        let image = self
            .associated
            .get(name)
            .ok_or_else(|| TilerError::AssociatedImage(name.to_string()))?;
        Ok(Box::new(FlatImagePyramid::new(
            image.clone(),
            self.layout.tile_size,
            self.layout.overlap,
        )))
    }
}

/// 默认的打开方式：用 `image` crate 解码整张图片
#[derive(Debug, Clone)]
pub struct ImageFileOpener {
    pub tile_size: u32,
    pub overlap: u32,
}

impl ImageFileOpener {
    pub fn new(tile_size: u32, overlap: u32) -> Self {
        Self { tile_size, overlap }
    }
}

impl SlideOpener for ImageFileOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn PyramidReader>> {
        let image = image::open(path).map_err(|e| match e {
            ImageError::Unsupported(u) => {
                TilerError::UnsupportedFormat(format!("{}: {}", path.display(), u))
            }
            other => TilerError::SlideOpen {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        })?;

        Ok(Box::new(FlatImagePyramid::new(
            image.to_rgb8(),
            self.tile_size,
            self.overlap,
        )))
    }
}
