//! 切片级 ROI mask
//!
//! mask 是一张灰度图（`<dir>/<slide-id>mask.jpg`），分辨率可以与切片不同，
//! 按比例映射到每一层的 tile 区域上。

use crate::error::{Result, TilerError};
use image::GrayImage;
use ndarray::{s, Array2};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RoiMask {
    // (height, width)，取值 [0, 1]
    values: Array2<f32>,
}

impl RoiMask {
    /// `<dir>/<slide-id>mask.jpg`，不存在时返回 None
    pub fn locate(dir: &Path, slide_id: &str) -> Option<PathBuf> {
        let path = dir.join(format!("{}mask.jpg", slide_id));
        path.is_file().then_some(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let image = image::open(path).map_err(|e| TilerError::SlideOpen {
            path: path.to_path_buf(),
            reason: format!("cannot read ROI mask: {}", e),
        })?;
        Ok(Self::from_gray(&image.to_luma8()))
    }

    /// 先减去最小值，再除以最大值
    pub fn from_gray(gray: &GrayImage) -> Self {
        let (width, height) = gray.dimensions();
        let mut values = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            gray.get_pixel(x as u32, y as u32)[0] as f32
        });

        let min = values.iter().copied().fold(f32::MAX, f32::min);
        values.mapv_inplace(|v| v - min);
        let max = values.iter().copied().fold(0.0, f32::max);
        if max > 0.0 {
            values.mapv_inplace(|v| v / max);
        }
        Self { values }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.values.ncols() as u32, self.values.nrows() as u32)
    }

    /// 计算某一层中 tile 区域 (x, y, w, h) 对应的 mask 片段
    ///
    /// 返回 (覆盖比例, 片段)
    pub fn tile_coverage(
        &self,
        level_dimensions: (u32, u32),
        region: (u32, u32, u32, u32),
    ) -> (f32, Array2<f32>) {
        let (mask_w, mask_h) = self.dimensions();
        let (level_w, level_h) = level_dimensions;
        if mask_w == 0 || mask_h == 0 || level_w == 0 || level_h == 0 {
            return (0.0, Array2::zeros((0, 0)));
        }

        let sx = mask_w as f64 / level_w as f64;
        let sy = mask_h as f64 / level_h as f64;
        let (x, y, w, h) = region;

        let span = |start: u32, len: u32, scale: f64, limit: u32| {
            let lo = ((start as f64 * scale).floor() as u32).min(limit - 1);
            let hi = (((start + len) as f64 * scale).ceil() as u32).clamp(lo + 1, limit);
            (lo as usize, hi as usize)
        };
        let (x0, x1) = span(x, w, sx, mask_w);
        let (y0, y1) = span(y, h, sy, mask_h);

        let patch = self.values.slice(s![y0..y1, x0..x1]).to_owned();
        let fraction = patch.mean().unwrap_or(0.0);
        (fraction, patch)
    }
}
