//! 判断一个 tile 是否包含足够的组织信息
//!
//! 指标是“近白背景”像素（灰度 >= 220）的比例：比例越低，tile 越有用。

use image::{GrayImage, RgbImage};

/// 灰度达到该值即视为背景
pub const BACKGROUND_LEVEL: u8 = 220;
/// 不同灰度值的数量必须严格大于该值，否则视为空白 tile
pub const MIN_DISTINCT_LEVELS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterDecision {
    pub accepted: bool,
    /// 背景像素所占比例 [0, 1]
    pub background_fraction: f32,
    pub distinct_levels: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct TileFilter {
    /// 允许的背景比例上限 [0, 1]
    pub max_background: f32,
    /// ROI 覆盖比例下限 [0, 1]
    pub min_roi: f32,
}

impl TileFilter {
    /// 参数以百分比给出，与配置文件一致
    pub fn from_percent(background_percent: f32, roi_percent: f32) -> Self {
        Self {
            max_background: background_percent / 100.0,
            min_roi: roi_percent / 100.0,
        }
    }

    /// `roi_fraction` 为 None 时表示没有 ROI 限制
    pub fn accept(&self, tile: &RgbImage, roi_fraction: Option<f32>) -> FilterDecision {
        let gray = to_gray(tile);
        self.accept_gray(&gray, roi_fraction)
    }

    pub fn accept_gray(&self, gray: &GrayImage, roi_fraction: Option<f32>) -> FilterDecision {
        let mut histogram = [0usize; 256];
        for p in gray.as_raw() {
            histogram[*p as usize] += 1;
        }

        let total = gray.as_raw().len();
        let distinct_levels = histogram.iter().filter(|c| **c > 0).count();
        let background: usize = histogram[BACKGROUND_LEVEL as usize..].iter().sum();
        let background_fraction = if total == 0 {
            1.0
        } else {
            background as f32 / total as f32
        };

        let informative =
            distinct_levels > MIN_DISTINCT_LEVELS && background_fraction <= self.max_background;
        let inside_roi = roi_fraction.map_or(true, |f| f >= self.min_roi);

        FilterDecision {
            accepted: informative && inside_roi,
            background_fraction,
            distinct_levels,
        }
    }
}

/// ITU-R 601-2 亮度转换，16 位定点并四舍五入
pub fn to_gray(tile: &RgbImage) -> GrayImage {
    GrayImage::from_fn(tile.width(), tile.height(), |x, y| {
        let p = tile.get_pixel(x, y);
        let luma = (p[0] as u32 * 19595 + p[1] as u32 * 38470 + p[2] as u32 * 7471 + 0x8000) >> 16;
        image::Luma([luma as u8])
    })
}

/// 组织区域的二值图：非背景像素为 255
pub fn tissue_mask(gray: &GrayImage) -> GrayImage {
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let v = gray.get_pixel(x, y)[0];
        image::Luma([if v < BACKGROUND_LEVEL { 255 } else { 0 }])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    /// 前 `tissue_rows` 行为渐变组织色，其余为纯白
    fn half_tissue_tile(size: u32, tissue_rows: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            if y < tissue_rows {
                let v = (60 + (x * 3 + y) % 120) as u8;
                Rgb([v, v / 2 + 20, v])
            } else {
                Rgb([255, 255, 255])
            }
        })
    }

    #[test]
    fn test_white_tile_rejected() {
        let tile = RgbImage::from_pixel(64, 64, Rgb([255, 255, 255]));
        let decision = TileFilter::from_percent(100.0, 0.0).accept(&tile, None);
        assert!(!decision.accepted);
        assert_eq!(decision.distinct_levels, 1);
        assert_eq!(decision.background_fraction, 1.0);
    }

    #[test]
    fn test_flat_dark_tile_rejected() {
        let tile = RgbImage::from_pixel(64, 64, Rgb([90, 40, 120]));
        let decision = TileFilter::from_percent(100.0, 0.0).accept(&tile, None);
        assert!(!decision.accepted);
        assert_eq!(decision.background_fraction, 0.0);
    }

    #[test]
    fn test_background_threshold_boundary() {
        // 一半组织、一半背景
        let tile = half_tissue_tile(100, 50);

        let at_half = TileFilter::from_percent(50.0, 0.0).accept(&tile, None);
        assert_eq!(at_half.background_fraction, 0.5);
        assert!(at_half.accepted);

        let below_half = TileFilter::from_percent(49.0, 0.0).accept(&tile, None);
        assert!(!below_half.accepted);
    }

    #[test]
    fn test_roi_fraction() {
        let tile = half_tissue_tile(100, 80);
        let filter = TileFilter::from_percent(50.0, 40.0);

        assert!(filter.accept(&tile, None).accepted);
        assert!(filter.accept(&tile, Some(0.4)).accepted);
        assert!(!filter.accept(&tile, Some(0.39)).accepted);
    }

    #[test]
    fn test_to_gray_weights() {
        let tile = RgbImage::from_pixel(1, 1, Rgb([255, 0, 0]));
        assert_eq!(to_gray(&tile).get_pixel(0, 0)[0], 76);
        let white = RgbImage::from_pixel(1, 1, Rgb([255, 255, 255]));
        assert_eq!(to_gray(&white).get_pixel(0, 0)[0], 255);
    }

    #[test]
    fn test_to_gray_rounds_at_background_level() {
        // 220.38 四舍五入后正好落在背景阈值上
        let tile = RgbImage::from_pixel(1, 1, Rgb([220, 220, 219]));
        assert_eq!(to_gray(&tile).get_pixel(0, 0)[0], BACKGROUND_LEVEL);
        let decision = TileFilter::from_percent(100.0, 0.0).accept(&tile, None);
        assert_eq!(decision.background_fraction, 1.0);
    }
}
