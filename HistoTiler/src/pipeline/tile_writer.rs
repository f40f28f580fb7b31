use crate::error::{Result, TilerError};
use crate::pipeline::tile_filter::{tissue_mask, to_gray};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageFormat, RgbImage};
use ndarray::Array2;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// mask 像素高于该值视为前景
const MASK_THRESHOLD: u8 = 10;

/// 按配置的格式与质量写出 tile 和 mask
#[derive(Debug, Clone, Copy)]
pub struct TileWriter {
    pub quality: u8,
}

impl TileWriter {
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }

    pub fn write_tile(&self, tile: &RgbImage, path: &Path, format: &str) -> Result<()> {
        let encode_error = |reason: String| TilerError::Encode {
            path: path.to_path_buf(),
            reason,
        };

        let image_format = ImageFormat::from_extension(format)
            .ok_or_else(|| encode_error(format!("unknown format '{}'", format)))?;
        ensure_parent(path)?;

        if image_format == ImageFormat::Jpeg {
            let file = File::create(path)?;
            let mut writer = BufWriter::new(file);
            JpegEncoder::new_with_quality(&mut writer, self.quality)
                .encode_image(tile)
                .map_err(|e| encode_error(e.to_string()))?;
        } else {
            tile.save_with_format(path, image_format)
                .map_err(|e| encode_error(e.to_string()))?;
        }
        Ok(())
    }

    pub fn write_mask(&self, mask: &GrayImage, path: &Path, format: &str) -> Result<()> {
        let image_format = ImageFormat::from_extension(format).ok_or_else(|| TilerError::Encode {
            path: path.to_path_buf(),
            reason: format!("unknown format '{}'", format),
        })?;
        ensure_parent(path)?;
        mask.save_with_format(path, image_format)
            .map_err(|e| TilerError::Encode {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// 生成与 tile 同尺寸的 0/255 mask
///
/// 有 ROI 片段时使用 ROI（放大到 tile 尺寸），否则使用组织区域。
pub fn binarize_mask(roi_patch: Option<&Array2<f32>>, tile: &RgbImage) -> GrayImage {
    let (width, height) = tile.dimensions();
    match roi_patch.filter(|p| !p.is_empty()) {
        Some(patch) => {
            let max = patch.iter().copied().fold(0.0f32, f32::max);
            let scale = if max > 0.0 { 255.0 / max } else { 0.0 };
            let (rows, cols) = patch.dim();
            let small = GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
                image::Luma([(patch[[y as usize, x as usize]] * scale).clamp(0.0, 255.0) as u8])
            });
            let mut resized = imageops::resize(&small, width, height, FilterType::Nearest);
            for v in resized.iter_mut() {
                *v = if *v > MASK_THRESHOLD { 255 } else { 0 };
            }
            resized
        }
        None => tissue_mask(&to_gray(tile)),
    }
}
