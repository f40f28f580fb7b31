//! Vahadane 染色归一化
//!
//! 在光密度（OD）空间中用两个非负原子描述 H&E 两种染料，tile 的浓度由
//! 非负 lasso 求出，再用参考字典重建像素。

use crate::error::{Result, TilerError};
use crate::pipeline::sparse_coding::{lasso_nonneg, DictionaryLearning};
use image::{Rgb, RgbImage};
use ndarray::{Array2, Axis};

/// 组织区域的亮度阈值（L* / 100），依次放宽
const LUMINOSITY_THRESHOLDS: [f64; 2] = [0.8, 0.9];
/// 拟合字典时的稀疏正则
pub const DICTIONARY_LAMBDA: f64 = 0.1;
/// 求浓度时的稀疏正则
pub const CONCENTRATION_LAMBDA: f64 = 0.01;
/// 亮度标准化使用的分位数
pub const BRIGHTNESS_PERCENTILE: f64 = 90.0;

/// 2x3 的染色矩阵，每行一种染料在 RGB 三个通道上的 OD 载荷
///
/// 第 0 行第一通道的值总是不小于第 1 行，非零行的范数为 1。
#[derive(Debug, Clone, PartialEq)]
pub struct StainDictionary {
    rows: Array2<f64>,
}

impl StainDictionary {
    /// 规范化任意 2x3 非负矩阵：先归一化行，再按第一通道排序
    pub fn from_matrix(mut rows: Array2<f64>) -> Result<Self> {
        if rows.shape() != [2, 3] {
            return Err(TilerError::numerical(format!(
                "stain dictionary must be 2x3, got {:?}",
                rows.shape()
            )));
        }
        if rows.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(TilerError::numerical(
                "stain dictionary contains negative or non-finite values",
            ));
        }

        for mut row in rows.axis_iter_mut(Axis(0)) {
            let norm = row.dot(&row).sqrt();
            if norm > 0.0 {
                row.mapv_inplace(|v| v / norm);
            }
        }

        if rows[[0, 0]] < rows[[1, 0]] {
            let first = rows.row(0).to_owned();
            let second = rows.row(1).to_owned();
            rows.row_mut(0).assign(&second);
            rows.row_mut(1).assign(&first);
        }

        Ok(Self { rows })
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.rows
    }
}

/// 持有参考字典的归一化器，每个 worker 启动时创建一次
#[derive(Debug, Clone)]
pub struct StainNormalizer {
    reference: StainDictionary,
}

impl StainNormalizer {
    pub fn new(reference: StainDictionary) -> Self {
        Self { reference }
    }

    /// 先做亮度标准化，再从基准图拟合参考字典
    pub fn from_reference_image(reference: &RgbImage) -> Result<Self> {
        let standardized = standardize_brightness(reference);
        Ok(Self::new(fit(&standardized)?))
    }

    pub fn reference(&self) -> &StainDictionary {
        &self.reference
    }

    pub fn normalize(&self, tile: &RgbImage) -> Result<RgbImage> {
        normalize(tile, &self.reference)
    }
}

/// 从像素拟合染色字典
pub fn fit(pixels: &RgbImage) -> Result<StainDictionary> {
    if pixels.width() == 0 || pixels.height() == 0 {
        return Err(TilerError::numerical("cannot fit stain dictionary on an empty image"));
    }

    let luminance = luminance(pixels);
    let mut selected: Vec<usize> = Vec::new();
    for threshold in LUMINOSITY_THRESHOLDS {
        selected = indices_below(&luminance, threshold);
        if !selected.is_empty() {
            break;
        }
    }
    if selected.is_empty() {
        // 整张图都很亮，退化为使用全部像素
        selected = (0..luminance.len()).collect();
    }

    let od = optical_density(pixels).select(Axis(0), &selected);
    let learner = DictionaryLearning {
        lambda: DICTIONARY_LAMBDA,
        ..DictionaryLearning::default()
    };
    let dictionary = learner.fit(&od)?;
    StainDictionary::from_matrix(dictionary)
}

/// 把 tile 的染色映射到参考字典
pub fn normalize(tile: &RgbImage, reference: &StainDictionary) -> Result<RgbImage> {
    let standardized = standardize_brightness(tile);
    let source = fit(&standardized)?;

    let od = optical_density(&standardized);
    let concentrations = lasso_nonneg(source.matrix(), &od, CONCENTRATION_LAMBDA)?;
    let reconstructed = concentrations.dot(reference.matrix());

    let mut raw = Vec::with_capacity(reconstructed.len());
    for v in reconstructed.iter() {
        let value = 255.0 * (-v).exp();
        if !value.is_finite() {
            return Err(TilerError::numerical("reconstructed pixel is not finite"));
        }
        raw.push(value.clamp(0.0, 255.0) as u8);
    }

    RgbImage::from_raw(tile.width(), tile.height(), raw)
        .ok_or_else(|| TilerError::numerical("reconstructed buffer has the wrong size"))
}

/// 把所有通道值的第 90 百分位拉伸到 255
pub fn standardize_brightness(image: &RgbImage) -> RgbImage {
    let mut p = percentile(image.as_raw(), BRIGHTNESS_PERCENTILE);
    if p <= 0.0 {
        p = 1.0;
    }
    let mut out = image.clone();
    for v in out.iter_mut() {
        // 先乘后除，p 本身必须精确映射到 255
        *v = (*v as f64 * 255.0 / p).clamp(0.0, 255.0) as u8;
    }
    out
}

/// 线性插值的百分位（与 numpy 默认行为一致）
pub fn percentile(values: &[u8], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut histogram = [0usize; 256];
    for v in values {
        histogram[*v as usize] += 1;
    }

    let rank = q.clamp(0.0, 100.0) / 100.0 * (values.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let lo = nth_value(&histogram, lower);
    let hi = nth_value(&histogram, upper);
    lo + (hi - lo) * (rank - lower as f64)
}

fn nth_value(histogram: &[usize; 256], index: usize) -> f64 {
    let mut seen = 0;
    for (value, count) in histogram.iter().enumerate() {
        seen += count;
        if seen > index {
            return value as f64;
        }
    }
    255.0
}

/// (N, 3) 的光密度矩阵，OD = -ln(max(p, 1) / 255)
pub fn optical_density(image: &RgbImage) -> Array2<f64> {
    let lut: Vec<f64> = (0..=255u32)
        .map(|v| -((v.max(1) as f64) / 255.0).ln())
        .collect();
    let n = (image.width() * image.height()) as usize;
    Array2::from_shape_fn((n, 3), |(i, c)| lut[image.as_raw()[i * 3 + c] as usize])
}

/// 每个像素的 CIE L*，缩放到 [0, 1]
pub fn luminance(image: &RgbImage) -> Vec<f64> {
    let linear: Vec<f64> = (0..=255u32)
        .map(|v| {
            let c = v as f64 / 255.0;
            if c <= 0.04045 {
                c / 12.92
            } else {
                ((c + 0.055) / 1.055).powf(2.4)
            }
        })
        .collect();

    image
        .pixels()
        .map(|Rgb([r, g, b])| {
            let y = 0.212671 * linear[*r as usize]
                + 0.715160 * linear[*g as usize]
                + 0.072169 * linear[*b as usize];
            let l = if y > 0.008856 {
                116.0 * y.cbrt() - 16.0
            } else {
                903.3 * y
            };
            l / 100.0
        })
        .collect()
}

fn indices_below(values: &[f64], threshold: f64) -> Vec<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| **v < threshold)
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    const HEMATOXYLIN: [f64; 3] = [0.65, 0.70, 0.29];
    const EOSIN: [f64; 3] = [0.07, 0.99, 0.11];

    /// 合成的 H&E tile：左侧纯 H，中间纯 E，右侧混合，底部四分之一为白色背景
    fn synthetic_he_tile() -> RgbImage {
        RgbImage::from_fn(64, 64, |x, y| {
            if y >= 48 {
                return Rgb([255, 255, 255]);
            }
            let t = 0.3 + 1.2 * (y as f64 / 47.0);
            let (h, e) = match x {
                0..=15 => (t, 0.0),
                16..=31 => (0.0, t),
                _ => (t * (x as f64 - 32.0) / 31.0, t * (63.0 - x as f64) / 31.0),
            };
            let channel = |c: usize| {
                let od = h * HEMATOXYLIN[c] + e * EOSIN[c];
                (255.0 * (-od).exp()).round().clamp(0.0, 255.0) as u8
            };
            Rgb([channel(0), channel(1), channel(2)])
        })
    }

    #[test]
    fn test_dictionary_row_order_and_norm() {
        let swapped = array![[0.1, 0.9, 0.1], [0.6, 0.7, 0.3]];
        let dictionary = StainDictionary::from_matrix(swapped).unwrap();
        let m = dictionary.matrix();
        assert!(m[[0, 0]] >= m[[1, 0]]);
        for row in m.axis_iter(Axis(0)) {
            assert!((row.dot(&row).sqrt() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_dictionary_keeps_zero_rows() {
        // 第一通道相等时不交换
        let rows = array![[0.0, 0.0, 0.0], [0.0, 2.0, 0.0]];
        let dictionary = StainDictionary::from_matrix(rows).unwrap();
        assert_eq!(dictionary.matrix().row(0).to_vec(), vec![0.0, 0.0, 0.0]);
        assert_eq!(dictionary.matrix().row(1).to_vec(), vec![0.0, 1.0, 0.0]);

        let rows = array![[0.0, 0.0, 0.0], [3.0, 4.0, 0.0]];
        let dictionary = StainDictionary::from_matrix(rows).unwrap();
        assert_eq!(dictionary.matrix().row(0).to_vec(), vec![0.6, 0.8, 0.0]);
        assert_eq!(dictionary.matrix().row(1).to_vec(), vec![0.0, 0.0, 0.0]);
        assert!(StainDictionary::from_matrix(array![[1.0, 0.0, 0.0]]).is_err());
        assert!(StainDictionary::from_matrix(array![[-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]).is_err());
    }

    #[test]
    fn test_fit_orders_rows() {
        let dictionary = fit(&synthetic_he_tile()).unwrap();
        let m = dictionary.matrix();
        assert!(m[[0, 0]] >= m[[1, 0]]);
        assert!(m.iter().all(|v| *v >= 0.0));
        for row in m.axis_iter(Axis(0)) {
            let norm = row.dot(&row).sqrt();
            assert!(norm == 0.0 || (norm - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_normalize_is_near_fixed_point() {
        let tile = synthetic_he_tile();
        let reference = fit(&standardize_brightness(&tile)).unwrap();
        let out = normalize(&tile, &reference).unwrap();

        assert_eq!(out.dimensions(), tile.dimensions());
        let total: f64 = tile
            .as_raw()
            .iter()
            .zip(out.as_raw())
            .map(|(a, b)| (*a as f64 - *b as f64).abs())
            .sum();
        let mean = total / tile.as_raw().len() as f64;
        assert!(mean < 12.0, "mean abs difference {}", mean);
    }

    #[test]
    fn test_white_tile_stays_white() {
        let tile = RgbImage::from_pixel(16, 16, Rgb([255, 255, 255]));
        let baseline = synthetic_he_tile();
        let normalizer = StainNormalizer::from_reference_image(&baseline).unwrap();
        assert_eq!(
            normalizer.reference(),
            &fit(&standardize_brightness(&baseline)).unwrap()
        );
        let out = normalizer.normalize(&tile).unwrap();
        assert!(out.as_raw().iter().all(|v| *v == 255));
    }

    #[test]
    fn test_percentile_matches_linear_interpolation() {
        let values: Vec<u8> = (0..=10).collect();
        assert_eq!(percentile(&values, 90.0), 9.0);
        assert_eq!(percentile(&[0, 10], 90.0), 9.0);
        assert_eq!(percentile(&[], 90.0), 0.0);
    }

    #[test]
    fn test_standardize_brightness() {
        for level in [30u8, 70, 100, 150, 200] {
            let flat = RgbImage::from_pixel(4, 4, Rgb([level, level, level]));
            assert!(
                standardize_brightness(&flat).as_raw().iter().all(|v| *v == 255),
                "p90 {} should map to 255",
                level
            );
        }

        // p90 = 200，一半像素为 100
        let mut mixed = RgbImage::from_pixel(10, 1, Rgb([200, 200, 200]));
        for x in 0..5 {
            mixed.put_pixel(x, 0, Rgb([100, 100, 100]));
        }
        let out = standardize_brightness(&mixed);
        assert_eq!(out.get_pixel(0, 0).0, [127, 127, 127]);
        assert_eq!(out.get_pixel(9, 0).0, [255, 255, 255]);

        let black = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        assert!(standardize_brightness(&black).as_raw().iter().all(|v| *v == 0));
    }

    #[test]
    fn test_optical_density_clamps_zero() {
        let image = RgbImage::from_pixel(1, 1, Rgb([0, 255, 1]));
        let od = optical_density(&image);
        assert_eq!(od[[0, 0]], od[[0, 2]]);
        assert_eq!(od[[0, 1]], 0.0);
    }
}
