//! 两个原子的非负稀疏编码与字典学习
//!
//! 目标函数（对每个样本 x）：
//!
//! ```text
//! min_a  0.5 * ||x - D^T a||^2 + lambda * sum(a),   a >= 0
//! ```
//!
//! 只有两个原子，所以 lasso 直接枚举支撑集 {}, {0}, {1}, {0,1} 求精确解，
//! 字典更新使用块坐标下降，原子约束为非负且范数不超过 1。

use crate::error::{Result, TilerError};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const ATOMS: usize = 2;
const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct DictionaryLearning {
    pub lambda: f64,
    pub max_iter: usize,
    /// 参与训练的最大样本数，超过时随机抽样
    pub max_samples: usize,
    pub tolerance: f64,
    pub seed: u64,
}

impl Default for DictionaryLearning {
    fn default() -> Self {
        Self {
            lambda: 0.1,
            max_iter: 200,
            max_samples: 6000,
            tolerance: 1e-6,
            seed: 0x5eed,
        }
    }
}

/// 对每一行样本求非负 lasso 编码
///
/// * `dictionary` - (2, C)，每行一个原子
/// * `samples` - (N, C)
///
/// 返回 (N, 2)
pub fn lasso_nonneg(dictionary: &Array2<f64>, samples: &Array2<f64>, lambda: f64) -> Result<Array2<f64>> {
    if dictionary.nrows() != ATOMS || dictionary.ncols() != samples.ncols() {
        return Err(TilerError::numerical(format!(
            "dictionary shape {:?} does not match samples with {} channels",
            dictionary.shape(),
            samples.ncols()
        )));
    }

    let gram = dictionary.dot(&dictionary.t());
    let g = [[gram[[0, 0]], gram[[0, 1]]], [gram[[1, 0]], gram[[1, 1]]]];

    let mut codes = Array2::<f64>::zeros((samples.nrows(), ATOMS));
    for (x, mut code) in samples.axis_iter(Axis(0)).zip(codes.axis_iter_mut(Axis(0))) {
        let c = [dictionary.row(0).dot(&x), dictionary.row(1).dot(&x)];
        let a = solve_two_atoms(&g, &c, lambda);
        code[0] = a[0];
        code[1] = a[1];
    }

    if codes.iter().any(|v| !v.is_finite()) {
        return Err(TilerError::numerical("lasso produced non-finite coefficients"));
    }
    Ok(codes)
}

fn solve_two_atoms(g: &[[f64; 2]; 2], c: &[f64; 2], lambda: f64) -> [f64; 2] {
    // 去掉常数项后的目标函数
    let objective = |a: [f64; 2]| {
        0.5 * (a[0] * a[0] * g[0][0] + 2.0 * a[0] * a[1] * g[0][1] + a[1] * a[1] * g[1][1])
            - (a[0] * c[0] + a[1] * c[1])
            + lambda * (a[0] + a[1])
    };

    let mut best = [0.0, 0.0];
    let mut best_value = 0.0;
    let mut consider = |a: [f64; 2]| {
        let value = objective(a);
        if value < best_value {
            best = a;
            best_value = value;
        }
    };

    for j in 0..ATOMS {
        if g[j][j] > EPS {
            let v = (c[j] - lambda) / g[j][j];
            if v > 0.0 {
                let mut a = [0.0, 0.0];
                a[j] = v;
                consider(a);
            }
        }
    }

    let det = g[0][0] * g[1][1] - g[0][1] * g[1][0];
    if det.abs() > EPS {
        let r0 = c[0] - lambda;
        let r1 = c[1] - lambda;
        let a0 = (g[1][1] * r0 - g[0][1] * r1) / det;
        let a1 = (g[0][0] * r1 - g[1][0] * r0) / det;
        if a0 > 0.0 && a1 > 0.0 {
            consider([a0, a1]);
        }
    }

    best
}

impl DictionaryLearning {
    /// 从样本 (N, C) 学习 (2, C) 的非负字典
    pub fn fit(&self, samples: &Array2<f64>) -> Result<Array2<f64>> {
        if samples.nrows() == 0 {
            return Err(TilerError::numerical("no samples for dictionary learning"));
        }
        if samples.iter().any(|v| !v.is_finite()) {
            return Err(TilerError::numerical("non-finite optical density values"));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let data = subsample(samples, self.max_samples, &mut rng);
        let n = data.nrows();

        let mut dictionary = Array2::<f64>::zeros((ATOMS, data.ncols()));
        let (first, second) = extreme_samples(&data)
            .unwrap_or_else(|| (rng.random_range(0..n), rng.random_range(0..n)));
        dictionary.row_mut(0).assign(&unit_or_default(data.row(first)));
        dictionary.row_mut(1).assign(&unit_or_default(data.row(second)));

        for iteration in 0..self.max_iter {
            let codes = lasso_nonneg(&dictionary, &data, self.lambda)?;
            // A = codes^T codes, B = data^T codes
            let a = codes.t().dot(&codes);
            let b = data.t().dot(&codes);

            let previous = dictionary.clone();
            for j in 0..ATOMS {
                if a[[j, j]] < EPS {
                    // 未被使用的原子：换成当前残差最大的样本
                    let replacement = worst_reconstructed(&dictionary, &codes, &data);
                    dictionary.row_mut(j).assign(&unit_or_default(data.row(replacement)));
                    continue;
                }

                let reconstructed = dictionary.t().dot(&a.column(j));
                let mut update: Array1<f64> =
                    &dictionary.row(j) + &((&b.column(j) - &reconstructed) / a[[j, j]]);
                update.mapv_inplace(|v| v.max(0.0));

                let norm = update.dot(&update).sqrt();
                if norm < EPS {
                    let replacement = worst_reconstructed(&dictionary, &codes, &data);
                    dictionary.row_mut(j).assign(&unit_or_default(data.row(replacement)));
                } else {
                    dictionary.row_mut(j).assign(&(update / norm.max(1.0)));
                }
            }

            if dictionary.iter().any(|v| !v.is_finite()) {
                return Err(TilerError::numerical("dictionary update diverged"));
            }

            let change = (&dictionary - &previous)
                .iter()
                .fold(0.0f64, |m, v| m.max(v.abs()));
            if change < self.tolerance {
                tracing::trace!("[DictionaryLearning] Converged after {} iterations", iteration + 1);
                break;
            }
        }

        Ok(dictionary)
    }
}

fn subsample(samples: &Array2<f64>, max_samples: usize, rng: &mut StdRng) -> Array2<f64> {
    if samples.nrows() <= max_samples {
        return samples.clone();
    }
    let indices: Vec<usize> = (0..max_samples)
        .map(|_| rng.random_range(0..samples.nrows()))
        .collect();
    samples.select(Axis(0), &indices)
}

/// 第一通道占比最大与最小的两个样本，作为初始原子
///
/// 只考虑 OD 范数不低于中位数的样本，避免近白像素的噪声。
fn extreme_samples(data: &Array2<f64>) -> Option<(usize, usize)> {
    let norms: Vec<f64> = data.axis_iter(Axis(0)).map(|r| r.dot(&r).sqrt()).collect();
    let mut sorted = norms.clone();
    sorted.sort_by(f64::total_cmp);
    let median = sorted[sorted.len() / 2];

    let mut lowest: Option<(usize, f64)> = None;
    let mut highest: Option<(usize, f64)> = None;
    for (i, row) in data.axis_iter(Axis(0)).enumerate() {
        let total: f64 = row.iter().map(|v| v.max(0.0)).sum();
        if norms[i] < median || total < EPS {
            continue;
        }
        let share = row[0].max(0.0) / total;
        if lowest.map_or(true, |(_, v)| share < v) {
            lowest = Some((i, share));
        }
        if highest.map_or(true, |(_, v)| share > v) {
            highest = Some((i, share));
        }
    }

    match (highest, lowest) {
        (Some((hi, a)), Some((lo, b))) if a - b > 1e-6 => Some((hi, lo)),
        _ => None,
    }
}

fn unit_or_default(row: ArrayView1<f64>) -> Array1<f64> {
    let positive = row.mapv(|v| v.max(0.0));
    let norm = positive.dot(&positive).sqrt();
    if norm < EPS {
        let v = 1.0 / (row.len() as f64).sqrt();
        Array1::from_elem(row.len(), v)
    } else {
        positive / norm
    }
}

fn worst_reconstructed(dictionary: &Array2<f64>, codes: &Array2<f64>, data: &Array2<f64>) -> usize {
    let residual = data - &codes.dot(dictionary);
    residual
        .axis_iter(Axis(0))
        .map(|r| r.dot(&r))
        .enumerate()
        .fold((0, f64::MIN), |best, (i, v)| if v > best.1 { (i, v) } else { best })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_lasso_single_atom() {
        let dictionary = array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let samples = array![[2.0, 0.0, 0.0], [0.0, 0.5, 0.0], [0.0, 0.0, 3.0]];

        let codes = lasso_nonneg(&dictionary, &samples, 0.1).unwrap();
        assert!((codes[[0, 0]] - 1.9).abs() < 1e-12);
        assert_eq!(codes[[0, 1]], 0.0);
        assert!((codes[[1, 1]] - 0.4).abs() < 1e-12);
        // 与两个原子都正交的样本编码为 0
        assert_eq!(codes.row(2).to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_lasso_mixture_and_nonnegativity() {
        let dictionary = array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let samples = array![[1.0, 2.0, 0.0], [-1.0, -1.0, 0.0]];

        let codes = lasso_nonneg(&dictionary, &samples, 0.01).unwrap();
        assert!((codes[[0, 0]] - 0.99).abs() < 1e-12);
        assert!((codes[[0, 1]] - 1.99).abs() < 1e-12);
        assert_eq!(codes.row(1).to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_lasso_correlated_atoms() {
        let s = 0.5f64.sqrt();
        let dictionary = array![[1.0, 0.0, 0.0], [s, s, 0.0]];
        let samples = array![[s * 2.0, s * 2.0, 0.0]];

        let codes = lasso_nonneg(&dictionary, &samples, 0.0).unwrap();
        let rebuilt = codes.dot(&dictionary);
        for (a, b) in rebuilt.iter().zip(samples.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_lasso_shape_mismatch() {
        let dictionary = array![[1.0, 0.0], [0.0, 1.0]];
        let samples = array![[1.0, 0.0, 0.0]];
        assert!(lasso_nonneg(&dictionary, &samples, 0.1).is_err());
    }

    #[test]
    fn test_fit_recovers_two_directions() {
        // 数据由两个非负方向的非负组合构成
        let h: Array1<f64> = array![0.65, 0.70, 0.29];
        let e: Array1<f64> = array![0.07, 0.99, 0.11];
        let h: Array1<f64> = &h / h.dot(&h).sqrt();
        let e: Array1<f64> = &e / e.dot(&e).sqrt();

        let mut rows = Vec::new();
        for i in 0..40 {
            for j in 0..40 {
                let (a, b) = if (i + j) % 2 == 0 {
                    (0.2 + i as f64 * 0.05, 0.0)
                } else {
                    (0.0, 0.2 + j as f64 * 0.05)
                };
                let od = &h * a + &e * b;
                rows.extend(od.iter().copied());
            }
        }
        let samples = Array2::from_shape_vec((1600, 3), rows).unwrap();

        let dictionary = DictionaryLearning::default().fit(&samples).unwrap();
        assert!(dictionary.iter().all(|v| *v >= 0.0));

        let cosine = |atom: ArrayView1<f64>, target: &Array1<f64>| {
            atom.dot(target) / atom.dot(&atom).sqrt().max(EPS)
        };
        let best_h = (0..2).map(|k| cosine(dictionary.row(k), &h)).fold(0.0, f64::max);
        let best_e = (0..2).map(|k| cosine(dictionary.row(k), &e)).fold(0.0, f64::max);
        assert!(best_h > 0.95, "h cosine {}", best_h);
        assert!(best_e > 0.95, "e cosine {}", best_e);
    }

    #[test]
    fn test_fit_rejects_empty() {
        let samples = Array2::<f64>::zeros((0, 3));
        assert!(DictionaryLearning::default().fit(&samples).is_err());
    }
}
