//! 切片级 ROC-AUC
//!
//! 训练层按 tile 给出预测，这里先按切片取平均，再计算多类 one-vs-rest AUC。

use crate::error::{Result, TilerError};
use ndarray::{Array1, Array2, ArrayView1};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

pub const TRAIN_AUC_TAG: &str = "train slide-level ROC-AUC";
pub const VALIDATION_AUC_TAG: &str = "validation slide-level ROC-AUC";

/// 单个 tile 的预测
#[derive(Debug, Clone, PartialEq)]
pub struct TilePrediction {
    pub slide_id: String,
    pub prediction: Vec<f64>,
    /// one-hot 标签
    pub label: Vec<f64>,
}

/// 按切片聚合后的矩阵，行顺序与 `slide_ids` 一致（按 id 排序）
#[derive(Debug, Clone)]
pub struct SlidePredictions {
    pub slide_ids: Vec<String>,
    pub predictions: Array2<f64>,
    pub labels: Array2<f64>,
}

pub fn aggregate_to_slides(tiles: &[TilePrediction]) -> Result<SlidePredictions> {
    let Some(first) = tiles.first() else {
        return Err(TilerError::evaluation("no predictions to aggregate"));
    };
    let classes = first.prediction.len();

    // slide -> (预测之和, 标签之和, tile 数)
    let mut groups: BTreeMap<&str, (Array1<f64>, Array1<f64>, usize)> = BTreeMap::new();
    for tile in tiles {
        if tile.prediction.len() != classes || tile.label.len() != classes {
            return Err(TilerError::evaluation(format!(
                "tile of {} has {} predictions and {} labels, expected {}",
                tile.slide_id,
                tile.prediction.len(),
                tile.label.len(),
                classes
            )));
        }
        let entry = groups
            .entry(tile.slide_id.as_str())
            .or_insert_with(|| (Array1::zeros(classes), Array1::zeros(classes), 0));
        entry.0 += &ArrayView1::from(&tile.prediction);
        entry.1 += &ArrayView1::from(&tile.label);
        entry.2 += 1;
    }

    let mut slide_ids = Vec::with_capacity(groups.len());
    let mut predictions = Array2::zeros((groups.len(), classes));
    let mut labels = Array2::zeros((groups.len(), classes));
    for (row, (slide, (pred, label, count))) in groups.into_iter().enumerate() {
        slide_ids.push(slide.to_string());
        predictions.row_mut(row).assign(&(pred / count as f64));
        labels.row_mut(row).assign(&(label / count as f64));
    }

    Ok(SlidePredictions {
        slide_ids,
        predictions,
        labels,
    })
}

/// 二分类 AUC，并列分数取平均秩
pub fn binary_auc(scores: ArrayView1<f64>, positives: &[bool]) -> Result<f64> {
    let n_pos = positives.iter().filter(|p| **p).count();
    let n_neg = positives.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return Err(TilerError::evaluation(
            "only one class present in labels, ROC AUC is undefined",
        ));
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*a].total_cmp(&scores[*b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && scores[order[end + 1]] == scores[order[start]] {
            end += 1;
        }
        // 秩从 1 开始
        let rank = (start + end) as f64 / 2.0 + 1.0;
        for &i in &order[start..=end] {
            ranks[i] = rank;
        }
        start = end + 1;
    }

    let positive_rank_sum: f64 = ranks
        .iter()
        .zip(positives)
        .filter(|(_, p)| **p)
        .map(|(r, _)| r)
        .sum();
    let n_pos = n_pos as f64;
    Ok((positive_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg as f64))
}

/// 各类别 one-vs-rest AUC 的宏平均
///
/// 标签取值大于 0.5 视为正类。
pub fn roc_auc_ovr(labels: &Array2<f64>, predictions: &Array2<f64>) -> Result<f64> {
    if labels.dim() != predictions.dim() {
        return Err(TilerError::evaluation(format!(
            "labels {:?} and predictions {:?} differ in shape",
            labels.dim(),
            predictions.dim()
        )));
    }
    let classes = labels.ncols();
    if classes == 0 {
        return Err(TilerError::evaluation("no classes"));
    }

    let mut total = 0.0;
    for class in 0..classes {
        let positives: Vec<bool> = labels.column(class).iter().map(|v| *v > 0.5).collect();
        total += binary_auc(predictions.column(class), &positives)?;
    }
    Ok(total / classes as f64)
}

pub fn slide_level_auc(tiles: &[TilePrediction]) -> Result<f64> {
    let slides = aggregate_to_slides(tiles)?;
    roc_auc_ovr(&slides.labels, &slides.predictions)
}

/// 标量指标的去向
pub trait MetricsSink {
    fn scalar(&mut self, tag: &str, step: usize, value: f64) -> Result<()>;
}

/// 以 `tag,step,value` 行写入 CSV
pub struct CsvMetricsSink {
    writer: csv::Writer<File>,
}

impl CsvMetricsSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
        writer
            .write_record(["tag", "step", "value"])
            .map_err(csv_error)?;
        writer.flush()?;
        Ok(Self { writer })
    }
}

impl MetricsSink for CsvMetricsSink {
    fn scalar(&mut self, tag: &str, step: usize, value: f64) -> Result<()> {
        let step = step.to_string();
        let value = value.to_string();
        self.writer
            .write_record([tag, step.as_str(), value.as_str()])
            .map_err(csv_error)?;
        self.writer.flush()?;
        Ok(())
    }
}

fn csv_error(e: csv::Error) -> TilerError {
    TilerError::evaluation(format!("metrics csv: {}", e))
}

/// 每 K 个 epoch 计算一次训练集与验证集的切片级 AUC
pub struct SlideAucMonitor {
    every: usize,
    sink: Option<Box<dyn MetricsSink + Send>>,
}

impl SlideAucMonitor {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn MetricsSink + Send>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn is_due(&self, epoch: usize) -> bool {
        epoch % self.every == 0
    }

    /// 返回 (train, validation)，未到计算周期时返回 None
    pub fn on_epoch_end(
        &mut self,
        epoch: usize,
        train: &[TilePrediction],
        validation: &[TilePrediction],
    ) -> Result<Option<(f64, f64)>> {
        if !self.is_due(epoch) {
            return Ok(None);
        }

        let train_auc = slide_level_auc(train)?;
        let valid_auc = slide_level_auc(validation)?;

        if let Some(sink) = self.sink.as_mut() {
            sink.scalar(TRAIN_AUC_TAG, epoch, train_auc)?;
            sink.scalar(VALIDATION_AUC_TAG, epoch, valid_auc)?;
        }
        tracing::info!(
            "[SlideAucMonitor] Train slide-level ROC-AUC: {:.4}\tValidation slide-level ROC-AUC: {:.4}",
            train_auc,
            valid_auc
        );
        Ok(Some((train_auc, valid_auc)))
    }
}
