pub mod slide_auc;

pub use slide_auc::{
    aggregate_to_slides, roc_auc_ovr, slide_level_auc, CsvMetricsSink, MetricsSink, SlideAucMonitor,
    SlidePredictions, TilePrediction,
};
