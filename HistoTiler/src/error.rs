//! 切片流水线的错误类型

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TilerError>;

/// 流水线中可能出现的错误
///
/// 按作用范围划分：`Fetch` / `Numerical` / `Encode` 只影响单个 tile，
/// `SlideOpen` / `UnsupportedFormat` 只影响单张切片，
/// `Labeling` / `Config` 会中止整个运行。
#[derive(Error, Debug)]
pub enum TilerError {
    #[error("Failed to fetch tile {address:?} at level {level}: {reason}")]
    Fetch {
        level: usize,
        address: (u32, u32),
        reason: String,
    },

    #[error("Numerical failure during stain normalization: {0}")]
    Numerical(String),

    #[error("Failed to write {path}: {reason}")]
    Encode { path: PathBuf, reason: String },

    #[error("Failed to open slide {path}: {reason}")]
    SlideOpen { path: PathBuf, reason: String },

    #[error("Unsupported slide format: {0}")]
    UnsupportedFormat(String),

    #[error("Associated image '{0}' not found")]
    AssociatedImage(String),

    #[error("Labeling error: {0}")]
    Labeling(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Job queue disconnected")]
    QueueDisconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl TilerError {
    pub fn numerical<S: Into<String>>(msg: S) -> Self {
        Self::Numerical(msg.into())
    }

    pub fn labeling<S: Into<String>>(msg: S) -> Self {
        Self::Labeling(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    pub fn evaluation<S: Into<String>>(msg: S) -> Self {
        Self::Evaluation(msg.into())
    }

    /// 该错误是否应当中止整个运行
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Labeling(_) | Self::Config(_))
    }
}
