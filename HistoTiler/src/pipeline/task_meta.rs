use ndarray::Array2;
use std::path::PathBuf;

/// 一个 tile 的读取-过滤-归一化-写出任务
#[derive(Debug, Clone)]
pub struct TileJob {
    // None 表示主图，否则为 associated image 的名称
    pub associated: Option<String>,
    pub level: usize,
    // (col, row)
    pub address: (u32, u32),
    pub output_path: PathBuf,
    pub format: String,
    pub mask_path: PathBuf,
    // tile 被 ROI 覆盖的比例，没有 ROI 时为 1.0
    pub roi_fraction: f32,
    pub save_masks: bool,
    pub tile_mask: Option<Array2<f32>>,
}

/// job 队列中的消息
#[derive(Debug, Clone)]
pub enum TileCommand {
    Fetch(Box<TileJob>),
    // 每个 worker 收到一个，收到后退出
    Stop,
}

/// result 通道中的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileResult {
    Tile(PathBuf),
    // 该切片的所有结果都已发送
    Done,
}
