use anyhow::{Context, Result};
use clap::Parser;
use csv::Writer;
use histo_tiler::config::{parse_config_file, TilerConfig};
use histo_tiler::dataset::{DatasetBuilder, DatasetOutcome, TileDict};
use histo_tiler::logger::init_logging;
use histo_tiler::pipeline::ImageFileOpener;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 从全切片图像生成切块、染色归一化后的训练/验证数据集
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML 配置文件
    #[arg(short, long, default_value = "histo-tiler.toml")]
    config: PathBuf,

    /// 覆盖切片所在目录
    #[arg(short, long)]
    input_dir: Option<PathBuf>,

    /// 覆盖输出目录
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// 覆盖标签文件
    #[arg(long)]
    label_file: Option<PathBuf>,

    /// 覆盖参考染色基准图
    #[arg(long)]
    baseline_image: Option<PathBuf>,

    /// 每张切片的 worker 数量
    #[arg(short, long)]
    workers: Option<usize>,

    /// 目标放大倍率，0 表示所有层级
    #[arg(short, long)]
    magnification: Option<f64>,

    /// 验证集比例 [0, 1)
    #[arg(long)]
    validation_split: Option<f32>,

    /// 训练/验证划分的随机种子
    #[arg(long)]
    seed: Option<u64>,

    /// 不做旋转/镜像增广
    #[arg(long)]
    no_augment: bool,

    /// 同时保存二值 mask
    #[arg(long)]
    save_masks: bool,

    /// 日志目录，默认为输出目录
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// 跳过确认提示，直接开始处理
    #[arg(short, long)]
    yes: bool,
}

fn apply_overrides(mut config: TilerConfig, cli: &Cli) -> TilerConfig {
    if let Some(dir) = &cli.input_dir {
        config.dataset.input_dir = dir.clone();
    }
    if let Some(dir) = &cli.output_dir {
        config.dataset.output_dir = dir.clone();
    }
    if let Some(file) = &cli.label_file {
        config.dataset.label_file = file.clone();
    }
    if let Some(image) = &cli.baseline_image {
        config.tiling.baseline_image = image.clone();
    }
    if let Some(workers) = cli.workers {
        config.tiling.workers = workers;
    }
    if let Some(magnification) = cli.magnification {
        config.tiling.target_magnification = magnification;
    }
    if let Some(split) = cli.validation_split {
        config.dataset.validation_split = split;
    }
    if cli.seed.is_some() {
        config.dataset.seed = cli.seed;
    }
    if cli.no_augment {
        config.dataset.augment = false;
    }
    if cli.save_masks {
        config.tiling.save_masks = true;
    }
    config
}

fn print_summary(config: &TilerConfig) {
    let tiling = &config.tiling;
    let dataset = &config.dataset;

    println!("--- 数据集生成配置 ---");
    println!("切片目录: {} (*.{})", dataset.input_dir.display(), dataset.slide_extension);
    println!("输出目录: {}", dataset.output_dir.display());
    println!("标签文件: {}", dataset.label_file.display());
    println!("标签: {:?}", config.labels);
    println!("\n--- 切块 ---");
    println!("tile 尺寸: {} (overlap {})", tiling.tile_size, tiling.overlap);
    println!("输出格式: {} (质量 {})", tiling.format, tiling.quality);
    if tiling.target_magnification > 0.0 {
        println!("目标倍率: {}x", tiling.target_magnification);
    } else {
        println!("目标倍率: 所有层级");
    }
    println!("背景上限: {}%", tiling.background_percent);
    if let Some(dir) = &tiling.roi_mask_dir {
        println!("ROI mask: {} (下限 {}%)", dir.display(), tiling.roi_percent);
    }
    println!("worker 数量: {}", tiling.workers);
    println!("参考基准图: {}", tiling.baseline_image.display());
    println!("\n--- 数据集 ---");
    println!("验证集比例: {}", dataset.validation_split);
    println!("数据增强 (旋转/镜像): {}", if dataset.augment { "是" } else { "否" });
    println!("保存 mask: {}", if tiling.save_masks { "是" } else { "否" });
    println!("-------------------------\n");
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = parse_config_file(&cli.config)
        .with_context(|| format!("无法加载配置文件 {}", cli.config.display()))?;
    let config = apply_overrides(config, &cli);

    // 校验过程中的自动调整需要写进日志，所以先初始化日志
    let log_dir = cli
        .log_dir
        .clone()
        .unwrap_or_else(|| config.dataset.output_dir.clone());
    init_logging(log_dir);
    tracing::info!(
        "[slide-datagen] Configuration loaded from {} with {} labels",
        cli.config.display(),
        config.labels.len()
    );

    let config = config.validate()?;
    print_summary(&config);

    if !cli.yes {
        print!("是否继续? (y/N): ");
        io::stdout().flush()?;
        let mut response = String::new();
        io::stdin().read_line(&mut response)?;
        if response.trim().to_lowercase() != "y" {
            println!("操作已取消。");
            return Ok(());
        }
    }

    let output_dir = config.dataset.output_dir.clone();
    let opener = ImageFileOpener::new(config.tiling.tile_size, config.tiling.overlap);
    let builder = DatasetBuilder::new(config, Arc::new(opener));

    let outcome = builder.run().context("数据集生成失败")?;

    let index_path = output_dir.join("dataset_index.csv");
    let rows = write_index(&index_path, &outcome)?;
    report(&outcome);
    tracing::info!(
        "[slide-datagen] Wrote {} entries to {}",
        rows,
        index_path.display()
    );

    Ok(())
}

/// 写出 `split,label,slide,tile_path`
fn write_index(path: &Path, outcome: &DatasetOutcome) -> Result<usize> {
    let mut writer = Writer::from_path(path).context("无法创建CSV索引文件")?;
    writer.write_record(["split", "label", "slide", "tile_path"])?;

    let mut rows = 0;
    for (split, tiles) in [("train", &outcome.train), ("validation", &outcome.validation)] {
        rows += write_split(&mut writer, split, tiles)?;
    }
    writer.flush()?;
    Ok(rows)
}

fn write_split<W: Write>(writer: &mut Writer<W>, split: &str, tiles: &TileDict) -> Result<usize> {
    let mut rows = 0;
    for (label, slide, path) in tiles.flatten() {
        let path = path.to_string_lossy().into_owned();
        writer.write_record([split, label, slide, path.as_str()])?;
        rows += 1;
    }
    Ok(rows)
}

fn report(outcome: &DatasetOutcome) {
    for (label, count) in outcome.train.class_counts() {
        let factor = outcome.plan.get(&label).map_or(1, |c| c.factor);
        tracing::info!(
            "[slide-datagen] train {}: {} tiles (factor {})",
            label,
            count,
            factor
        );
    }
    for (label, count) in outcome.validation.class_counts() {
        tracing::info!("[slide-datagen] validation {}: {} tiles", label, count);
    }
    tracing::info!(
        "[slide-datagen] Augmentation: {} written, {} already present, {} failed",
        outcome.augmentation.written,
        outcome.augmentation.already_present,
        outcome.augmentation.failed
    );
    for skipped in &outcome.skipped {
        tracing::warn!(
            "[slide-datagen] Skipped {}: {}",
            skipped.slide_id,
            skipped.reason
        );
    }
}
