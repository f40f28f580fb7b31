use histo_tiler::config::{DatasetConfig, TilerConfig, TilingConfig};
use histo_tiler::dataset::DatasetBuilder;
use histo_tiler::pipeline::{
    FlatImagePyramid, PyramidReader, SlideOpener, SlideTask, SlideTilingCoordinator,
};
use crossbeam_channel::unbounded;
use histo_tiler::{Result, TilerError};
use image::{Rgb, RgbImage};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

fn tissue_image(seed: u32) -> RgbImage {
    RgbImage::from_fn(64, 64, |x, y| {
        let v = ((x * 7 + y * 13 + seed * 5) % 150) as u8;
        Rgb([60 + v, 30 + v / 2, 90 + v / 3])
    })
}

/// 按文件名生成图像的切片读取器：`white*` 为纯白，`broken*` 打不开
struct SyntheticOpener;

impl SlideOpener for SyntheticOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn PyramidReader>> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        if stem.starts_with("broken") {
            return Err(TilerError::SlideOpen {
                path: path.to_path_buf(),
                reason: "corrupt header".to_string(),
            });
        }
        let image = if stem.starts_with("white") {
            RgbImage::from_pixel(64, 64, Rgb([255, 255, 255]))
        } else {
            tissue_image(stem.len() as u32)
        };
        Ok(Box::new(FlatImagePyramid::new(image, 32, 0).with_objective(20.0)))
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: TilerConfig,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("slides");
    std::fs::create_dir_all(&input).unwrap();
    for id in ["s1", "s2", "s3", "white1", "broken1"] {
        std::fs::write(input.join(format!("{}.tiff", id)), b"").unwrap();
    }

    let label_file = dir.path().join("labels.txt");
    std::fs::write(&label_file, "s1 A\ns2 A\ns3 B\nwhite1 B\nbroken1 A\n").unwrap();

    let baseline = dir.path().join("baseline.png");
    tissue_image(0).save(&baseline).unwrap();

    let config = TilerConfig {
        tiling: TilingConfig {
            tile_size: 32,
            format: "png".to_string(),
            workers: 2,
            background_percent: 50.0,
            baseline_image: baseline,
            ..TilingConfig::default()
        },
        dataset: DatasetConfig {
            input_dir: input,
            slide_extension: "tiff".to_string(),
            output_dir: dir.path().join("tiles"),
            label_file,
            validation_split: 0.0,
            augment: true,
            seed: Some(3),
        },
        labels: BTreeMap::from([("A".to_string(), 0), ("B".to_string(), 1)]),
    }
    .validate()
    .unwrap();

    Fixture { _dir: dir, config }
}

fn files_under(dir: &Path) -> BTreeSet<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect()
}

#[test]
fn test_dataset_build_and_rerun() {
    let fixture = fixture();
    let output = fixture.config.dataset.output_dir.clone();
    let builder = DatasetBuilder::new(fixture.config.clone(), Arc::new(SyntheticOpener));

    let first = builder.run().unwrap();

    let counts = first.train.class_counts();
    assert_eq!(first.skipped.len(), 1);
    assert_eq!(first.skipped[0].slide_id, "broken1");
    assert!(first.validation.total_tiles() == 0);

    // 每张组织切片 2x2 个 tile；白色切片全部被过滤
    assert_eq!(first.plan["A"].tile_count, 8);
    assert_eq!(first.plan["B"].tile_count, 4);
    assert_eq!(first.plan["B"].factor, 8);
    assert_eq!(first.plan["A"].factor, 4);
    assert_eq!(counts["A"], 8 * 4);
    assert_eq!(counts["B"], 4 * 8);
    assert_eq!(first.train.tiles("B", "white1"), Some(&[][..]));
    assert!(output.join("A/s1/s1_0_0.png").is_file());
    assert!(output.join("A/s1/s1_0_0_270.png").is_file());
    assert!(output.join("B/s3/s3_1_1_270_mirror.png").is_file());

    let files_after_first = files_under(&output);

    let second = builder.run().unwrap();
    assert_eq!(second.train, first.train);
    assert_eq!(second.augmentation.written, 0);
    assert_eq!(files_under(&output), files_after_first);
}

#[test]
fn test_rerun_enqueues_no_jobs() {
    let fixture = fixture();
    let tiling = fixture.config.tiling.clone();
    let baseline = Arc::new(image::open(&tiling.baseline_image).unwrap().to_rgb8());
    let coordinator = SlideTilingCoordinator::new(tiling, Arc::new(SyntheticOpener), baseline);

    let task = SlideTask {
        slide_id: "s1".to_string(),
        slide_path: fixture.config.dataset.input_dir.join("s1.tiff"),
        output_dir: fixture.config.dataset.output_dir.join("A/s1"),
    };

    let (tx, rx) = unbounded();
    let first = coordinator.tile_slide(&task, &tx).unwrap();
    assert_eq!(first.enqueued, 4);
    assert_eq!(rx.try_iter().count(), 5);
    let produced = files_under(&task.output_dir);
    assert_eq!(produced.len(), 4);

    let (tx, rx) = unbounded();
    let second = coordinator.tile_slide(&task, &tx).unwrap();
    assert_eq!(second.enqueued, 0);
    assert_eq!(second.already_present, 4);
    // 4 个已有 tile + 结束标记
    assert_eq!(rx.try_iter().count(), 5);
    assert_eq!(files_under(&task.output_dir), produced);
}
