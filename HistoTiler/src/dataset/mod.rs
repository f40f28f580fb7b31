pub mod augmentation;
pub mod builder;
pub mod labels;
pub mod split;
pub mod tile_dict;

pub use augmentation::{compute_plan, AugmentationEngine, AugmentationPlan, AugmentationReport, ClassAugmentation};
pub use builder::{DatasetBuilder, DatasetOutcome, SkippedSlide};
pub use labels::{scan_slides, LabelIndex, SlideFile};
pub use split::{train_valid_split, SlideSplit};
pub use tile_dict::TileDict;
