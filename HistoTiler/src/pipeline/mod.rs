pub mod deep_zoom;
pub mod image_tiler;
pub mod job_queue;
pub mod pyramid;
pub mod roi_mask;
pub mod slide_coordinator;
pub mod sparse_coding;
pub mod stain_normalizer;
pub mod task_meta;
pub mod tile_filter;
pub mod tile_worker;
pub mod tile_writer;

pub use deep_zoom::{DeepZoomLayout, FlatImagePyramid, ImageFileOpener};
pub use image_tiler::{ImageTiler, TilingStats};
pub use pyramid::{ImageKind, PyramidReader, SlideOpener};
pub use slide_coordinator::{load_baseline, SlideTask, SlideTilingCoordinator};
pub use stain_normalizer::{StainDictionary, StainNormalizer};
pub use task_meta::{TileCommand, TileJob, TileResult};
pub use tile_filter::{FilterDecision, TileFilter};
