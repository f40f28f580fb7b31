pub mod config_loader;
pub mod tiler_config;

pub use config_loader::{load_config_file, load_config_str, parse_config_file, parse_config_str};
pub use tiler_config::{DatasetConfig, TilerConfig, TilingConfig};
