pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod logger;
pub mod pipeline;

pub use error::{Result, TilerError};
