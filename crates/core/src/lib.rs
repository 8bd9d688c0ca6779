pub mod config;
pub mod error;
pub mod experts;
pub mod moe;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{InputShape, MoELayerConfig, SublayerType};
pub use error::{MoEError, Result};
pub use moe::{DispatchReport, MoELayer, Workspace};
