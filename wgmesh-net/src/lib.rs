pub mod allocator;
pub mod audit;
pub mod config;
pub mod downsample;
pub mod error;
pub mod ifname;
pub mod locks;
pub mod model;
pub mod render;
pub mod sampler;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod test_util;
pub mod validation;
pub mod wg;

pub use error::{Error, Result};
