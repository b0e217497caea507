//! Configuration constants and per-resource options.

mod constants;
mod options;

pub use constants::*;
pub use options::ResourceOptions;
