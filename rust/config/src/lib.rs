//! Configuration types shared between the AutoML crates.

mod build;
mod types;

pub use build::*;
pub use types::*;
