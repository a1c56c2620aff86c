//! Core types and utilities for the vision trainer.
//!
//! This crate provides the error type, run configuration, task and split
//! types, device selection and the confusion-matrix metrics shared by the
//! dataset and training crates.

pub mod error;
pub mod types;
pub mod config;
pub mod metrics;
pub mod backend;
pub mod cli;

pub use error::{Error, Result};
pub use types::*;
pub use config::*;
pub use metrics::*;
pub use backend::*;
pub use cli::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::types::*;
    pub use crate::config::*;
    pub use crate::metrics::*;
    pub use crate::backend::*;
    pub use crate::cli::*;
}
