//! Utility modules for the hashtree engine.

pub mod errors;
pub mod logger;

pub use errors::{HashtreeError, Result};
