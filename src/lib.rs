//! Hashtree: content-addressed, deduplicating, encrypted backup and sync.
//!
//! A directory tree is scanned into a content-hash index, diffed against
//! the remote database, and only the content the remote is missing gets
//! compressed, encrypted and uploaded. Every snapshot commits a manifest
//! plus the updated database, which is all a restore needs to rebuild the
//! directory on another machine.

pub mod config;
pub mod crypto;
pub mod hash;
pub mod index;
pub mod ops;
pub mod scanner;
pub mod snapshot;
pub mod store;
pub mod transfer;
pub mod utils;

pub use config::Config;
pub use hash::ContentHash;
pub use ops::Engine;
pub use utils::{HashtreeError, Result};
