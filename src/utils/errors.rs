//! Custom error types for the hashtree engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HashtreeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store error: {0}")]
    Store(#[from] opendal::Error),

    #[error("Checksum mismatch for {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Local file {0} differs from remote version (pass --nuke to overwrite)")]
    LocalFileConflict(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Object is tampered: ciphertext length inconsistent with chunk format")]
    TamperedObject,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transfer failed for {failed} of {total} objects")]
    PartialTransfer { failed: usize, total: usize },
}

impl HashtreeError {
    /// Connection-class store failures cannot be fixed by retrying another
    /// job, so the pipeline aborts the remaining batch when it sees one.
    pub fn is_connection(&self) -> bool {
        match self {
            HashtreeError::Store(e) => matches!(
                e.kind(),
                opendal::ErrorKind::ConfigInvalid | opendal::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, HashtreeError>;
