//! Structured progress events for transfer operations.
//!
//! The pipeline reports through an explicit [`ProgressSink`] handed in at
//! construction time; host environments (CLI, UI bridges) decide how to
//! render the events.

use std::time::Duration;

/// One structured progress line from the pipeline.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// An object finished uploading.
    Uploaded {
        key: String,
        file: String,
        bytes: u64,
        elapsed: Duration,
    },
    /// An object finished downloading and verified.
    Downloaded {
        key: String,
        file: String,
        bytes: u64,
        elapsed: Duration,
    },
    /// A local file already matched the expected hash; transfer skipped.
    Verified { key: String, file: String },
    /// A job exhausted its retry budget.
    Failed {
        key: String,
        file: String,
        error: String,
    },
    /// A transfer phase finished.
    PhaseDone {
        phase: &'static str,
        succeeded: usize,
        failed: usize,
    },
}

/// Event sink for transfer progress.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: TransferEvent);
}

/// Sink that renders events as tracing log lines.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn emit(&self, event: TransferEvent) {
        match event {
            TransferEvent::Uploaded {
                key,
                file,
                bytes,
                elapsed,
            } => tracing::info!(
                "({:.2?})({}) {} => {}",
                elapsed,
                format_bytes(bytes),
                short_key(&key),
                file
            ),
            TransferEvent::Downloaded {
                key,
                file,
                bytes,
                elapsed,
            } => tracing::info!(
                "({:.2?})({}) {} => {}",
                elapsed,
                format_bytes(bytes),
                short_key(&key),
                file
            ),
            TransferEvent::Verified { key, file } => {
                tracing::info!("[V] {} => {}", short_key(&key), file)
            }
            TransferEvent::Failed { key, file, error } => {
                tracing::warn!("[F] {} => {} failed: {}", short_key(&key), file, error)
            }
            TransferEvent::PhaseDone {
                phase,
                succeeded,
                failed,
            } => tracing::info!("{phase}: {succeeded} succeeded, {failed} failed"),
        }
    }
}

/// Sink that discards everything (used by tests).
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: TransferEvent) {}
}

/// Content hashes render as their first 8 hex characters; other object keys
/// (database, snapshots) render in full.
fn short_key(key: &str) -> &str {
    if key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit()) {
        &key[..8]
    } else {
        key
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_short_key_only_for_hashes() {
        let hash = "a".repeat(64);
        assert_eq!(short_key(&hash), "aaaaaaaa");
        assert_eq!(short_key("mybucket.db"), "mybucket.db");
        // 64 chars but not hex
        let not_hex = "z".repeat(64);
        assert_eq!(short_key(&not_hex), not_hex);
    }
}
