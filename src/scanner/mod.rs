//! Content scanner.
//!
//! Walks a directory tree and computes a content hash for every regular
//! file reachable under it. Unreadable files never abort the scan; they are
//! surfaced as collected warnings.

use crate::hash::{hash_file, ContentHash};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// A file the scanner could not read, with the reason.
#[derive(Debug)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub error: std::io::Error,
}

/// Result of scanning a directory tree.
///
/// `files` maps absolute path to content hash; keys never collide because
/// paths are unique by construction.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub files: BTreeMap<PathBuf, ContentHash>,
    pub warnings: Vec<ScanWarning>,
}

impl ScanOutcome {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Scan a directory tree, hashing every regular file.
///
/// # Arguments
/// * `root` - Root directory to start walking from
///
/// # Returns
/// * `Ok(ScanOutcome)` - Hashes for all readable files plus warnings
/// * `Err(io::Error)` - If the root itself cannot be walked
pub fn scan(root: &Path) -> std::io::Result<ScanOutcome> {
    let mut outcome = ScanOutcome::default();

    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // An unreadable subdirectory is a local problem, not a scan
                // failure. The root itself failing to read is fatal.
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                if path == root {
                    return Err(e.into());
                }
                warn!("Skipping unreadable entry {}: {}", path.display(), e);
                outcome.warnings.push(ScanWarning {
                    path,
                    error: e.into(),
                });
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path().to_path_buf();
        match hash_file(&path) {
            Ok(hash) => {
                outcome.files.insert(path, hash);
            }
            Err(e) => {
                warn!("Skipping unreadable file {}: {}", path.display(), e);
                outcome.warnings.push(ScanWarning { path, error: e });
            }
        }
    }

    Ok(outcome)
}
