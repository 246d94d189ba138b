//! Snapshot manager.
//!
//! Serializes the indexes to deterministic local temp paths, uploads the
//! three artifacts that make a directory state durably restorable, and
//! removes the local temporaries on both the success and failure paths.
//! The naming scheme is a compatibility contract and must stay bit-exact.

use crate::index::{Database, DedupIndex};
use crate::transfer::{Pipeline, UploadJob};
use crate::utils::Result;
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Suffix of uploaded snapshot manifests.
pub const SNAPSHOT_SUFFIX: &str = ".hsh";

/// Suffix of database artifacts.
pub const DATABASE_SUFFIX: &str = ".db";

/// Second-resolution timestamp embedded in snapshot names. Two snapshots of
/// the same bucket within one second collide; kept for compatibility with
/// existing archives.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// Deterministic names for every snapshot artifact of one (directory,
/// bucket) pair.
#[derive(Debug, Clone)]
pub struct SnapshotNames {
    dir: PathBuf,
    bucket: String,
}

impl SnapshotNames {
    pub fn new(dir: &Path, bucket: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            bucket: bucket.to_string(),
        }
    }

    /// Local snapshot manifest: `<dir>/.<bucket>.hsh`
    pub fn local_manifest(&self) -> PathBuf {
        self.dir
            .join(format!(".{}{}", self.bucket, SNAPSHOT_SUFFIX))
    }

    /// Local database mirror: `<dir>/.<bucket>.db`
    pub fn local_database(&self) -> PathBuf {
        self.dir
            .join(format!(".{}{}", self.bucket, DATABASE_SUFFIX))
    }

    /// Canonical remote database key: `<bucket>.db`
    pub fn database_key(&self) -> String {
        format!("{}{}", self.bucket, DATABASE_SUFFIX)
    }

    /// Uploaded snapshot: `<bucket>-<YYYY-MM-DD_HH:MM:SS>.hsh`
    pub fn snapshot_key(&self, timestamp: &NaiveDateTime) -> String {
        format!(
            "{}-{}{}",
            self.bucket,
            timestamp.format(TIMESTAMP_FORMAT),
            SNAPSHOT_SUFFIX
        )
    }

    /// Uploaded database snapshot: `<bucket>-<YYYY-MM-DD_HH:MM:SS>.db`
    pub fn database_snapshot_key(&self, timestamp: &NaiveDateTime) -> String {
        format!(
            "{}-{}{}",
            self.bucket,
            timestamp.format(TIMESTAMP_FORMAT),
            DATABASE_SUFFIX
        )
    }
}

/// Result of committing a snapshot.
#[derive(Debug)]
pub struct SnapshotCommit {
    /// Remote key of the uploaded snapshot manifest.
    pub snapshot_key: String,
}

/// Serialize both indexes and upload the three snapshot artifacts: the
/// timestamped manifest, the canonical database, and a timestamped database
/// copy.
///
/// Local temporaries are deleted whether the upload succeeded or not; a
/// half-committed local state never survives a failed commit.
pub async fn commit(
    pipeline: &Pipeline,
    names: &SnapshotNames,
    index: &DedupIndex,
    db: &Database,
) -> Result<SnapshotCommit> {
    let now = chrono::Local::now().naive_local();
    let snapshot_key = names.snapshot_key(&now);
    let manifest_path = names.local_manifest();
    let database_path = names.local_database();

    index.dump(&manifest_path)?;
    db.dump(&database_path)?;

    let jobs = vec![
        UploadJob {
            key: snapshot_key.clone(),
            path: manifest_path.clone(),
        },
        UploadJob {
            key: names.database_key(),
            path: database_path.clone(),
        },
        UploadJob {
            key: names.database_snapshot_key(&now),
            path: database_path.clone(),
        },
    ];

    let result = pipeline.upload(jobs).await;
    remove_temp(&manifest_path);
    remove_temp(&database_path);

    let report = result?;
    report.require_complete()?;
    Ok(SnapshotCommit { snapshot_key })
}

fn remove_temp(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!("Failed to remove temporary {}: {}", path.display(), e);
    }
}

/// List every snapshot available in the bucket, oldest first.
pub async fn list(store: &dyn crate::store::ObjectStore) -> Result<Vec<String>> {
    let mut snapshots: Vec<String> = store
        .list_objects("")
        .await?
        .into_iter()
        .filter(|key| key.ends_with(SNAPSHOT_SUFFIX))
        .collect();
    snapshots.sort();
    Ok(snapshots)
}
