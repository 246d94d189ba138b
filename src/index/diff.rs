//! Diff engine.
//!
//! Compares a freshly built dedup index against the remote database and
//! classifies each hash as "already present" or "needs upload". Upload cost
//! is paid once per unique content hash regardless of how many local
//! copies or names reference it.

use crate::hash::ContentHash;
use crate::index::{Database, DedupIndex};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Local pipeline artifacts that must never be treated as content.
#[derive(Debug, Clone)]
pub struct LocalArtifacts {
    /// Local snapshot manifest path (`<dir>/.<bucket>.hsh`).
    pub manifest: PathBuf,
    /// Local database mirror path (`<dir>/.<bucket>.db`).
    pub database: PathBuf,
}

impl LocalArtifacts {
    fn matches(&self, path: &str) -> bool {
        let path = std::path::Path::new(path);
        path == self.manifest || path == self.database
    }
}

/// Result of classifying a dedup index against the database.
#[derive(Debug, Default)]
pub struct DiffOutcome {
    /// Hashes missing remotely, each with one representative local path.
    /// Uploading any one path suffices: content under a hash is identical.
    pub uploads: BTreeMap<ContentHash, PathBuf>,
    /// Hashes whose entries are leftover local pipeline artifacts; the
    /// caller drops these from the index before persisting.
    pub reserved: Vec<ContentHash>,
    /// Number of remote names verified as already present.
    pub verified: usize,
}

/// Classify every (hash, paths) pair of the dedup index.
///
/// Entries anchored at a reserved local artifact are skipped; hashes absent
/// from the database join the upload set with their first path as the
/// representative; hashes already present only bump the verified count.
/// Merging newly observed names into the database happens separately, after
/// the index has been prefix-stripped (see [`Database::merge_observed`]).
pub fn classify(index: &DedupIndex, db: &Database, artifacts: &LocalArtifacts) -> DiffOutcome {
    let mut outcome = DiffOutcome::default();

    for (hash, paths) in index.iter() {
        let first = match paths.first() {
            Some(first) => first,
            None => continue,
        };

        if artifacts.matches(first) {
            outcome.reserved.push(*hash);
        } else if let Some(names) = db.names(hash) {
            outcome.verified += names.len();
        } else {
            outcome.uploads.insert(*hash, PathBuf::from(first));
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(data: &[u8]) -> ContentHash {
        ContentHash::compute(data)
    }

    fn artifacts() -> LocalArtifacts {
        LocalArtifacts {
            manifest: PathBuf::from("/data/.bucket.hsh"),
            database: PathBuf::from("/data/.bucket.db"),
        }
    }

    #[test]
    fn test_absent_hash_joins_upload_set_once() {
        let mut index = DedupIndex::default();
        index.insert(hash(b"hello"), "/data/a.txt".to_string());
        index.insert(hash(b"hello"), "/data/b.txt".to_string());
        let db = Database::default();

        let outcome = classify(&index, &db, &artifacts());
        assert_eq!(outcome.uploads.len(), 1);
        assert_eq!(
            outcome.uploads[&hash(b"hello")],
            PathBuf::from("/data/a.txt")
        );
    }

    #[test]
    fn test_present_hash_never_uploaded() {
        let mut index = DedupIndex::default();
        index.insert(hash(b"hello"), "/data/a.txt".to_string());

        let mut db = Database::default();
        db.insert_name(hash(b"hello"), "a.txt".to_string());
        db.insert_name(hash(b"hello"), "old-name.txt".to_string());

        let outcome = classify(&index, &db, &artifacts());
        assert!(outcome.uploads.is_empty());
        assert_eq!(outcome.verified, 2);
    }

    #[test]
    fn test_reserved_artifacts_skipped() {
        let mut index = DedupIndex::default();
        index.insert(hash(b"manifest bytes"), "/data/.bucket.hsh".to_string());
        index.insert(hash(b"db bytes"), "/data/.bucket.db".to_string());
        index.insert(hash(b"real"), "/data/real.txt".to_string());
        let db = Database::default();

        let outcome = classify(&index, &db, &artifacts());
        assert_eq!(outcome.uploads.len(), 1);
        assert!(outcome.uploads.contains_key(&hash(b"real")));
        assert_eq!(outcome.reserved.len(), 2);
    }

    #[test]
    fn test_mixed_classification() {
        let mut index = DedupIndex::default();
        index.insert(hash(b"old"), "/data/old.txt".to_string());
        index.insert(hash(b"new"), "/data/new.txt".to_string());

        let mut db = Database::default();
        db.insert_name(hash(b"old"), "old.txt".to_string());

        let outcome = classify(&index, &db, &artifacts());
        assert_eq!(outcome.uploads.len(), 1);
        assert!(outcome.uploads.contains_key(&hash(b"new")));
        assert_eq!(outcome.verified, 1);
    }
}
