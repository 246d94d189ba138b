//! Dedup index and remote database.
//!
//! Both structures map a content hash to the file names sharing that
//! content. The dedup index is built fresh from each scan; the database is
//! the persisted record of what the remote store already holds. Both
//! serialize to the same versioned JSON envelope, which is the on-disk
//! contract between the snapshot manager and the database loader and must
//! round-trip exactly.

pub mod diff;

use crate::hash::ContentHash;
use crate::utils::{HashtreeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Current on-disk format version for index and database files.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Versioned serialization envelope shared by the snapshot manifest and the
/// database file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: BTreeMap<ContentHash, Vec<String>>,
}

fn decode_index(data: &[u8]) -> Result<BTreeMap<ContentHash, Vec<String>>> {
    let file: IndexFile = serde_json::from_slice(data)?;
    if file.version != INDEX_FORMAT_VERSION {
        return Err(HashtreeError::Config(format!(
            "unsupported index format version {} (expected {})",
            file.version, INDEX_FORMAT_VERSION
        )));
    }
    Ok(file.entries)
}

fn encode_index(entries: &BTreeMap<ContentHash, Vec<String>>) -> Result<Vec<u8>> {
    let file = IndexFile {
        version: INDEX_FORMAT_VERSION,
        entries: entries.clone(),
    };
    Ok(serde_json::to_vec_pretty(&file)?)
}

/// Write an index file atomically: dump to a sibling temp file, then rename.
fn write_index(path: &Path, entries: &BTreeMap<ContentHash, Vec<String>>) -> Result<()> {
    let data = encode_index(entries)?;
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    std::fs::write(&tmp, &data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// In-memory mapping from content hash to the ordered set of local paths
/// sharing that content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupIndex {
    entries: BTreeMap<ContentHash, Vec<String>>,
}

impl DedupIndex {
    /// Invert a scanner path→hash mapping into hash→[paths].
    ///
    /// Paths are appended in the scanner's (sorted) order and de-duplicated;
    /// an existing entry is never overwritten.
    pub fn build(files: &BTreeMap<PathBuf, ContentHash>) -> Self {
        let mut index = DedupIndex::default();
        for (path, hash) in files {
            index.insert(*hash, path.to_string_lossy().into_owned());
        }
        index
    }

    /// Append `path` to the entry for `hash`, skipping duplicates.
    pub fn insert(&mut self, hash: ContentHash, path: String) {
        let paths = self.entries.entry(hash).or_default();
        if !paths.iter().any(|p| p == &path) {
            paths.push(path);
        }
    }

    /// Strip a literal, anchored root prefix from every path, so the files
    /// in the directory become the root of the data structure.
    ///
    /// Only a leading match of `root` itself is removed, never a substring
    /// elsewhere in the path. Paths outside `root` are left untouched.
    pub fn strip_prefix(&mut self, root: &Path) {
        for paths in self.entries.values_mut() {
            for path in paths.iter_mut() {
                if let Ok(rel) = Path::new(path.as_str()).strip_prefix(root) {
                    *path = rel.to_string_lossy().into_owned();
                }
            }
        }
    }

    pub fn paths(&self, hash: &ContentHash) -> Option<&[String]> {
        self.entries.get(hash).map(Vec::as_slice)
    }

    pub fn remove(&mut self, hash: &ContentHash) {
        self.entries.remove(hash);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ContentHash, &Vec<String>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to the versioned index format at `path`.
    pub fn dump(&self, path: &Path) -> Result<()> {
        write_index(path, &self.entries)
    }
}

/// The persisted mapping from content hash to the file names previously
/// observed remotely for that hash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Database {
    entries: BTreeMap<ContentHash, Vec<String>>,
}

impl Database {
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn names(&self, hash: &ContentHash) -> Option<&[String]> {
        self.entries.get(hash).map(Vec::as_slice)
    }

    /// Record a file name for a hash, removing duplicates.
    pub fn insert_name(&mut self, hash: ContentHash, name: String) {
        let names = self.entries.entry(hash).or_default();
        if !names.iter().any(|n| n == &name) {
            names.push(name);
        }
    }

    /// Merge every (hash, names) pair of a prefix-stripped dedup index into
    /// the database, so renamed or additional copies of already-stored
    /// content are recorded.
    pub fn merge_observed(&mut self, index: &DedupIndex) {
        for (hash, paths) in index.iter() {
            for path in paths {
                self.insert_name(*hash, path.clone());
            }
        }
    }

    pub fn remove(&mut self, hash: &ContentHash) {
        self.entries.remove(hash);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ContentHash, &Vec<String>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a database from serialized bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Database {
            entries: decode_index(data)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_index(&self.entries)
    }

    /// Load a database file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Serialize to the versioned index format at `path`.
    pub fn dump(&self, path: &Path) -> Result<()> {
        write_index(path, &self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hash(data: &[u8]) -> ContentHash {
        ContentHash::compute(data)
    }

    #[test]
    fn test_build_inverts_and_deduplicates() {
        let mut files = BTreeMap::new();
        files.insert(PathBuf::from("/data/a.txt"), hash(b"hello"));
        files.insert(PathBuf::from("/data/b.txt"), hash(b"hello"));
        files.insert(PathBuf::from("/data/c.txt"), hash(b"world"));

        let index = DedupIndex::build(&files);
        assert_eq!(index.len(), 2);
        assert_eq!(
            index.paths(&hash(b"hello")).unwrap(),
            &["/data/a.txt".to_string(), "/data/b.txt".to_string()]
        );
        assert_eq!(
            index.paths(&hash(b"world")).unwrap(),
            &["/data/c.txt".to_string()]
        );
    }

    #[test]
    fn test_insert_skips_duplicate_paths() {
        let mut index = DedupIndex::default();
        index.insert(hash(b"x"), "/data/a.txt".to_string());
        index.insert(hash(b"x"), "/data/a.txt".to_string());
        assert_eq!(index.paths(&hash(b"x")).unwrap().len(), 1);
    }

    #[test]
    fn test_strip_prefix_is_anchored_and_literal() {
        let mut index = DedupIndex::default();
        index.insert(hash(b"a"), "/data/sub/data/file".to_string());
        index.insert(hash(b"b"), "/elsewhere/data/other".to_string());
        index.strip_prefix(Path::new("/data"));

        // Leading prefix stripped once; inner occurrence untouched.
        assert_eq!(index.paths(&hash(b"a")).unwrap(), &["sub/data/file"]);
        // No anchored match: path unchanged.
        assert_eq!(
            index.paths(&hash(b"b")).unwrap(),
            &["/elsewhere/data/other"]
        );
    }

    #[test]
    fn test_strip_prefix_with_regex_metacharacters() {
        // A directory name full of regex metacharacters must still strip,
        // because matching is literal.
        let mut index = DedupIndex::default();
        index.insert(hash(b"a"), "/da.t+a(1)/file".to_string());
        index.strip_prefix(Path::new("/da.t+a(1)"));
        assert_eq!(index.paths(&hash(b"a")).unwrap(), &["file"]);
    }

    #[test]
    fn test_database_insert_name_deduplicates() {
        let mut db = Database::default();
        db.insert_name(hash(b"x"), "a.txt".to_string());
        db.insert_name(hash(b"x"), "b.txt".to_string());
        db.insert_name(hash(b"x"), "a.txt".to_string());
        assert_eq!(db.names(&hash(b"x")).unwrap(), &["a.txt", "b.txt"]);
    }

    #[test]
    fn test_database_round_trips_exactly() {
        let mut db = Database::default();
        db.insert_name(hash(b"one"), "a.txt".to_string());
        db.insert_name(hash(b"one"), "copy/a.txt".to_string());
        db.insert_name(hash(b"two"), "b.txt".to_string());

        let bytes = db.to_bytes().unwrap();
        let back = Database::from_bytes(&bytes).unwrap();
        assert_eq!(db, back);
    }

    #[test]
    fn test_database_dump_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db");

        let mut db = Database::default();
        db.insert_name(hash(b"content"), "file.txt".to_string());
        db.dump(&path).unwrap();

        let loaded = Database::load(&path).unwrap();
        assert_eq!(db, loaded);
        // No temp file left behind
        assert!(!path.with_extension("db.tmp").exists());
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let data = br#"{"version": 99, "entries": {}}"#;
        assert!(matches!(
            Database::from_bytes(data),
            Err(HashtreeError::Config(_))
        ));
    }

    #[test]
    fn test_merge_observed_records_new_names() {
        let mut db = Database::default();
        db.insert_name(hash(b"hello"), "a.txt".to_string());

        let mut index = DedupIndex::default();
        index.insert(hash(b"hello"), "a.txt".to_string());
        index.insert(hash(b"hello"), "renamed.txt".to_string());
        index.insert(hash(b"world"), "c.txt".to_string());

        db.merge_observed(&index);
        assert_eq!(db.names(&hash(b"hello")).unwrap(), &["a.txt", "renamed.txt"]);
        assert_eq!(db.names(&hash(b"world")).unwrap(), &["c.txt"]);
    }
}
