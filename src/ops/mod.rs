//! Engine operations.
//!
//! Each public method is one end-to-end operation: `snapshot`, `restore`,
//! `list` and `init`. The engine wires the scanner, the indexes, the diff
//! and the transfer pipeline together; workers never see the indexes, and
//! index mutation happens only here, on the orchestrating task.

use crate::config::Config;
use crate::crypto;
use crate::hash::ContentHash;
use crate::index::diff::{self, LocalArtifacts};
use crate::index::{Database, DedupIndex};
use crate::scanner;
use crate::snapshot::{self, SnapshotNames};
use crate::store::ObjectStore;
use crate::transfer::progress::ProgressSink;
use crate::transfer::{DownloadJob, Pipeline, UploadJob};
use crate::utils::{HashtreeError, Result};
use async_compression::tokio::write::ZstdDecoder;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Summary of a completed snapshot operation.
#[derive(Debug)]
pub struct SnapshotSummary {
    /// Files the scanner hashed.
    pub scanned: usize,
    /// Files the scanner could not read.
    pub skipped: usize,
    /// Unique content hashes across the scanned files.
    pub unique: usize,
    /// Objects uploaded this run.
    pub uploaded: usize,
    /// Objects that failed to upload; their hashes were withheld from the
    /// persisted indexes and will be retried on the next snapshot.
    pub failed: usize,
    /// Remote names confirmed already present.
    pub verified: usize,
    /// Key of the snapshot manifest that was committed.
    pub snapshot_key: String,
}

/// Summary of a completed restore operation.
#[derive(Debug)]
pub struct RestoreSummary {
    pub restored: usize,
    /// Hashes that could not be restored.
    pub failed: Vec<String>,
}

/// The hashtree engine: one instance per (directory, bucket) pair.
pub struct Engine {
    config: Config,
    store: Arc<dyn ObjectStore>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(
        config: Config,
        store: Arc<dyn ObjectStore>,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            sink,
            cancel,
        }
    }

    fn names(&self) -> SnapshotNames {
        SnapshotNames::new(&self.config.directory, &self.config.bucket)
    }

    fn pipeline(&self, nuke: bool) -> Pipeline {
        Pipeline::new(
            Arc::clone(&self.store),
            self.config.bucket.clone(),
            self.config.enc_key.clone(),
            Arc::clone(&self.sink),
            self.cancel.clone(),
        )
        .with_workers(self.config.workers)
        .with_attempts(self.config.attempts)
        .with_nuke(nuke)
    }

    /// Fetch and decode the remote database, or `None` when the bucket has
    /// no database yet.
    async fn fetch_database(&self) -> Result<Option<Database>> {
        let db_key = self.names().database_key();

        let stream = match self.store.get_object(&db_key).await {
            Ok(stream) => stream,
            Err(HashtreeError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let passphrase = self.config.enc_key.clone();
        let bucket = self.config.bucket.clone();
        let key = tokio::task::spawn_blocking(move || {
            crypto::derive_key(&passphrase, &bucket, &db_key)
        })
        .await
        .map_err(|e| HashtreeError::Crypto(format!("key derivation task failed: {e}")))??;

        let mut decompressor = ZstdDecoder::new(Vec::new());
        crypto::decrypt_stream(&key, stream, &mut decompressor).await?;
        decompressor.shutdown().await?;

        Ok(Some(Database::from_bytes(&decompressor.into_inner())?))
    }

    /// Scan the directory, upload content the remote is missing, and commit
    /// a new snapshot.
    ///
    /// Individual upload failures do not abort the run: the snapshot is
    /// still committed without the failed hashes, so the next run retries
    /// them. A failed snapshot commit itself is an error.
    pub async fn snapshot(&self) -> Result<SnapshotSummary> {
        let root = self.config.directory.clone();
        info!("Scanning {}", root.display());
        let outcome = tokio::task::spawn_blocking(move || scanner::scan(&root))
            .await
            .map_err(|e| HashtreeError::Io(std::io::Error::other(e)))??;
        let scanned = outcome.len();
        let skipped = outcome.warnings.len();

        let mut index = DedupIndex::build(&outcome.files);
        let unique = index.len();
        info!("{} files, {} unique hashes", scanned, unique);

        let mut db = match self.fetch_database().await? {
            Some(db) => db,
            None => {
                warn!("No remote database found; treating every hash as new");
                Database::default()
            }
        };

        let names = self.names();
        let artifacts = LocalArtifacts {
            manifest: names.local_manifest(),
            database: names.local_database(),
        };
        let diffed = diff::classify(&index, &db, &artifacts);
        for hash in &diffed.reserved {
            index.remove(hash);
        }

        index.strip_prefix(&self.config.directory);
        db.merge_observed(&index);

        let jobs: Vec<UploadJob> = diffed
            .uploads
            .iter()
            .map(|(hash, path)| UploadJob {
                key: hash.to_hex(),
                path: path.clone(),
            })
            .collect();
        info!(
            "{} objects to upload, {} names already present",
            jobs.len(),
            diffed.verified
        );

        let pipeline = self.pipeline(false);
        let report = pipeline.upload(jobs).await?;

        // Failed hashes must not be recorded as stored, or they would never
        // be retried.
        for key in &report.failed {
            if let Some(hash) = ContentHash::from_hex(key) {
                index.remove(&hash);
                db.remove(&hash);
            }
        }

        let commit = snapshot::commit(&pipeline, &names, &index, &db).await?;
        info!("Committed snapshot {}", commit.snapshot_key);

        Ok(SnapshotSummary {
            scanned,
            skipped,
            unique,
            uploaded: report.succeeded,
            failed: report.failed.len(),
            verified: diffed.verified,
            snapshot_key: commit.snapshot_key,
        })
    }

    /// Restore every file recorded in the remote database into the
    /// configured directory.
    ///
    /// Existing local files that already match their recorded hash are
    /// skipped; differing ones are only overwritten when `nuke` is set.
    pub async fn restore(&self, nuke: bool) -> Result<RestoreSummary> {
        let db = self.fetch_database().await?.ok_or_else(|| {
            HashtreeError::NotFound(format!(
                "{} (run init and snapshot first)",
                self.names().database_key()
            ))
        })?;

        // A name accumulates entries under several hashes once its content
        // has changed between snapshots. Workers must never share a
        // destination, so each path gets exactly one job.
        let mut targets: BTreeMap<PathBuf, ContentHash> = BTreeMap::new();
        for (hash, names) in db.iter() {
            for name in names {
                targets.insert(self.config.directory.join(name), *hash);
            }
        }
        let jobs: Vec<DownloadJob> = targets
            .into_iter()
            .map(|(dest, hash)| DownloadJob { hash, dest })
            .collect();
        info!(
            "Restoring {} files into {}",
            jobs.len(),
            self.config.directory.display()
        );

        let report = self.pipeline(nuke).download(jobs).await?;
        Ok(RestoreSummary {
            restored: report.succeeded,
            failed: report.failed,
        })
    }

    /// List every snapshot available in the bucket, oldest first.
    pub async fn list(&self) -> Result<Vec<String>> {
        snapshot::list(self.store.as_ref()).await
    }

    /// Prepare the bucket for first use: create it when the backend allows,
    /// then seed an empty database unless one already exists.
    pub async fn init(&self) -> Result<()> {
        if self.store.bucket_exists().await? {
            info!("Bucket {} already exists", self.config.bucket);
        } else {
            info!("Creating bucket {}", self.config.bucket);
            self.store.create_bucket().await?;
        }

        let db_key = self.names().database_key();
        match self.store.stat_object(&db_key).await {
            Ok(_) => {
                info!("Database {} already present; leaving it alone", db_key);
                return Ok(());
            }
            Err(HashtreeError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        // Seed through the regular upload path so the database is encrypted
        // and compressed exactly like every later commit.
        let seed = tempfile_path(&self.config.bucket);
        Database::default().dump(&seed)?;
        let result = self
            .pipeline(false)
            .upload(vec![UploadJob {
                key: db_key.clone(),
                path: seed.clone(),
            }])
            .await;
        let _ = std::fs::remove_file(&seed);
        result?.require_complete()?;

        info!("Initialised empty database {}", db_key);
        Ok(())
    }
}

fn tempfile_path(bucket: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(".{}.db.init", bucket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OpendalStore;
    use crate::transfer::progress::NullSink;
    use std::fs;
    use tempfile::TempDir;

    fn test_config(directory: &std::path::Path) -> Config {
        Config {
            url: "unused".to_string(),
            port: 0,
            secure: false,
            access_key: String::new(),
            secret_key: String::new(),
            enc_key: "test passphrase".to_string(),
            directory: directory.to_path_buf(),
            bucket: "testbucket".to_string(),
            backend: "s3".to_string(),
            region: "us-east-1".to_string(),
            log_level: "info".to_string(),
            workers: 2,
            attempts: 1,
        }
    }

    fn engine(directory: &std::path::Path, store: Arc<dyn ObjectStore>) -> Engine {
        Engine::new(
            test_config(directory),
            store,
            Arc::new(NullSink),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_init_seeds_empty_database_once() {
        let store: Arc<dyn ObjectStore> = Arc::new(OpendalStore::memory().unwrap());
        let dir = TempDir::new().unwrap();
        let eng = engine(dir.path(), Arc::clone(&store));

        eng.init().await.unwrap();
        let db = eng.fetch_database().await.unwrap().unwrap();
        assert!(db.is_empty());

        // Re-running init must not clobber an existing database.
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        eng.snapshot().await.unwrap();
        eng.init().await.unwrap();
        let db = eng.fetch_database().await.unwrap().unwrap();
        assert_eq!(db.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_without_database_starts_fresh() {
        let store: Arc<dyn ObjectStore> = Arc::new(OpendalStore::memory().unwrap());
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let eng = engine(dir.path(), store);
        let summary = eng.snapshot().await.unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn test_second_snapshot_uploads_nothing_new() {
        let store: Arc<dyn ObjectStore> = Arc::new(OpendalStore::memory().unwrap());
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let eng = engine(dir.path(), store);
        eng.snapshot().await.unwrap();
        let second = eng.snapshot().await.unwrap();
        assert_eq!(second.uploaded, 0);
        assert_eq!(second.verified, 1);
    }

    #[tokio::test]
    async fn test_restore_without_database_fails() {
        let store: Arc<dyn ObjectStore> = Arc::new(OpendalStore::memory().unwrap());
        let dir = TempDir::new().unwrap();
        let eng = engine(dir.path(), store);
        assert!(matches!(
            eng.restore(false).await,
            Err(HashtreeError::NotFound(_))
        ));
    }
}
