//! Object store boundary.
//!
//! The engine only ever talks to the remote through [`ObjectStore`]:
//! list/stat/get/put primitives plus bucket existence and creation. The
//! provided implementation is backed by OpenDAL, which covers S3-compatible
//! endpoints, a local filesystem target, and an in-memory service used by
//! the tests.

use crate::utils::{HashtreeError, Result};
use async_trait::async_trait;
use opendal::Operator;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::compat::FuturesAsyncReadCompatExt;

/// Readable byte stream handed across the store boundary.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Write chunk size when draining a stream into the store.
const PUT_CHUNK_SIZE: usize = 64 * 1024;

/// S3-compatible blob-store client surface.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn bucket_exists(&self) -> Result<bool>;

    async fn create_bucket(&self) -> Result<()>;

    /// All object keys under `prefix` (no ordering guarantee).
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;

    /// Object size in bytes. `NotFound` if the key does not exist.
    async fn stat_object(&self, key: &str) -> Result<u64>;

    async fn get_object(&self, key: &str) -> Result<ByteStream>;

    /// Stream `data` into the object, returning the bytes written. The size
    /// hint, when known, lets backends preallocate; it is advisory only.
    async fn put_object(&self, key: &str, data: ByteStream, size_hint: Option<u64>)
        -> Result<u64>;
}

enum Backend {
    /// Local directory target; the bucket is a subdirectory.
    Fs { bucket_dir: PathBuf },
    /// Remote S3-compatible endpoint.
    S3,
    /// In-memory, for tests.
    Memory,
}

/// OpenDAL-backed [`ObjectStore`].
pub struct OpendalStore {
    op: Operator,
    backend: Backend,
}

impl OpendalStore {
    /// Store backed by an S3-compatible endpoint (AWS, MinIO, ...).
    pub fn s3(
        endpoint: &str,
        region: &str,
        bucket: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self> {
        let builder = opendal::services::S3::default()
            .endpoint(endpoint)
            .region(region)
            .bucket(bucket)
            .access_key_id(access_key)
            .secret_access_key(secret_key);
        let op = Operator::new(builder)?.finish();
        Ok(Self {
            op,
            backend: Backend::S3,
        })
    }

    /// Store backed by a local filesystem directory.
    pub fn fs(root: &std::path::Path, bucket: &str) -> Result<Self> {
        let bucket_dir = root.join(bucket);
        let builder = opendal::services::Fs::default().root(&bucket_dir.to_string_lossy());
        let op = Operator::new(builder)?.finish();
        Ok(Self {
            op,
            backend: Backend::Fs { bucket_dir },
        })
    }

    /// In-memory store for tests.
    pub fn memory() -> Result<Self> {
        let builder = opendal::services::Memory::default();
        let op = Operator::new(builder)?.finish();
        Ok(Self {
            op,
            backend: Backend::Memory,
        })
    }
}

fn map_not_found(e: opendal::Error, key: &str) -> HashtreeError {
    if e.kind() == opendal::ErrorKind::NotFound {
        HashtreeError::NotFound(key.to_string())
    } else {
        HashtreeError::Store(e)
    }
}

#[async_trait]
impl ObjectStore for OpendalStore {
    async fn bucket_exists(&self) -> Result<bool> {
        match &self.backend {
            Backend::Fs { bucket_dir } => Ok(tokio::fs::try_exists(bucket_dir).await?),
            Backend::Memory => Ok(true),
            Backend::S3 => match self.op.check().await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(HashtreeError::Store(e)),
            },
        }
    }

    async fn create_bucket(&self) -> Result<()> {
        match &self.backend {
            Backend::Fs { bucket_dir } => {
                tokio::fs::create_dir_all(bucket_dir).await?;
                Ok(())
            }
            Backend::Memory => Ok(()),
            // OpenDAL exposes no bucket administration for S3.
            Backend::S3 => Err(HashtreeError::Config(
                "S3 buckets must be created with the provider before running init".to_string(),
            )),
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.op.list_with(prefix).recursive(true).await?;
        let mut keys = Vec::new();
        for entry in entries {
            let path = entry.path().to_string();
            // Skip directory markers
            if !path.ends_with('/') {
                keys.push(path);
            }
        }
        Ok(keys)
    }

    async fn stat_object(&self, key: &str) -> Result<u64> {
        let meta = self.op.stat(key).await.map_err(|e| map_not_found(e, key))?;
        Ok(meta.content_length())
    }

    async fn get_object(&self, key: &str) -> Result<ByteStream> {
        let meta = self.op.stat(key).await.map_err(|e| map_not_found(e, key))?;
        let reader = self
            .op
            .reader(key)
            .await
            .map_err(|e| map_not_found(e, key))?;
        let reader = reader
            .into_futures_async_read(0..meta.content_length())
            .await?;
        Ok(Box::new(reader.compat()))
    }

    async fn put_object(
        &self,
        key: &str,
        mut data: ByteStream,
        _size_hint: Option<u64>,
    ) -> Result<u64> {
        let mut writer = self.op.writer(key).await?;
        let mut buf = vec![0u8; PUT_CHUNK_SIZE];
        let mut written = 0u64;

        loop {
            let n = data.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write(buf[..n].to_vec()).await?;
            written += n as u64;
        }
        writer.close().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn put_bytes(store: &OpendalStore, key: &str, data: &[u8]) {
        let stream: ByteStream = Box::new(std::io::Cursor::new(data.to_vec()));
        store
            .put_object(key, stream, Some(data.len() as u64))
            .await
            .unwrap();
    }

    async fn get_bytes(store: &OpendalStore, key: &str) -> Vec<u8> {
        let mut stream = store.get_object(key).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = OpendalStore::memory().unwrap();
        put_bytes(&store, "some-key", b"payload").await;
        assert_eq!(get_bytes(&store, "some-key").await, b"payload");
        assert_eq!(store.stat_object("some-key").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let store = OpendalStore::memory().unwrap();
        assert!(matches!(
            store.stat_object("nope").await,
            Err(HashtreeError::NotFound(_))
        ));
        assert!(matches!(
            store.get_object("nope").await,
            Err(HashtreeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_objects() {
        let store = OpendalStore::memory().unwrap();
        put_bytes(&store, "bucket-2024.hsh", b"a").await;
        put_bytes(&store, "bucket.db", b"b").await;

        let mut keys = store.list_objects("").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["bucket-2024.hsh", "bucket.db"]);
    }

    #[tokio::test]
    async fn test_fs_bucket_lifecycle() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = OpendalStore::fs(temp_dir.path(), "mybucket").unwrap();

        assert!(!store.bucket_exists().await.unwrap());
        store.create_bucket().await.unwrap();
        assert!(store.bucket_exists().await.unwrap());

        put_bytes(&store, "obj", b"data").await;
        assert_eq!(get_bytes(&store, "obj").await, b"data");
    }
}
