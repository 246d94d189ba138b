//! Content hashing.
//!
//! A file is identified solely by the SHA-256 digest of its bytes, rendered
//! as 64 lowercase hex characters. The digest is the primary key for both
//! storage and transfer.

use crate::utils::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Read buffer size for streaming hash computation.
const HASH_BUF_SIZE: usize = 64 * 1024;

/// A 32-byte SHA-256 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Compute the hash of an in-memory byte slice.
    pub fn compute(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        ContentHash(out)
    }

    /// Hex-encode the full digest for use as a storage key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character lowercase hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(ContentHash(arr))
    }

    /// First 8 hex characters, used in progress output.
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid content hash: {s}")))
    }
}

/// Hash a file by streaming it through SHA-256 in 64 KiB reads.
///
/// Used by the scanner, which runs before the async pipeline starts.
pub fn hash_file(path: &Path) -> std::io::Result<ContentHash> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Ok(ContentHash(out))
}

/// Async variant used by download workers to verify written files.
pub async fn hash_file_async(path: &Path) -> Result<ContentHash> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Ok(ContentHash(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_compute_deterministic() {
        let h1 = ContentHash::compute(b"hello");
        let h2 = ContentHash::compute(b"hello");
        assert_eq!(h1, h2);
        assert_ne!(h1, ContentHash::compute(b"world"));
    }

    #[test]
    fn test_hex_rendering() {
        let h = ContentHash::compute(b"hello");
        let hex = h.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex, hex.to_lowercase());
        // Known SHA-256 of "hello"
        assert_eq!(
            hex,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_hex_round_trip() {
        let h = ContentHash::compute(b"some content");
        let parsed = ContentHash::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, parsed);
        assert!(ContentHash::from_hex("not hex").is_none());
        assert!(ContentHash::from_hex("abcd").is_none());
    }

    #[test]
    fn test_hash_file_matches_compute() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("file.bin");
        let data = vec![0xABu8; 200_000]; // spans multiple read buffers
        std::fs::write(&path, &data)?;

        assert_eq!(hash_file(&path)?, ContentHash::compute(&data));
        Ok(())
    }

    #[tokio::test]
    async fn test_hash_file_async_matches_sync() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("file.txt");
        std::fs::write(&path, b"async and sync agree").unwrap();

        let sync_hash = hash_file(&path).unwrap();
        let async_hash = hash_file_async(&path).await.unwrap();
        assert_eq!(sync_hash, async_hash);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let h = ContentHash::compute(b"serde");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", h.to_hex()));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(h, back);
    }
}
