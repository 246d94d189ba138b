//! Configuration loading.
//!
//! The config file is a flat TOML document, by default at `~/.htcfg`. The
//! remote credential keys keep their historical spellings (`accesskey`,
//! `secretkey`, `enckey`) so existing config files keep working.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Remote endpoint host for the `s3` backend, or the root directory for
    /// the `fs` backend.
    pub url: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Use https when talking to the endpoint.
    #[serde(default)]
    pub secure: bool,

    #[serde(default, rename = "accesskey")]
    pub access_key: String,

    #[serde(default, rename = "secretkey")]
    pub secret_key: String,

    /// Passphrase all object encryption keys are derived from.
    #[serde(rename = "enckey")]
    pub enc_key: String,

    /// Directory to snapshot from and restore into.
    pub directory: PathBuf,

    /// Remote bucket name, also the namespace for every artifact key.
    pub bucket: String,

    /// Storage backend: `s3` or `fs`.
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_port() -> u16 {
    9000
}

fn default_backend() -> String {
    "s3".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    crate::transfer::DEFAULT_WORKERS
}

fn default_attempts() -> u32 {
    crate::transfer::DEFAULT_ATTEMPTS
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.bucket.is_empty() {
            anyhow::bail!("bucket must not be empty");
        }
        if self.enc_key.is_empty() {
            anyhow::bail!("enckey must not be empty");
        }
        match self.backend.as_str() {
            "s3" | "fs" => Ok(()),
            other => anyhow::bail!("unknown backend {other:?} (expected \"s3\" or \"fs\")"),
        }
    }

    /// Endpoint URL for the s3 backend, assembled from `url`, `port` and
    /// `secure` unless `url` already carries a scheme.
    pub fn endpoint(&self) -> String {
        if self.url.contains("://") {
            self.url.clone()
        } else {
            let scheme = if self.secure { "https" } else { "http" };
            format!("{}://{}:{}", scheme, self.url, self.port)
        }
    }

    /// Default config file location: `$HOME/.htcfg`.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".htcfg"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_full_config_parses() {
        let file = write_config(
            r#"
            url = "minio.example.com"
            port = 9001
            secure = true
            accesskey = "AK"
            secretkey = "SK"
            enckey = "passphrase"
            directory = "/data/photos"
            bucket = "photos"
            workers = 5
            "#,
        );

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.endpoint(), "https://minio.example.com:9001");
        assert_eq!(config.bucket, "photos");
        assert_eq!(config.directory, PathBuf::from("/data/photos"));
        assert_eq!(config.workers, 5);
        // Untouched knobs fall back to defaults.
        assert_eq!(config.backend, "s3");
        assert_eq!(config.attempts, crate::transfer::DEFAULT_ATTEMPTS);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let file = write_config(
            r#"
            url = "localhost"
            enckey = "pw"
            directory = "/data"
            bucket = "b"
            "#,
        );

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert!(!config.secure);
        assert_eq!(config.endpoint(), "http://localhost:9000");
        assert_eq!(config.workers, crate::transfer::DEFAULT_WORKERS);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_explicit_scheme_wins_over_port() {
        let file = write_config(
            r#"
            url = "https://s3.amazonaws.com"
            enckey = "pw"
            directory = "/data"
            bucket = "b"
            "#,
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.endpoint(), "https://s3.amazonaws.com");
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let file = write_config(
            r#"
            url = "localhost"
            enckey = "pw"
            directory = "/data"
            bucket = "b"
            backend = "ftp"
            "#,
        );
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn test_empty_enckey_rejected() {
        let file = write_config(
            r#"
            url = "localhost"
            enckey = ""
            directory = "/data"
            bucket = "b"
            "#,
        );
        assert!(Config::from_file(file.path()).is_err());
    }
}
