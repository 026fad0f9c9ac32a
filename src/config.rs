// src/config.rs
//! Conversion configuration
//!
//! Settings that shape the destination backup are passed explicitly to every
//! conversion. They can be built in code or loaded from a TOML file:
//!
//! ```toml
//! backup_root = "/sdcard/backups"
//! compression = "zstd"
//! checksum_algorithm = "sha256"
//! split_size = 1073741824
//!
//! [crypto]
//! mode = "password"
//! password = "correct horse battery staple"
//! ```

use crate::compression::CompressionFormat;
use crate::crypto::CryptoMode;
use crate::crypto::stream::KdfParams;
use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Default chunk size of destination tar streams (1 GiB)
pub const DEFAULT_SPLIT_SIZE: u64 = 1024 * 1024 * 1024;

/// Default size above which zip entries are spilled to disk (1 MiB)
pub const DEFAULT_SPILL_THRESHOLD: u64 = 1024 * 1024;

/// Settings for one or more conversions
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    /// Root under which converted backups are committed
    pub backup_root: PathBuf,

    /// Scratch area for spill files and decrypted temporaries
    /// (system temp directory when unset)
    pub scratch_dir: Option<PathBuf>,

    /// Destination tar codec
    pub compression: CompressionFormat,

    /// Digest algorithm of the checksum ledger
    pub checksum_algorithm: HashAlgorithm,

    /// Maximum size of one destination chunk file
    pub split_size: u64,

    /// Zip entries up to this size are buffered in memory
    pub spill_threshold: u64,

    /// Android user the backups belong to
    pub user_id: u32,

    /// Installer package recorded in the metadata
    pub installer: Option<String>,

    /// Destination encryption
    pub crypto: CryptoConfig,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from("backups"),
            scratch_dir: None,
            compression: CompressionFormat::default(),
            checksum_algorithm: HashAlgorithm::default(),
            split_size: DEFAULT_SPLIT_SIZE,
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            user_id: 0,
            installer: None,
            crypto: CryptoConfig::default(),
        }
    }
}

impl ConvertConfig {
    /// Create a configuration committing under `backup_root`
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
            ..Self::default()
        }
    }

    /// Parse configuration from TOML text
    ///
    /// An unknown `compression` name is reported as an unsupported codec,
    /// the same as an unknown codec in a source descriptor.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let invalid = |e: toml::de::Error| Error::Config(format!("Invalid TOML: {}", e));
        let table: toml::Table = content.parse().map_err(invalid)?;
        if let Some(toml::Value::String(codec)) = table.get("compression") {
            codec.parse::<CompressionFormat>()?;
        }
        let config: Self = toml::Value::Table(table).try_into().map_err(invalid)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Check values that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.split_size == 0 {
            return Err(Error::Config("split_size must be greater than zero".to_string()));
        }
        if self.crypto.mode == CryptoMode::Password && self.crypto.password.is_none() {
            return Err(Error::Config("password mode requires crypto.password".to_string()));
        }
        if self.crypto.mode == CryptoMode::Key && self.crypto.key_hex.is_none() {
            return Err(Error::Config("key mode requires crypto.key_hex".to_string()));
        }
        Ok(())
    }

    /// Directory for scratch files
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Credentials and mode for artifact encryption
///
/// The same credentials are used to decrypt encrypted sources.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Destination encryption mode
    pub mode: CryptoMode,
    pub password: Option<String>,
    /// 256-bit key as 64 hex characters
    pub key_hex: Option<String>,
    pub kdf_memory_kib: u32,
    pub kdf_iterations: u32,
    pub kdf_parallelism: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        let kdf = KdfParams::default();
        Self {
            mode: CryptoMode::None,
            password: None,
            key_hex: None,
            kdf_memory_kib: kdf.memory_kib,
            kdf_iterations: kdf.iterations,
            kdf_parallelism: kdf.parallelism,
        }
    }
}

// Credentials stay out of logs
impl fmt::Debug for CryptoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoConfig")
            .field("mode", &self.mode)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_hex", &self.key_hex.as_ref().map(|_| "<redacted>"))
            .field("kdf_memory_kib", &self.kdf_memory_kib)
            .field("kdf_iterations", &self.kdf_iterations)
            .field("kdf_parallelism", &self.kdf_parallelism)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let config = ConvertConfig::default();
        assert_eq!(config.split_size, DEFAULT_SPLIT_SIZE);
        assert_eq!(config.compression, CompressionFormat::Gzip);
        assert_eq!(config.checksum_algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.crypto.mode, CryptoMode::None);
    }

    #[test]
    fn test_from_toml() {
        let config = ConvertConfig::from_toml_str(
            r#"
            backup_root = "/tmp/out"
            compression = "bzip2"
            split_size = 4096
            user_id = 10

            [crypto]
            mode = "key"
            key_hex = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff"
            "#,
        )
        .unwrap();

        assert_eq!(config.backup_root, PathBuf::from("/tmp/out"));
        assert_eq!(config.compression, CompressionFormat::Bzip2);
        assert_eq!(config.split_size, 4096);
        assert_eq!(config.user_id, 10);
        assert_eq!(config.crypto.mode, CryptoMode::Key);
        assert_eq!(config.spill_threshold, DEFAULT_SPILL_THRESHOLD);
    }

    #[test]
    fn test_unknown_codec_rejected() {
        let err = ConvertConfig::from_toml_str("compression = \"lzma\"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedCodec);
        assert!(matches!(err, Error::UnsupportedCodec(ref name) if name == "lzma"));
    }

    #[test]
    fn test_wrong_codec_type_is_config_error() {
        let err = ConvertConfig::from_toml_str("compression = 3").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_password_mode_requires_password() {
        let result = ConvertConfig::from_toml_str("[crypto]\nmode = \"password\"");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let crypto = CryptoConfig {
            password: Some("hunter2".to_string()),
            ..CryptoConfig::default()
        };
        assert!(!format!("{:?}", crypto).contains("hunter2"));
    }
}
