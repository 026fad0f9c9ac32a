// src/metadata.rs

//! Normalized backup metadata
//!
//! Format readers produce a [`SourceMetadata`]; the orchestrator derives the
//! [`DestinationMetadata`] from it by forcing the destination's crypto mode,
//! codec, checksum algorithm and canonical apk name. The destination
//! metadata is written as pretty JSON to [`META_FILE`] and is never
//! encrypted, so a restore can read it without credentials.

use crate::compression::CompressionFormat;
use crate::config::ConvertConfig;
use crate::crypto::CryptoMode;
use crate::error::Result;
use crate::hash::HashAlgorithm;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the destination metadata
pub const META_FILE: &str = "meta.am.v1";

/// Name every primary apk gets inside the destination apk archive
pub const CANONICAL_APK_NAME: &str = "base.apk";

/// Schema version of the layout this crate writes
pub const CURRENT_SCHEMA_VERSION: u32 = 5;

/// Backup content flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupFlags(u32);

impl BackupFlags {
    pub const HAS_APK: Self = Self(1 << 0);
    pub const HAS_INTERNAL_DATA: Self = Self(1 << 1);
    pub const HAS_EXTERNAL_DATA: Self = Self(1 << 2);
    pub const HAS_CACHE: Self = Self(1 << 3);
    pub const HAS_MEDIA_OBB: Self = Self(1 << 7);
    pub const MULTIPLE: Self = Self(1 << 9);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Whether any data category is present
    pub const fn has_any_data(&self) -> bool {
        self.0 & (Self::HAS_INTERNAL_DATA.0 | Self::HAS_EXTERNAL_DATA.0 | Self::HAS_MEDIA_OBB.0) != 0
    }
}

impl std::ops::BitOr for BackupFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for BackupFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::HAS_APK, "apk"),
            (Self::HAS_INTERNAL_DATA, "internal"),
            (Self::HAS_EXTERNAL_DATA, "external"),
            (Self::HAS_CACHE, "cache"),
            (Self::HAS_MEDIA_OBB, "obb"),
            (Self::MULTIPLE, "multiple"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Data category of a destination data archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataCategory {
    Internal,
    External,
    MediaObb,
}

impl DataCategory {
    /// Device path the category restores to
    pub fn device_path(&self, package: &str, user_id: u32) -> String {
        match self {
            Self::Internal => format!("/data/user/{}/{}", user_id, package),
            Self::External => format!("/storage/emulated/{}/Android/data/{}", user_id, package),
            Self::MediaObb => format!("/storage/emulated/{}/Android/obb/{}", user_id, package),
        }
    }

    /// Categories present in `flags`, in data-index order
    pub fn present(flags: BackupFlags) -> Vec<Self> {
        let mut categories = Vec::new();
        if flags.contains(BackupFlags::HAS_INTERNAL_DATA) {
            categories.push(Self::Internal);
        }
        if flags.contains(BackupFlags::HAS_EXTERNAL_DATA) {
            categories.push(Self::External);
        }
        if flags.contains(BackupFlags::HAS_MEDIA_OBB) {
            categories.push(Self::MediaObb);
        }
        categories
    }
}

/// Device data directories for the categories in `flags`
pub fn data_dir_paths(package: &str, user_id: u32, flags: BackupFlags) -> Vec<String> {
    DataCategory::present(flags)
        .into_iter()
        .map(|c| c.device_path(package, user_id))
        .collect()
}

/// Metadata recovered from a source backup
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMetadata {
    pub label: String,
    pub package_name: String,
    pub version_name: String,
    pub version_code: i64,
    pub is_system: bool,
    pub is_split_apk: bool,
    pub split_configs: Vec<String>,
    pub has_rules: bool,
    pub backup_time: DateTime<Utc>,
    pub crypto: CryptoMode,
    /// File name of the primary apk inside the source backup
    pub apk_name: String,
    pub flags: BackupFlags,
    pub data_dirs: Vec<String>,
    /// Codec of the source archives
    pub tar_type: CompressionFormat,
    pub checksum_algo: HashAlgorithm,
    pub key_store: bool,
    pub installer: Option<String>,
    pub user_handle: u32,
    pub version: u32,
}

/// Metadata written into a converted backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationMetadata {
    pub label: String,
    pub package_name: String,
    pub version_name: String,
    pub version_code: i64,
    pub is_system: bool,
    pub is_split_apk: bool,
    pub split_configs: Vec<String>,
    pub has_rules: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub backup_time: DateTime<Utc>,
    pub crypto: CryptoMode,
    pub apk_name: String,
    pub flags: BackupFlags,
    pub data_dirs: Vec<String>,
    pub tar_type: CompressionFormat,
    pub checksum_algo: HashAlgorithm,
    pub key_store: bool,
    pub installer: Option<String>,
    pub user_handle: u32,
    pub version: u32,
    pub backup_name: String,
}

impl DestinationMetadata {
    /// Apply the destination overrides from `config` to `source`
    pub fn from_source(source: &SourceMetadata, config: &ConvertConfig, backup_name: &str) -> Self {
        Self {
            label: source.label.clone(),
            package_name: source.package_name.clone(),
            version_name: source.version_name.clone(),
            version_code: source.version_code,
            is_system: source.is_system,
            is_split_apk: source.is_split_apk,
            split_configs: source.split_configs.clone(),
            has_rules: source.has_rules,
            backup_time: source.backup_time,
            crypto: config.crypto.mode,
            apk_name: CANONICAL_APK_NAME.to_string(),
            flags: source.flags,
            data_dirs: source.data_dirs.clone(),
            tar_type: config.compression,
            checksum_algo: config.checksum_algorithm,
            key_store: source.key_store,
            installer: config.installer.clone().or_else(|| source.installer.clone()),
            user_handle: config.user_id,
            version: source.version,
            backup_name: backup_name.to_string(),
        }
    }

    /// Write as pretty JSON into `dir`
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(META_FILE);
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(&path, json)?;
        Ok(path)
    }

    /// Read a metadata file written by [`DestinationMetadata::write_to`]
    pub fn read_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| crate::Error::SourceFormat(format!("Invalid {}: {}", META_FILE, e)))
    }
}
