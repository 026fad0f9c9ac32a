// src/source/oab.rs

//! OAndBackup reader
//!
//! Layout of one backup directory:
//!
//! ```text
//! <pkg>/
//!   <pkg>.log                     JSON descriptor
//!   <apk name>[.enc]              apk, named after the installed sourceDir
//!   <pkg>.zip[.enc]               internal data
//!   external_files/<pkg>.zip[.enc]
//! ```
//!
//! Encrypted backups are read through the configured credentials, so the
//! artifacts carry the password mode's extension.

use super::{ArtifactRole, FormatReader, SourceArtifact, SourceBackup, SourceKind, existing_file, file_name_of};
use crate::config::ConvertConfig;
use crate::crypto::CryptoMode;
use crate::error::{Error, Result};
use crate::metadata::{BackupFlags, SourceMetadata, data_dir_paths};
use chrono::DateTime;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory names OAndBackup uses for device-level pseudo packages
pub const RESERVED_NAMES: [&str; 6] = [
    "accounts",
    "appwidgets",
    "bluetooth",
    "data.usage.policy",
    "wallpaper",
    "wifi.access.points",
];

/// Schema version recorded for OAndBackup conversions
///
/// The old layout tells restores that permissions need fixing.
pub const OAB_SCHEMA_VERSION: u32 = 2;

const EXTERNAL_FILES: &str = "external_files";

/// What the descriptor says was backed up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackupMode {
    Unset,
    Apk,
    Data,
    Both,
}

impl BackupMode {
    fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::Unset),
            1 => Ok(Self::Apk),
            2 => Ok(Self::Data),
            3 => Ok(Self::Both),
            other => Err(Error::SourceFormat(format!("Unknown backupMode {}", other))),
        }
    }

    fn wants_apk(self) -> bool {
        matches!(self, Self::Apk | Self::Both)
    }

    fn wants_data(self) -> bool {
        matches!(self, Self::Data | Self::Both)
    }
}

/// The `<pkg>.log` JSON descriptor
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogFile {
    label: String,
    package_name: String,
    version_name: String,
    version_code: i64,
    source_dir: String,
    last_backup_millis: i64,
    #[serde(default)]
    is_system: bool,
    #[serde(default)]
    is_encrypted: bool,
    #[serde(default)]
    backup_mode: i64,
}

/// Reader for one OAndBackup package directory
#[derive(Debug, Clone)]
pub struct OabReader {
    location: PathBuf,
    package_name: String,
}

impl OabReader {
    /// `location` is the package directory, e.g. `/sdcard/oandbackups/org.example`
    pub fn new(location: &Path) -> Result<Self> {
        let package_name = file_name_of(location)?.to_string();
        Ok(Self {
            location: location.to_path_buf(),
            package_name,
        })
    }

    fn parse_log(&self) -> Result<LogFile> {
        let path = self.location.join(format!("{}.log", self.package_name));
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SourceFormat(format!(
                    "Descriptor {} not found",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Err(Error::SourceFormat(format!("Descriptor {} is empty", path.display())));
        }
        serde_json::from_str(&content)
            .map_err(|e| Error::SourceFormat(format!("Could not parse {}: {}", path.display(), e)))
    }
}

impl FormatReader for OabReader {
    fn kind(&self) -> SourceKind {
        SourceKind::OAndBackup
    }

    fn package_name(&self) -> &str {
        &self.package_name
    }

    fn read(&self, config: &ConvertConfig) -> Result<SourceBackup> {
        if RESERVED_NAMES.contains(&self.package_name.as_str()) {
            return Err(Error::SourceFormat(format!(
                "{} is a special backup, not an app",
                self.package_name
            )));
        }

        let log = self.parse_log()?;
        if log.package_name != self.package_name {
            return Err(Error::PackageIdentityMismatch {
                expected: self.package_name.clone(),
                actual: log.package_name,
            });
        }

        let crypto = if log.is_encrypted {
            CryptoMode::Password
        } else {
            CryptoMode::None
        };
        let apk_name = Path::new(&log.source_dir)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::SourceFormat(format!("Invalid sourceDir {:?}", log.source_dir)))?
            .to_string();
        let backup_time = DateTime::from_timestamp_millis(log.last_backup_millis).ok_or_else(|| {
            Error::SourceFormat(format!("Invalid lastBackupMillis {}", log.last_backup_millis))
        })?;

        let mode = BackupMode::from_code(log.backup_mode)?;
        if mode == BackupMode::Unset {
            return Err(Error::SourceFormat(format!(
                "{} does not contain any backup",
                self.location.display()
            )));
        }

        let mut flags = BackupFlags::MULTIPLE;
        let mut artifacts = Vec::new();

        if mode.wants_apk() {
            let path = self.location.join(format!("{}{}", apk_name, crypto.extension()));
            let path = existing_file(path.clone()).ok_or(Error::SourceArtifactMissing(path))?;
            flags.insert(BackupFlags::HAS_APK);
            artifacts.push(SourceArtifact::new(ArtifactRole::Apk, path));
        }

        if mode.wants_data() {
            let zip_name = format!("{}.zip{}", self.package_name, crypto.extension());
            let internal = existing_file(self.location.join(&zip_name));
            let external = existing_file(self.location.join(EXTERNAL_FILES).join(&zip_name));

            if internal.is_none() && external.is_none() {
                return Err(Error::SourceArtifactMissing(self.location.join(&zip_name)));
            }
            if let Some(path) = internal {
                flags.insert(BackupFlags::HAS_INTERNAL_DATA);
                artifacts.push(SourceArtifact::new(ArtifactRole::InternalData, path));
            }
            if let Some(path) = external {
                flags.insert(BackupFlags::HAS_EXTERNAL_DATA);
                artifacts.push(SourceArtifact::new(ArtifactRole::ExternalData, path));
            }
            flags.insert(BackupFlags::HAS_CACHE);
        }

        debug!("{} backup flags: {}", self.package_name, flags);
        info!("Read OAndBackup descriptor for {}", self.package_name);

        let metadata = SourceMetadata {
            label: log.label,
            package_name: self.package_name.clone(),
            version_name: log.version_name,
            version_code: log.version_code,
            is_system: log.is_system,
            is_split_apk: false,
            split_configs: Vec::new(),
            has_rules: false,
            backup_time,
            crypto,
            apk_name,
            flags,
            data_dirs: data_dir_paths(&self.package_name, config.user_id, flags),
            tar_type: config.compression,
            checksum_algo: config.checksum_algorithm,
            key_store: false,
            installer: config.installer.clone(),
            user_handle: config.user_id,
            version: OAB_SCHEMA_VERSION,
        };

        Ok(SourceBackup {
            kind: SourceKind::OAndBackup,
            metadata,
            artifacts,
            icon: None,
            apk_digest: None,
            cache: None,
        })
    }
}
