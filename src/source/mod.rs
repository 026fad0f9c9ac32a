// src/source/mod.rs

//! Source backup readers
//!
//! Each third-party tool gets one [`FormatReader`] that turns its on-disk
//! layout into a [`SourceBackup`]: normalized [`SourceMetadata`] plus the
//! list of artifacts the orchestrator will transcode. Readers only read;
//! every failure surfaces before anything is written to the destination.
//!
//! | Tool            | Location handed to the reader             |
//! |-----------------|-------------------------------------------|
//! | OAndBackup      | the `<pkg>/` directory                    |
//! | Titanium Backup | the `<pkg>-<timestamp>.properties` file   |
//! | Swift Backup    | the `<pkg>.xml` descriptor                |

pub mod oab;
pub mod properties;
pub mod sb;
pub mod tb;

pub use oab::OabReader;
pub use properties::Properties;
pub use sb::SbReader;
pub use tb::TbReader;

use crate::config::ConvertConfig;
use crate::error::{Error, Result};
use crate::hash::HexDigest;
use crate::metadata::SourceMetadata;
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::TempDir;

/// Backup tool a source was produced by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    OAndBackup,
    TitaniumBackup,
    SwiftBackup,
}

impl SourceKind {
    /// Short name, also used as the backup label
    pub fn name(&self) -> &'static str {
        match self {
            Self::OAndBackup => "OAndBackup",
            Self::TitaniumBackup => "TB",
            Self::SwiftBackup => "SB",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "oab" | "oandbackup" => Ok(Self::OAndBackup),
            "tb" | "titanium" | "titaniumbackup" => Ok(Self::TitaniumBackup),
            "sb" | "swift" | "swiftbackup" => Ok(Self::SwiftBackup),
            _ => Err(Error::SourceFormat(format!("Unknown backup tool: {}", s))),
        }
    }
}

/// What a source artifact holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactRole {
    /// Primary apk, possibly compressed or encrypted
    Apk,
    /// Additional split apks, already extracted to the reader's cache
    SplitApk,
    InternalData,
    ExternalData,
    MediaObb,
    /// Compressed tar holding internal and external data together
    CombinedData,
}

/// One readable file of a source backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceArtifact {
    pub role: ArtifactRole,
    pub path: PathBuf,
}

impl SourceArtifact {
    pub fn new(role: ArtifactRole, path: impl Into<PathBuf>) -> Self {
        Self {
            role,
            path: path.into(),
        }
    }
}

/// A parsed source backup
///
/// Files cached while reading (the Swift Backup apk and its splits) live in
/// a temporary directory owned by this value and are deleted with it.
#[derive(Debug)]
pub struct SourceBackup {
    pub kind: SourceKind,
    pub metadata: SourceMetadata,
    pub artifacts: Vec<SourceArtifact>,
    /// Icon image carried inline by the descriptor
    pub icon: Option<Vec<u8>>,
    /// Expected digest of the decompressed primary apk
    pub apk_digest: Option<HexDigest>,
    pub(crate) cache: Option<TempDir>,
}

impl SourceBackup {
    /// First artifact with `role`
    pub fn artifact(&self, role: ArtifactRole) -> Option<&Path> {
        self.artifacts
            .iter()
            .find(|a| a.role == role)
            .map(|a| a.path.as_path())
    }

    /// All artifacts with `role`, in reader order
    pub fn artifacts_with(&self, role: ArtifactRole) -> impl Iterator<Item = &Path> {
        self.artifacts
            .iter()
            .filter(move |a| a.role == role)
            .map(|a| a.path.as_path())
    }

    /// Directory of files cached while reading, if any
    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache.as_ref().map(TempDir::path)
    }
}

/// Reader for one source backup tool
pub trait FormatReader {
    /// Tool this reader understands
    fn kind(&self) -> SourceKind;

    /// Package name derived from the source location
    fn package_name(&self) -> &str;

    /// Parse the descriptor and locate the artifacts
    fn read(&self, config: &ConvertConfig) -> Result<SourceBackup>;
}

/// Last path component as UTF-8
pub(crate) fn file_name_of(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::SourceFormat(format!("Invalid source location: {}", path.display())))
}

/// Modification time of `path`, or now when the platform cannot tell
pub(crate) fn modified_time(path: &Path) -> Result<DateTime<Utc>> {
    let metadata = fs::metadata(path)?;
    Ok(metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now()))
}

/// Existing regular file at `path`, if any
pub(crate) fn existing_file(path: PathBuf) -> Option<PathBuf> {
    path.is_file().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("oab".parse::<SourceKind>().unwrap(), SourceKind::OAndBackup);
        assert_eq!("TB".parse::<SourceKind>().unwrap(), SourceKind::TitaniumBackup);
        assert_eq!("swift".parse::<SourceKind>().unwrap(), SourceKind::SwiftBackup);
        assert!(matches!("adb".parse::<SourceKind>(), Err(Error::SourceFormat(_))));
    }

    #[test]
    fn test_file_name_of() {
        assert_eq!(file_name_of(Path::new("/a/org.example")).unwrap(), "org.example");
        assert!(file_name_of(Path::new("/")).is_err());
    }

    #[test]
    fn test_artifact_lookup() {
        let backup = SourceBackup {
            kind: SourceKind::SwiftBackup,
            metadata: crate::metadata::tests::sample_source(),
            artifacts: vec![
                SourceArtifact::new(ArtifactRole::Apk, "/s/base.apk"),
                SourceArtifact::new(ArtifactRole::SplitApk, "/s/config.en.apk"),
                SourceArtifact::new(ArtifactRole::SplitApk, "/s/config.xxhdpi.apk"),
            ],
            icon: None,
            apk_digest: None,
            cache: None,
        };
        assert_eq!(backup.artifact(ArtifactRole::Apk), Some(Path::new("/s/base.apk")));
        assert_eq!(backup.artifacts_with(ArtifactRole::SplitApk).count(), 2);
        assert_eq!(backup.artifact(ArtifactRole::InternalData), None);
        assert!(backup.cache_dir().is_none());
    }
}
