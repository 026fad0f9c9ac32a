// src/convert/sb.rs

//! Swift Backup conversion steps

use super::{ICON_FILE, Session, SourceConverter};
use crate::apk::PackageArchiveParser;
use crate::error::{Error, Result};
use crate::metadata::{CANONICAL_APK_NAME, DataCategory};
use crate::source::{ArtifactRole, FormatReader, SbReader, SourceBackup};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Converter for one Swift Backup descriptor
#[derive(Debug, Clone)]
pub struct SbConverter {
    reader: SbReader,
}

impl SbConverter {
    pub fn new(location: &Path) -> Result<Self> {
        Ok(Self {
            reader: SbReader::new(location)?,
        })
    }

    /// Use `parser` to identify the apk and extract its icon
    pub fn with_parser(location: &Path, parser: Arc<dyn PackageArchiveParser>) -> Result<Self> {
        Ok(Self {
            reader: SbReader::with_parser(location, parser)?,
        })
    }
}

fn cached_apk(source: &SourceBackup) -> Result<&Path> {
    source
        .artifact(ArtifactRole::Apk)
        .ok_or_else(|| Error::InvalidState("Swift Backup source without a cached apk".to_string()))
}

impl SourceConverter for SbConverter {
    fn reader(&self) -> &dyn FormatReader {
        &self.reader
    }

    fn backup_icon(&self, source: &SourceBackup, session: &mut Session<'_>) -> Result<Option<PathBuf>> {
        let path = session.staging_path().join(ICON_FILE);
        if self.reader.parser().extract_icon(cached_apk(source)?, &path)? {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }

    fn backup_apk(&self, source: &SourceBackup, session: &mut Session<'_>) -> Result<()> {
        let mut apks = vec![(CANONICAL_APK_NAME.to_string(), cached_apk(source)?.to_path_buf())];
        for split in source.artifacts_with(ArtifactRole::SplitApk) {
            let name = split
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::InvalidState(format!("Split without a name: {}", split.display())))?;
            apks.push((name, split.to_path_buf()));
        }
        session.archive_apks(&apks)
    }

    fn backup_data(&self, source: &SourceBackup, session: &mut Session<'_>) -> Result<()> {
        for (role, category) in [
            (ArtifactRole::InternalData, DataCategory::Internal),
            (ArtifactRole::ExternalData, DataCategory::External),
            (ArtifactRole::MediaObb, DataCategory::MediaObb),
        ] {
            if let Some(zip) = source.artifact(role) {
                session.archive_zip(category, zip)?;
            }
        }
        Ok(())
    }
}
