// src/convert/oab.rs

//! OAndBackup conversion steps
//!
//! Artifacts may be encrypted with the password mode; each one is decrypted
//! into the session's temp directory before it is transcoded.

use super::{Session, SourceConverter};
use crate::error::{Error, Result};
use crate::metadata::{CANONICAL_APK_NAME, DataCategory};
use crate::source::{ArtifactRole, FormatReader, OabReader, SourceBackup};
use std::path::Path;

/// Converter for one OAndBackup package directory
#[derive(Debug, Clone)]
pub struct OabConverter {
    reader: OabReader,
}

impl OabConverter {
    pub fn new(location: &Path) -> Result<Self> {
        Ok(Self {
            reader: OabReader::new(location)?,
        })
    }
}

impl SourceConverter for OabConverter {
    fn reader(&self) -> &dyn FormatReader {
        &self.reader
    }

    fn backup_apk(&self, source: &SourceBackup, session: &mut Session<'_>) -> Result<()> {
        let apk = source
            .artifact(ArtifactRole::Apk)
            .ok_or_else(|| Error::InvalidState("apk flag set without an apk artifact".to_string()))?;
        let plain = session.decrypt_source(apk, source.metadata.crypto)?;
        session.archive_apks(&[(CANONICAL_APK_NAME.to_string(), plain)])
    }

    fn backup_data(&self, source: &SourceBackup, session: &mut Session<'_>) -> Result<()> {
        for (role, category) in [
            (ArtifactRole::InternalData, DataCategory::Internal),
            (ArtifactRole::ExternalData, DataCategory::External),
        ] {
            if let Some(zip) = source.artifact(role) {
                let plain = session.decrypt_source(zip, source.metadata.crypto)?;
                session.archive_zip(category, &plain)?;
            }
        }
        Ok(())
    }
}
