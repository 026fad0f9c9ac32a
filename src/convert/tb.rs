// src/convert/tb.rs

//! Titanium Backup conversion steps
//!
//! The apk is a single compressed file and the data is one compressed tar
//! holding both internal and external data, which is fanned out into two
//! destination streams.

use super::{ICON_FILE, Session, SourceConverter};
use crate::archive::tar_fan_out;
use crate::compression::create_decoder;
use crate::error::{Error, Result};
use crate::hash;
use crate::metadata::{BackupFlags, CANONICAL_APK_NAME, DataCategory};
use crate::source::{ArtifactRole, FormatReader, SourceBackup, TbReader};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Converter for one Titanium Backup properties file
#[derive(Debug, Clone)]
pub struct TbConverter {
    reader: TbReader,
}

impl TbConverter {
    pub fn new(location: &Path) -> Result<Self> {
        Ok(Self {
            reader: TbReader::new(location)?,
        })
    }
}

impl SourceConverter for TbConverter {
    fn reader(&self) -> &dyn FormatReader {
        &self.reader
    }

    fn backup_icon(&self, source: &SourceBackup, session: &mut Session<'_>) -> Result<Option<PathBuf>> {
        let Some(icon) = &source.icon else {
            return Ok(None);
        };
        let path = session.staging_path().join(ICON_FILE);
        fs::write(&path, icon)?;
        Ok(Some(path))
    }

    fn backup_apk(&self, source: &SourceBackup, session: &mut Session<'_>) -> Result<()> {
        let compressed = source
            .artifact(ArtifactRole::Apk)
            .ok_or_else(|| Error::InvalidState("apk flag set without an apk artifact".to_string()))?;
        let apk = session.temp_dir().join(CANONICAL_APK_NAME);

        {
            let mut decoder = create_decoder(BufReader::new(File::open(compressed)?), source.metadata.tar_type)?;
            let mut out = BufWriter::new(File::create(&apk)?);
            let size = io::copy(&mut decoder, &mut out)?;
            out.flush()?;
            debug!("Decompressed {} ({} bytes)", compressed.display(), size);
        }

        if let Some(expected) = &source.apk_digest {
            let actual = hash::hash_file(expected.algorithm, &apk)?;
            if !actual.value.eq_ignore_ascii_case(&expected.value) {
                warn!(
                    "{} does not match its recorded digest (expected {}, got {})",
                    compressed.display(),
                    expected,
                    actual
                );
            }
        }

        let result = session.archive_apks(&[(CANONICAL_APK_NAME.to_string(), apk.clone())]);
        if let Err(e) = fs::remove_file(&apk) {
            debug!("Failed to remove {}: {}", apk.display(), e);
        }
        result
    }

    fn backup_data(&self, source: &SourceBackup, session: &mut Session<'_>) -> Result<()> {
        let data = source
            .artifact(ArtifactRole::CombinedData)
            .ok_or_else(|| Error::InvalidState("data flag set without a data artifact".to_string()))?;
        let flags = session.destination().flags;

        let mut internal = if flags.contains(BackupFlags::HAS_INTERNAL_DATA) {
            Some(session.data_writer(DataCategory::Internal)?)
        } else {
            None
        };
        let mut external = if flags.contains(BackupFlags::HAS_EXTERNAL_DATA) {
            Some(session.data_writer(DataCategory::External)?)
        } else {
            None
        };

        let stats = tar_fan_out(
            data,
            source.metadata.tar_type,
            &source.metadata.package_name,
            internal.as_mut(),
            external.as_mut(),
            session.options(),
        )?;
        info!(
            "Split {}: {} internal, {} external, {} dropped entries",
            data.display(),
            stats.internal,
            stats.external,
            stats.dropped
        );

        if let Some(writer) = internal {
            session.seal(writer)?;
        }
        if let Some(writer) = external {
            session.seal(writer)?;
        }
        Ok(())
    }
}
