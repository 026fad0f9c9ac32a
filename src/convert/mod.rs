// src/convert/mod.rs

//! Conversion orchestration
//!
//! Every conversion walks the same state machine, whatever the source tool:
//!
//! ```text
//! INIT -> METADATA_READ -> STAGED -> [APK_DONE] -> [DATA_DONE]
//!      -> METADATA_WRITTEN -> LEDGER_SEALED -> ENCRYPTED -> COMMITTED
//! ```
//!
//! The per-tool differences live behind [`SourceConverter`]; the shared
//! driver in [`run`] sequences the steps, checks for cancellation between
//! them and owns the single failure path. Once the backup item is staged,
//! any failure cleans up the staging directory, closes the crypto session,
//! deletes decrypted temporaries and only then surfaces one [`BackupError`].

pub mod oab;
pub mod sb;
pub mod tb;

pub use oab::OabConverter;
pub use sb::SbConverter;
pub use tb::TbConverter;

use crate::apk;
use crate::archive::{EntryClass, ScratchArena, TarChunkWriter, zip_to_tar};
use crate::config::ConvertConfig;
use crate::crypto::{CryptoMode, CryptoPipeline};
use crate::error::{BackupError, Error, Result};
use crate::item::{BackupIdentity, BackupItem};
use crate::ledger::{ChecksumLedger, LEDGER_FILE};
use crate::metadata::{BackupFlags, DataCategory, DestinationMetadata};
use crate::progress::ProgressTracker;
use crate::source::{FormatReader, SourceBackup, SourceKind};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Base name of the apk archive
pub const SOURCE_PREFIX: &str = "source";

/// Base name of data archives, followed by the data index
pub const DATA_PREFIX: &str = "data";

/// Icon file written into the backup
pub const ICON_FILE: &str = "icon.png";

/// Ledger key prefix of signer certificate digests
pub const CERT_PREFIX: &str = "cert_";

/// Options for controlling a conversion
#[derive(Default, Clone)]
pub struct ConvertOptions {
    /// Cancel token - set to true to request cancellation
    pub cancel: Option<Arc<AtomicBool>>,
    /// Progress tracker for stage messages and entry counts
    pub progress: Option<Arc<dyn ProgressTracker>>,
}

impl ConvertOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cancel token
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Set the progress tracker
    pub fn with_progress(mut self, progress: Arc<dyn ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Check if cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// Return Cancelled error if cancellation requested
    pub(crate) fn check_cancelled(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled(operation.to_string()))
        } else {
            Ok(())
        }
    }

    /// Count one transcoded archive entry
    pub(crate) fn entry_done(&self) {
        if let Some(ref progress) = self.progress {
            progress.increment(1);
        }
    }

    fn report(&self, message: &str) {
        if let Some(ref progress) = self.progress {
            progress.set_message(message);
        }
    }

    fn finish(&self, result: std::result::Result<&str, &str>) {
        if let Some(ref progress) = self.progress {
            match result {
                Ok(message) => progress.finish_with_message(message),
                Err(message) => progress.finish_with_error(message),
            }
        }
    }
}

/// Conversion state machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConversionState {
    /// Nothing read yet
    Init,
    /// Source descriptor parsed
    MetadataRead,
    /// Backup item and staging directory exist
    Staged,
    /// Apk archive written
    ApkDone,
    /// Data archives written
    DataDone,
    /// Destination metadata written
    MetadataWritten,
    /// Checksum ledger closed and written
    LedgerSealed,
    /// Checksum ledger encrypted
    Encrypted,
    /// Staging swapped into the canonical location
    Committed,
}

impl ConversionState {
    /// Stage description used while moving into this state
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Init => "starting",
            Self::MetadataRead => "reading source metadata",
            Self::Staged => "creating backup item",
            Self::ApkDone => "backing up apk files",
            Self::DataDone => "backing up data",
            Self::MetadataWritten => "writing metadata",
            Self::LedgerSealed => "writing checksums",
            Self::Encrypted => "encrypting checksums",
            Self::Committed => "committing backup",
        }
    }

    /// Message of a failure while moving into this state
    fn failure_message(&self) -> String {
        format!("Failed while {}", self.operation())
    }
}

impl fmt::Display for ConversionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::MetadataRead => "METADATA_READ",
            Self::Staged => "STAGED",
            Self::ApkDone => "APK_DONE",
            Self::DataDone => "DATA_DONE",
            Self::MetadataWritten => "METADATA_WRITTEN",
            Self::LedgerSealed => "LEDGER_SEALED",
            Self::Encrypted => "ENCRYPTED",
            Self::Committed => "COMMITTED",
        };
        f.write_str(name)
    }
}

/// Terminal status of a failed step
#[derive(Debug)]
struct StageFailure {
    target: ConversionState,
    error: Error,
}

/// Per-tool steps of a conversion
///
/// Implementations only write into the [`Session`]'s staging directory and
/// leave sequencing, sealing and commit to [`run`].
pub trait SourceConverter {
    /// Reader of the source descriptor
    fn reader(&self) -> &dyn FormatReader;

    /// Parse the source into normalized metadata and artifacts
    fn read_metadata(&self, config: &ConvertConfig) -> Result<SourceBackup> {
        self.reader().read(config)
    }

    /// Write the app icon into the staging directory
    ///
    /// Best-effort: failures are logged and the conversion continues.
    fn backup_icon(&self, _source: &SourceBackup, _session: &mut Session<'_>) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    /// Archive the apk files; only called when the apk flag is set
    fn backup_apk(&self, source: &SourceBackup, session: &mut Session<'_>) -> Result<()>;

    /// Archive the data categories; only called when a data flag is set
    fn backup_data(&self, source: &SourceBackup, session: &mut Session<'_>) -> Result<()>;
}

/// Working state of one staged conversion
pub struct Session<'a> {
    options: &'a ConvertOptions,
    split_size: u64,
    dest: DestinationMetadata,
    staging: PathBuf,
    ledger: ChecksumLedger,
    crypto: CryptoPipeline,
    arena: ScratchArena,
    decrypted: Vec<PathBuf>,
    temp: TempDir,
}

impl<'a> Session<'a> {
    pub fn options(&self) -> &ConvertOptions {
        self.options
    }

    /// Metadata the backup is being written for
    pub fn destination(&self) -> &DestinationMetadata {
        &self.dest
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    /// Private directory for intermediate files, removed with the session
    pub fn temp_dir(&self) -> &Path {
        self.temp.path()
    }

    pub fn ledger(&self) -> &ChecksumLedger {
        &self.ledger
    }

    /// Record the digest of a file placed in the staging directory
    pub fn record(&mut self, path: &Path) -> Result<()> {
        self.ledger.add_file(path).map(|_| ())
    }

    /// Plaintext path of a source file encrypted with `mode`
    ///
    /// Decrypted copies are tracked and deleted when the session ends.
    pub fn decrypt_source(&mut self, file: &Path, mode: CryptoMode) -> Result<PathBuf> {
        if !mode.is_encrypted() {
            return Ok(file.to_path_buf());
        }
        // One directory per file: internal and external zips share a name
        let out_dir = self.temp.path().join(format!("decrypted{}", self.decrypted.len()));
        fs::create_dir_all(&out_dir)?;
        let mut files = self.crypto.decrypt(&[file.to_path_buf()], mode, &out_dir)?;
        self.decrypted.extend(files.iter().cloned());
        files
            .pop()
            .ok_or_else(|| Error::InvalidState(format!("No plaintext produced for {}", file.display())))
    }

    /// Record the signer certificate digests of `apk`
    ///
    /// Best-effort: an apk without a readable v1 signature adds nothing.
    pub fn record_cert_digests(&mut self, apk: &Path) {
        let digests = match apk::signer_cert_digests(apk, self.ledger.algorithm()) {
            Ok(digests) => digests,
            Err(e) => {
                warn!("Could not read signer certificates of {}: {}", apk.display(), e);
                return;
            }
        };
        for (i, digest) in digests.into_iter().enumerate() {
            if let Err(e) = self.ledger.add(format!("{}{}", CERT_PREFIX, i), digest.value) {
                warn!("Could not record certificate digest {}: {}", i, e);
                return;
            }
        }
    }

    /// Open a destination tar stream named `name`
    pub fn tar_writer(&self, name: &str) -> Result<TarChunkWriter> {
        TarChunkWriter::create(&self.staging, name, self.dest.tar_type, self.split_size)
    }

    /// Open the destination tar stream of a data category
    ///
    /// Data archives are numbered by the category's position among the
    /// categories present in the destination flags.
    pub fn data_writer(&self, category: DataCategory) -> Result<TarChunkWriter> {
        let index = DataCategory::present(self.dest.flags)
            .iter()
            .position(|c| *c == category)
            .ok_or_else(|| {
                Error::InvalidState(format!("{:?} data is not part of this backup", category))
            })?;
        self.tar_writer(&format!("{}{}", DATA_PREFIX, index))
    }

    /// Finish `writer`, encrypt its chunks and record their digests
    pub fn seal(&mut self, writer: TarChunkWriter) -> Result<Vec<PathBuf>> {
        let prefix = writer.prefix().to_string();
        let entries = writer.entry_count();
        let chunks = writer.finish()?;
        let chunks = self.crypto.encrypt(&chunks, self.dest.crypto)?;
        for chunk in &chunks {
            self.record(chunk)?;
        }
        debug!("Sealed {} ({} entries, {} chunks)", prefix, entries, chunks.len());
        Ok(chunks)
    }

    /// Archive apk files under the given names into the apk stream
    ///
    /// Certificate digests are taken from the first apk.
    pub fn archive_apks(&mut self, apks: &[(String, PathBuf)]) -> Result<()> {
        let Some((_, primary)) = apks.first() else {
            return Err(Error::InvalidState("No apk files to archive".to_string()));
        };
        self.record_cert_digests(primary);

        let mut writer = self.tar_writer(SOURCE_PREFIX)?;
        for (name, path) in apks {
            crate::archive::append_file_from_disk(&mut writer, name, path, self.options)?;
        }
        self.seal(writer)?;
        Ok(())
    }

    /// Transcode a data zip into the stream of `category`
    ///
    /// The leading `<package>/` directory of every entry is stripped.
    pub fn archive_zip(&mut self, category: DataCategory, source: &Path) -> Result<()> {
        let mut writer = self.data_writer(category)?;
        let prefix = format!("{}/", self.dest.package_name);
        let class = match category {
            DataCategory::Internal => EntryClass::InternalData,
            DataCategory::External | DataCategory::MediaObb => EntryClass::ExternalData,
        };
        let records = zip_to_tar(source, Some(&prefix), class, &mut writer, &self.arena, self.options)?;
        debug!("Transcoded {} entries from {}", records.len(), source.display());
        self.seal(writer)?;
        Ok(())
    }

    /// Close the crypto session and delete decrypted temporaries
    fn close(&mut self) {
        self.crypto.close();
        for file in self.decrypted.drain(..) {
            debug!("Deleting {}", file.display());
            if let Err(e) = fs::remove_file(&file)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Failed to delete decrypted file {}: {}", file.display(), e);
            }
        }
    }
}

/// Run one step, moving `state` to `next` on success
fn step(
    state: &mut ConversionState,
    next: ConversionState,
    options: &ConvertOptions,
    action: impl FnOnce() -> Result<()>,
) -> std::result::Result<(), StageFailure> {
    let outcome = options.check_cancelled(next.operation()).and_then(|()| {
        options.report(next.operation());
        action()
    });
    if let Err(error) = outcome {
        return Err(StageFailure { target: next, error });
    }
    debug!("{} -> {}", state, next);
    *state = next;
    Ok(())
}

fn discard_icon(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        debug!("Failed to remove {}: {}", path.display(), e);
    }
}

/// Steps from STAGED to COMMITTED
fn drive(
    converter: &dyn SourceConverter,
    source: &SourceBackup,
    session: &mut Session<'_>,
    item: &mut BackupItem,
    state: &mut ConversionState,
) -> std::result::Result<(), StageFailure> {
    let options = session.options;

    match converter.backup_icon(source, session) {
        Ok(Some(icon)) => {
            if let Err(e) = session.record(&icon) {
                warn!("Dropping icon {}: {}", icon.display(), e);
                discard_icon(&icon);
            }
        }
        Ok(None) => debug!("No icon for {}", source.metadata.package_name),
        Err(e) => {
            warn!("Could not back up icon: {}", e);
            // The converter may have created the file before failing
            let partial = session.staging.join(ICON_FILE);
            if partial.exists() {
                discard_icon(&partial);
            }
        }
    }

    if session.dest.flags.contains(BackupFlags::HAS_APK) {
        step(state, ConversionState::ApkDone, options, || {
            converter.backup_apk(source, session)
        })?;
    }

    if session.dest.flags.has_any_data() {
        step(state, ConversionState::DataDone, options, || {
            converter.backup_data(source, session)
        })?;
    }

    step(state, ConversionState::MetadataWritten, options, || {
        let path = session.dest.write_to(&session.staging)?;
        session.record(&path)
    })?;

    step(state, ConversionState::LedgerSealed, options, || {
        session.ledger.close();
        session.ledger.write_to(&session.staging).map(|_| ())
    })?;

    step(state, ConversionState::Encrypted, options, || {
        let ledger = session.staging.join(LEDGER_FILE);
        session.crypto.encrypt(&[ledger], session.dest.crypto)?;
        Ok(())
    })?;

    step(state, ConversionState::Committed, options, || {
        item.commit().map(|_| ())
    })
}

/// Wrap `error` as the conversion's single failure
fn abort(options: &ConvertOptions, package: &str, message: &str, error: Error) -> BackupError {
    warn!("Conversion of {} failed: {}: {}", package, message, error);
    options.finish(Err(message));
    BackupError::new(package, message, error)
}

/// Convert one backup with `converter`
///
/// Returns the metadata of the committed backup. On failure nothing is left
/// behind at the canonical location beyond what existed before.
pub fn run(
    converter: &dyn SourceConverter,
    config: &ConvertConfig,
    options: &ConvertOptions,
) -> std::result::Result<DestinationMetadata, BackupError> {
    let reader = converter.reader();
    let package = reader.package_name().to_string();
    let kind = reader.kind();
    info!("Converting {} backup of {}", kind, package);

    config
        .validate()
        .map_err(|e| abort(options, &package, "Invalid configuration", e))?;

    let mut state = ConversionState::Init;
    let source = options
        .check_cancelled(ConversionState::MetadataRead.operation())
        .and_then(|()| {
            options.report(ConversionState::MetadataRead.operation());
            converter.read_metadata(config)
        })
        .map_err(|e| abort(options, &package, &ConversionState::MetadataRead.failure_message(), e))?;
    debug!("{} -> {}", state, ConversionState::MetadataRead);
    state = ConversionState::MetadataRead;

    let identity = BackupIdentity::new(&package, config.user_id, kind.name());
    let dest = DestinationMetadata::from_source(&source.metadata, config, &identity.backup_name());

    let staged = (|| {
        let mut crypto = CryptoPipeline::open(&config.crypto)?;
        let scratch = config.scratch_root();
        let temp = fs::create_dir_all(&scratch)
            .and_then(|()| {
                tempfile::Builder::new()
                    .prefix(&format!("{}-convert-", package))
                    .tempdir_in(&scratch)
            })
            .map_err(|e| {
                crypto.close();
                Error::from(e)
            })?;
        match BackupItem::create(&config.backup_root, identity) {
            Ok(item) => Ok((item, crypto, temp)),
            Err(e) => {
                crypto.close();
                Err(e)
            }
        }
    })();
    let (mut item, crypto, temp) = staged
        .map_err(|e| abort(options, &package, &ConversionState::Staged.failure_message(), e))?;
    debug!("{} -> {}", state, ConversionState::Staged);
    state = ConversionState::Staged;

    let mut session = Session {
        options,
        split_size: config.split_size,
        arena: ScratchArena::new(temp.path(), config.spill_threshold),
        staging: item.staging_path().to_path_buf(),
        ledger: ChecksumLedger::new(dest.checksum_algo),
        dest,
        crypto,
        decrypted: Vec::new(),
        temp,
    };

    match drive(converter, &source, &mut session, &mut item, &mut state) {
        Ok(()) => {
            session.close();
            info!("Converted {} backup of {} into {}", kind, package, item.canonical_path().display());
            options.finish(Ok("Conversion complete"));
            Ok(session.dest)
        }
        Err(StageFailure { target, error }) => {
            debug!("Rolling back {} from {}", package, state);
            item.cleanup();
            session.close();
            Err(abort(options, &package, &target.failure_message(), error))
        }
    }
}

/// Create the converter for `kind` at `location`
pub fn converter_for(kind: SourceKind, location: &Path) -> Result<Box<dyn SourceConverter>> {
    Ok(match kind {
        SourceKind::OAndBackup => Box::new(OabConverter::new(location)?),
        SourceKind::TitaniumBackup => Box::new(TbConverter::new(location)?),
        SourceKind::SwiftBackup => Box::new(SbConverter::new(location)?),
    })
}

/// Convert the `kind` backup at `location`
///
/// `location` is the OAndBackup package directory, the Titanium Backup
/// properties file or the Swift Backup XML descriptor.
pub fn convert(
    kind: SourceKind,
    location: &Path,
    config: &ConvertConfig,
    options: &ConvertOptions,
) -> std::result::Result<DestinationMetadata, BackupError> {
    let converter = converter_for(kind, location).map_err(|e| {
        abort(options, &location.display().to_string(), "Invalid source location", e)
    })?;
    run(converter.as_ref(), config, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;

    #[test]
    fn test_cancel_token() {
        let cancel = Arc::new(AtomicBool::new(false));
        let options = ConvertOptions::new().with_cancel(Arc::clone(&cancel));
        assert!(options.check_cancelled("x").is_ok());
        cancel.store(true, Ordering::Relaxed);
        assert!(options.is_cancelled());
        assert!(matches!(options.check_cancelled("x"), Err(Error::Cancelled(ref op)) if op == "x"));
    }

    #[test]
    fn test_entry_done_counts() {
        let progress = Arc::new(SilentProgress::new());
        let options = ConvertOptions::new().with_progress(progress.clone());
        options.entry_done();
        options.entry_done();
        assert_eq!(progress.position(), 2);
    }

    #[test]
    fn test_state_order() {
        assert!(ConversionState::Init < ConversionState::MetadataRead);
        assert!(ConversionState::ApkDone < ConversionState::DataDone);
        assert!(ConversionState::Encrypted < ConversionState::Committed);
        assert_eq!(ConversionState::LedgerSealed.to_string(), "LEDGER_SEALED");
    }

    #[test]
    fn test_step_failure_keeps_state() {
        let options = ConvertOptions::new();
        let mut state = ConversionState::Staged;
        let failure = step(&mut state, ConversionState::ApkDone, &options, || {
            Err(Error::SourceFormat("broken".into()))
        })
        .unwrap_err();
        assert_eq!(failure.target, ConversionState::ApkDone);
        assert_eq!(state, ConversionState::Staged);

        step(&mut state, ConversionState::ApkDone, &options, || Ok(())).unwrap();
        assert_eq!(state, ConversionState::ApkDone);
    }

    #[test]
    fn test_step_checks_cancellation_first() {
        let options = ConvertOptions::new().with_cancel(Arc::new(AtomicBool::new(true)));
        let mut state = ConversionState::Staged;
        let mut ran = false;
        let failure = step(&mut state, ConversionState::DataDone, &options, || {
            ran = true;
            Ok(())
        })
        .unwrap_err();
        assert!(!ran);
        assert!(matches!(failure.error, Error::Cancelled(_)));
    }

    #[test]
    fn test_convert_rejects_bad_location() {
        let config = ConvertConfig::default();
        let err = convert(
            SourceKind::TitaniumBackup,
            Path::new("/tb/nodash.properties"),
            &config,
            &ConvertOptions::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SourceFormat);
    }
}
