// src/lib.rs

//! Backup format converter
//!
//! Converts app backups made by third-party Android backup tools
//! (OAndBackup, Titanium Backup, Swift Backup) into one unified layout:
//! tar archives compressed with a configurable codec, cut into fixed-size
//! chunks, optionally encrypted, and covered by a checksum ledger.
//!
//! # Architecture
//!
//! - Readers (`source`): parse each tool's descriptor into normalized metadata
//! - Transcoder (`archive`): re-encodes zip and tar sources entry by entry
//! - Crypto (`crypto`): encrypts artifacts and decrypts encrypted sources
//! - Ledger (`ledger`): digests every artifact, sealed last
//! - Staging (`item`): all writes land in a staging directory that is
//!   swapped into place atomically on commit
//! - Orchestrator (`convert`): drives one conversion through a fixed
//!   state machine with a single rollback path
//!
//! # Example
//!
//! ```no_run
//! use backup_convert::{ConvertConfig, ConvertOptions, SourceKind, convert};
//! use std::path::Path;
//!
//! let config = ConvertConfig::new("/sdcard/AppManager");
//! let meta = convert(
//!     SourceKind::TitaniumBackup,
//!     Path::new("/sdcard/TitaniumBackup/org.example-20210101-120000.properties"),
//!     &config,
//!     &ConvertOptions::new(),
//! )?;
//! println!("converted {} into {}", meta.package_name, meta.backup_name);
//! # Ok::<(), backup_convert::BackupError>(())
//! ```

pub mod apk;
pub mod archive;
pub mod compression;
pub mod config;
pub mod convert;
pub mod crypto;
mod error;
pub mod hash;
pub mod item;
pub mod ledger;
pub mod metadata;
pub mod progress;
pub mod source;

pub use apk::{ApkInfo, ManifestParser, PackageArchiveParser};
pub use compression::CompressionFormat;
pub use config::{ConvertConfig, CryptoConfig};
pub use convert::{
    ConversionState, ConvertOptions, OabConverter, SbConverter, SourceConverter, TbConverter,
    convert, run,
};
pub use crypto::{CryptoError, CryptoMode, CryptoPipeline};
pub use error::{BackupError, Error, ErrorKind, Result};
pub use hash::{HashAlgorithm, HexDigest};
pub use item::{BackupIdentity, BackupItem, ItemState};
pub use ledger::{ChecksumEntry, ChecksumLedger};
pub use metadata::{BackupFlags, DataCategory, DestinationMetadata, SourceMetadata};
pub use progress::{CallbackProgress, LogProgress, ProgressEvent, ProgressTracker, SilentProgress};
pub use source::{FormatReader, SourceBackup, SourceKind};
