// src/error.rs

//! Error types for backup conversion
//!
//! Every fallible operation in the crate returns [`Error`]. The orchestrator
//! normalizes failures at stage boundaries into a single [`BackupError`] that
//! carries the error kind, a message naming the failed stage, and the
//! original cause.

use crate::compression::CompressionError;
use crate::crypto::CryptoError;
use crate::hash::HashError;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed, missing or unparseable descriptor (including reserved names)
    #[error("Invalid source backup: {0}")]
    SourceFormat(String),

    /// An expected apk or data file is absent from the source backup
    #[error("Source artifact missing: {}", .0.display())]
    SourceArtifactMissing(PathBuf),

    /// Compression identifier not in the supported set
    #[error("Unsupported compression codec: {0}")]
    UnsupportedCodec(String),

    /// Parsed package name disagrees with the expected one
    #[error("Package name mismatch: expected {expected}, found {actual}")]
    PackageIdentityMismatch { expected: String, actual: String },

    /// Encryption or decryption failed
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Staging directory could not be swapped into place
    #[error("Failed to commit backup to {}: {source}", path.display())]
    Commit {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Commit failed and the previous backup could not be moved back;
    /// it is still intact under `previous`
    #[error(
        "Failed to commit backup to {}, previous backup left at {}: {source}",
        path.display(),
        previous.display()
    )]
    CommitStranded {
        path: PathBuf,
        previous: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Generic read/write fault
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Cooperative cancellation was requested
    #[error("Conversion cancelled during {0}")]
    Cancelled(String),

    /// Logic error: an operation was attempted in the wrong state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unreadable or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Discriminant of [`Error`], exposed on [`BackupError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SourceFormat,
    SourceArtifactMissing,
    UnsupportedCodec,
    PackageIdentityMismatch,
    Crypto,
    Commit,
    Io,
    Cancelled,
    InvalidState,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SourceFormat => "source-format",
            Self::SourceArtifactMissing => "source-artifact-missing",
            Self::UnsupportedCodec => "unsupported-codec",
            Self::PackageIdentityMismatch => "package-identity-mismatch",
            Self::Crypto => "crypto",
            Self::Commit => "commit",
            Self::Io => "io",
            Self::Cancelled => "cancelled",
            Self::InvalidState => "invalid-state",
            Self::Config => "config",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Get the kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceFormat(_) => ErrorKind::SourceFormat,
            Self::SourceArtifactMissing(_) => ErrorKind::SourceArtifactMissing,
            Self::UnsupportedCodec(_) => ErrorKind::UnsupportedCodec,
            Self::PackageIdentityMismatch { .. } => ErrorKind::PackageIdentityMismatch,
            Self::Crypto(_) => ErrorKind::Crypto,
            Self::Commit { .. } | Self::CommitStranded { .. } => ErrorKind::Commit,
            Self::Io(_) => ErrorKind::Io,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<CompressionError> for Error {
    fn from(err: CompressionError) -> Self {
        match err {
            CompressionError::UnsupportedFormat(name) => Self::UnsupportedCodec(name),
            CompressionError::EncoderCreation { source, .. }
            | CompressionError::DecoderCreation { source, .. } => Self::Io(source),
        }
    }
}

impl From<HashError> for Error {
    fn from(err: HashError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => Self::Io(e),
            other => Self::SourceFormat(format!("Invalid zip archive: {}", other)),
        }
    }
}

/// The single error surfaced by a conversion
///
/// Wraps the original [`Error`] with the stage that failed and the package
/// being converted.
#[derive(Error, Debug)]
#[error("{message} ({package}): {source}")]
pub struct BackupError {
    kind: ErrorKind,
    package: String,
    message: String,
    #[source]
    source: Error,
}

impl BackupError {
    /// Wrap an error raised while converting `package`
    pub fn new(package: impl Into<String>, message: impl Into<String>, source: Error) -> Self {
        Self {
            kind: source.kind(),
            package: package.into(),
            message: message.into(),
            source,
        }
    }

    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the package the conversion was for
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Get the human-readable message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the original cause
    pub fn cause(&self) -> &Error {
        &self.source
    }

    /// Consume the wrapper and return the original cause
    pub fn into_cause(self) -> Error {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::SourceFormat("x".into()).kind(), ErrorKind::SourceFormat);
        assert_eq!(
            Error::Io(io::Error::other("boom")).kind(),
            ErrorKind::Io
        );
        assert_eq!(
            Error::PackageIdentityMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .kind(),
            ErrorKind::PackageIdentityMismatch
        );
    }

    #[test]
    fn test_compression_error_conversion() {
        let err: Error = CompressionError::UnsupportedFormat("lz4".into()).into();
        assert!(matches!(err, Error::UnsupportedCodec(ref name) if name == "lz4"));
    }

    #[test]
    fn test_hash_error_conversion() {
        let err: Error = "crc32".parse::<crate::hash::HashAlgorithm>().unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_backup_error_keeps_cause() {
        let err = BackupError::new(
            "org.example",
            "Failed to read metadata",
            Error::SourceFormat("empty".into()),
        );
        assert_eq!(err.kind(), ErrorKind::SourceFormat);
        assert_eq!(err.package(), "org.example");
        assert!(err.source().is_some());
        assert!(err.to_string().contains("Failed to read metadata"));
    }
}
