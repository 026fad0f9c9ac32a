// src/compression/mod.rs
//! Unified compression/decompression utilities
//!
//! Provides a consistent interface over the tar compression codecs found in
//! source backups (gzip, bzip2) and offered for destination backups
//! (none, gzip, bzip2, zstd).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::io::{self, Read, Write};
use std::str::FromStr;
use thiserror::Error;

/// Compression-related errors
#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Failed to create {format} encoder: {source}")]
    EncoderCreation {
        format: &'static str,
        source: io::Error,
    },

    #[error("Failed to create {format} decoder: {source}")]
    DecoderCreation {
        format: &'static str,
        source: io::Error,
    },

    #[error("Unsupported compression format: {0}")]
    UnsupportedFormat(String),
}

/// Supported compression formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionFormat {
    /// No compression (plain tar)
    None,
    /// Gzip compression (.gz)
    #[default]
    Gzip,
    /// Bzip2 compression (.bz2)
    Bzip2,
    /// Zstandard compression (.zst)
    Zstd,
}

impl CompressionFormat {
    /// Get the tar file extension for this format
    ///
    /// # Examples
    /// ```
    /// use backup_convert::compression::CompressionFormat;
    ///
    /// assert_eq!(CompressionFormat::Gzip.tar_extension(), ".tar.gz");
    /// assert_eq!(CompressionFormat::None.tar_extension(), ".tar");
    /// ```
    pub fn tar_extension(&self) -> &'static str {
        match self {
            Self::None => ".tar",
            Self::Gzip => ".tar.gz",
            Self::Bzip2 => ".tar.bz2",
            Self::Zstd => ".tar.zst",
        }
    }

    /// Get the single-file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Bzip2 => ".bz2",
            Self::Zstd => ".zst",
        }
    }

    /// Get a human-readable name for this format
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Zstd => "zstd",
        }
    }

    /// Detect compression format from magic bytes
    ///
    /// Magic bytes:
    /// - Gzip: `1f 8b`
    /// - Bzip2: `42 5a 68` ("BZh")
    /// - Zstd: `28 b5 2f fd`
    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if data.starts_with(b"BZh") {
            Self::Bzip2
        } else if data.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Self::Zstd
        } else {
            Self::None
        }
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for CompressionFormat {
    type Err = CompressionError;

    /// Parse a codec identifier
    ///
    /// Accepts the canonical names as well as the identifiers written by
    /// the source tools (`GZIP`, `BZIP2`) and tar's short flags (`z`, `j`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "tar" => Ok(Self::None),
            "gzip" | "gz" | "z" => Ok(Self::Gzip),
            "bzip2" | "bz2" | "j" => Ok(Self::Bzip2),
            "zstd" | "zst" => Ok(Self::Zstd),
            _ => Err(CompressionError::UnsupportedFormat(s.to_string())),
        }
    }
}

impl Serialize for CompressionFormat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for CompressionFormat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Create a decompressing reader for the given format
///
/// Gzip and bzip2 decoders accept concatenated members, as the source tools
/// sometimes write multi-member streams.
pub fn create_decoder<'a, R: Read + 'a>(
    reader: R,
    format: CompressionFormat,
) -> Result<Box<dyn Read + 'a>, CompressionError> {
    match format {
        CompressionFormat::None => Ok(Box::new(reader)),
        CompressionFormat::Gzip => Ok(Box::new(flate2::read::MultiGzDecoder::new(reader))),
        CompressionFormat::Bzip2 => Ok(Box::new(bzip2::read::MultiBzDecoder::new(reader))),
        CompressionFormat::Zstd => {
            let decoder = zstd::Decoder::new(reader).map_err(|e| CompressionError::DecoderCreation {
                format: "zstd",
                source: e,
            })?;
            Ok(Box::new(decoder))
        }
    }
}

/// A compressing writer that must be finished explicitly
///
/// Dropping an encoder without calling [`Encoder::finish`] may leave a
/// truncated stream, so every writer in the transcoder finishes it before
/// closing the sink beneath.
pub enum Encoder<W: Write> {
    None(W),
    Gzip(flate2::write::GzEncoder<W>),
    Bzip2(bzip2::write::BzEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    /// Create a compressing writer for the given format
    pub fn new(writer: W, format: CompressionFormat) -> Result<Self, CompressionError> {
        Ok(match format {
            CompressionFormat::None => Self::None(writer),
            CompressionFormat::Gzip => Self::Gzip(flate2::write::GzEncoder::new(
                writer,
                flate2::Compression::default(),
            )),
            CompressionFormat::Bzip2 => Self::Bzip2(bzip2::write::BzEncoder::new(
                writer,
                bzip2::Compression::default(),
            )),
            CompressionFormat::Zstd => Self::Zstd(zstd::Encoder::new(writer, 0).map_err(|e| {
                CompressionError::EncoderCreation {
                    format: "zstd",
                    source: e,
                }
            })?),
        })
    }

    /// Write the stream trailer and return the inner writer
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::None(w) => Ok(w),
            Self::Gzip(e) => e.finish(),
            Self::Bzip2(e) => e.finish(),
            Self::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::None(w) => w.write(buf),
            Self::Gzip(e) => e.write(buf),
            Self::Bzip2(e) => e.write(buf),
            Self::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::None(w) => w.flush(),
            Self::Gzip(e) => e.flush(),
            Self::Bzip2(e) => e.flush(),
            Self::Zstd(e) => e.flush(),
        }
    }
}
