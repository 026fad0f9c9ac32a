// src/archive/mod.rs

//! Archive transcoding
//!
//! Source archives (zip for OAndBackup and Swift Backup, compressed tar for
//! Titanium Backup) are re-encoded entry by entry into destination tar
//! streams. Each destination stream is compressed with the configured codec
//! and cut into fixed-size chunk files.
//!
//! ```text
//! entry -> tar::Builder -> Encoder (codec) -> BufWriter -> SplitWriter -> chunk files
//! ```

pub mod scratch;
pub mod split;
pub mod tar_writer;
pub mod transcode;

pub use scratch::{ScratchArena, ScratchBuffer};
pub use split::SplitWriter;
pub use tar_writer::{EntryKind, EntryMeta, TarChunkWriter};
pub use transcode::{FanOutStats, append_file_from_disk, tar_fan_out, zip_to_tar};

use crate::error::{Error, Result};
use std::path::{Component, Path};

/// Classification of one transcoded entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    InternalData,
    ExternalData,
    Apk,
    Unknown,
}

/// Per-entry record produced while transcoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntryRecord {
    /// Path after prefix stripping
    pub path: String,
    /// Size in bytes; for zip entries only known once spilled
    pub size: Option<u64>,
    pub class: EntryClass,
}

/// Normalize an entry path taken from a source archive
///
/// Strips leading slashes and `.` components and rejects `..`. A trailing
/// slash marking a directory is kept. Returns `None` for paths that are
/// empty after normalization (the archive root marker).
pub fn normalize_entry_path(raw: &str) -> Result<Option<String>> {
    let is_dir = raw.ends_with('/');
    let relative = raw.trim_start_matches('/');

    let mut parts = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(c) => parts.push(c.to_string_lossy().into_owned()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(Error::SourceFormat(format!(
                    "Archive entry escapes its root: {}",
                    raw
                )));
            }
        }
    }

    if parts.is_empty() {
        return Ok(None);
    }

    let mut path = parts.join("/");
    if is_dir {
        path.push('/');
    }
    Ok(Some(path))
}
