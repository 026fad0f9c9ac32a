// src/archive/tar_writer.rs

//! Destination tar stream writer
//!
//! Entries are written with ustar headers. Paths and link targets that do
//! not fit, and sizes beyond the 8 GiB ustar limit, are carried in a POSIX
//! extended (PAX) header preceding the entry.

use super::split::SplitWriter;
use crate::compression::{CompressionFormat, Encoder};
use crate::error::Result;
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Largest size a ustar header stores in octal
const USTAR_MAX_SIZE: u64 = (1 << 33) - 1;
const USTAR_NAME_LEN: usize = 100;

/// Kind of a destination tar entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink(String),
}

/// Header fields of one destination entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
}

impl EntryMeta {
    pub fn file(path: impl Into<String>, size: u64, mode: u32, mtime: u64) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            size,
            mode,
            uid: 0,
            gid: 0,
            mtime,
        }
    }

    pub fn directory(path: impl Into<String>, mode: u32, mtime: u64) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            size: 0,
            mode,
            uid: 0,
            gid: 0,
            mtime,
        }
    }

    pub fn symlink(path: impl Into<String>, target: impl Into<String>, mtime: u64) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Symlink(target.into()),
            size: 0,
            mode: 0o777,
            uid: 0,
            gid: 0,
            mtime,
        }
    }

    pub fn with_owner(mut self, uid: u64, gid: u64) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }
}

type Sink = Encoder<BufWriter<SplitWriter>>;

/// Compressed, split tar stream
///
/// Layers close inside-out in [`TarChunkWriter::finish`]: the tar trailer is
/// written, then the codec trailer, then the buffered bytes and the last
/// chunk file. Dropping the writer without finishing leaves incomplete
/// chunks that the caller's cleanup removes with the staging directory.
pub struct TarChunkWriter {
    builder: tar::Builder<Sink>,
    prefix: String,
    entries: u64,
}

impl TarChunkWriter {
    /// Start a stream whose chunks are `<name><tar_ext>.<n>` in `dir`
    pub fn create(dir: &Path, name: &str, format: CompressionFormat, split_size: u64) -> Result<Self> {
        let prefix = format!("{}{}", name, format.tar_extension());
        let split = SplitWriter::new(dir, prefix.clone(), split_size)?;
        let encoder = Encoder::new(BufWriter::new(split), format)?;
        Ok(Self {
            builder: tar::Builder::new(encoder),
            prefix,
            entries: 0,
        })
    }

    /// Chunk file prefix, e.g. `data0.tar.gz`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Append one entry; `data` must yield exactly `meta.size` bytes for files
    pub fn append<R: Read>(&mut self, meta: &EntryMeta, data: R) -> io::Result<()> {
        let mut header = tar::Header::new_ustar();
        let mut pax: Vec<(&str, Vec<u8>)> = Vec::new();

        let (entry_type, size) = match &meta.kind {
            EntryKind::File => (tar::EntryType::Regular, meta.size),
            EntryKind::Directory => (tar::EntryType::Directory, 0),
            EntryKind::Symlink(_) => (tar::EntryType::Symlink, 0),
        };
        header.set_entry_type(entry_type);

        if header.set_path(&meta.path).is_err() {
            pax.push(("path", meta.path.as_bytes().to_vec()));
            set_truncated(&mut header.as_old_mut().name, &meta.path);
        }

        if let EntryKind::Symlink(target) = &meta.kind
            && header.set_link_name(target).is_err()
        {
            pax.push(("linkpath", target.as_bytes().to_vec()));
            set_truncated(&mut header.as_old_mut().linkname, target);
        }

        if size > USTAR_MAX_SIZE {
            pax.push(("size", size.to_string().into_bytes()));
        }

        header.set_size(size);
        header.set_mode(meta.mode);
        header.set_uid(meta.uid);
        header.set_gid(meta.gid);
        header.set_mtime(meta.mtime);
        header.set_cksum();

        if !pax.is_empty() {
            debug!("PAX header for {}", meta.path);
            self.builder
                .append_pax_extensions(pax.iter().map(|(k, v)| (*k, v.as_slice())))?;
        }

        match meta.kind {
            EntryKind::File => self.builder.append(&header, data)?,
            _ => self.builder.append(&header, io::empty())?,
        }
        self.entries += 1;
        Ok(())
    }

    /// Close all layers and return the chunk files in order
    pub fn finish(self) -> Result<Vec<PathBuf>> {
        let encoder = self.builder.into_inner()?;
        let buffered = encoder.finish()?;
        let split = buffered.into_inner().map_err(|e| e.into_error())?;
        let files = split.finish()?;
        debug!(
            "Finished {} with {} entries in {} chunks",
            self.prefix,
            self.entries,
            files.len()
        );
        Ok(files)
    }
}

/// Fill a fixed-size ustar field with as much of `value` as fits
fn set_truncated(field: &mut [u8], value: &str) {
    field.fill(0);
    let mut end = value.len().min(field.len()).min(USTAR_NAME_LEN);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    field[..end].copy_from_slice(&value.as_bytes()[..end]);
}
