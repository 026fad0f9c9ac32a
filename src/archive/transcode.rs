// src/archive/transcode.rs

//! Entry-by-entry transcoding into destination tar streams
//!
//! One entry is fully read and written before the next starts. Cancellation
//! is checked between entries.

use super::scratch::ScratchArena;
use super::tar_writer::{EntryMeta, TarChunkWriter};
use super::{ArchiveEntryRecord, EntryClass, normalize_entry_path};
use crate::compression::{CompressionFormat, create_decoder};
use crate::convert::ConvertOptions;
use crate::error::Result;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::debug;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Copy every entry of the zip at `source` into `writer`
///
/// A leading `strip_prefix` is removed from each entry name; entries that
/// become empty (the root directory marker) are skipped. File data goes
/// through `arena` so the tar header carries the real decompressed size.
pub fn zip_to_tar(
    source: &Path,
    strip_prefix: Option<&str>,
    class: EntryClass,
    writer: &mut TarChunkWriter,
    arena: &ScratchArena,
    options: &ConvertOptions,
) -> Result<Vec<ArchiveEntryRecord>> {
    let mut zip = zip::ZipArchive::new(BufReader::new(File::open(source)?))?;
    let mut records = Vec::with_capacity(zip.len());

    for index in 0..zip.len() {
        options.check_cancelled("archive transcoding")?;

        let mut entry = zip.by_index(index)?;
        let raw = entry.name().to_string();
        let stripped = match strip_prefix {
            Some(prefix) => raw.strip_prefix(prefix).unwrap_or(&raw),
            None => &raw,
        };
        let Some(path) = normalize_entry_path(stripped)? else {
            debug!("Skipping root entry {}", raw);
            continue;
        };

        let mtime = zip_mtime(entry.last_modified());
        let unix_mode = entry.unix_mode();

        if entry.is_dir() {
            let mode = unix_mode.map_or(0o755, |m| m & 0o7777);
            writer.append(&EntryMeta::directory(path.clone(), mode, mtime), io::empty())?;
            records.push(ArchiveEntryRecord {
                path,
                size: None,
                class,
            });
            continue;
        }

        if let Some(mode) = unix_mode
            && mode & S_IFMT == S_IFLNK
        {
            let mut target = String::new();
            entry.read_to_string(&mut target)?;
            writer.append(&EntryMeta::symlink(path.clone(), target, mtime), io::empty())?;
            records.push(ArchiveEntryRecord {
                path,
                size: None,
                class,
            });
            continue;
        }

        let mut buffer = arena.buffer(&mut entry)?;
        let size = buffer.len();
        let mode = unix_mode.map_or(0o644, |m| m & 0o7777);
        writer.append(&EntryMeta::file(path.clone(), size, mode, mtime), buffer.reader()?)?;
        debug!("Transcoded {} ({} bytes)", path, size);

        options.entry_done();
        records.push(ArchiveEntryRecord {
            path,
            size: Some(size),
            class,
        });
    }

    Ok(records)
}

/// Entry counts of a [`tar_fan_out`] run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutStats {
    pub internal: u64,
    pub external: u64,
    /// Entries outside both data prefixes, or of an unsupported type
    pub dropped: u64,
}

/// Split a compressed source tar into internal and external data streams
///
/// Entries under `data/data/<package>/` go to `internal`, entries under
/// `data/data/.external.<package>/` go to `external`; the prefix and a
/// following `./` are stripped. Everything else is dropped and counted.
pub fn tar_fan_out(
    source: &Path,
    codec: CompressionFormat,
    package: &str,
    mut internal: Option<&mut TarChunkWriter>,
    mut external: Option<&mut TarChunkWriter>,
    options: &ConvertOptions,
) -> Result<FanOutStats> {
    let internal_prefix = format!("data/data/{}/", package);
    let external_prefix = format!("data/data/.external.{}/", package);

    let decoder = create_decoder(BufReader::new(File::open(source)?), codec)?;
    let mut archive = tar::Archive::new(decoder);
    let mut stats = FanOutStats::default();

    for entry in archive.entries()? {
        options.check_cancelled("archive transcoding")?;
        let mut entry = entry?;

        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let (class, rest) = if let Some(rest) = raw.strip_prefix(&internal_prefix) {
            (EntryClass::InternalData, rest)
        } else if let Some(rest) = raw.strip_prefix(&external_prefix) {
            (EntryClass::ExternalData, rest)
        } else {
            debug!("Dropping entry outside data prefixes: {}", raw);
            stats.dropped += 1;
            continue;
        };

        let rest = rest.strip_prefix("./").unwrap_or(rest);
        let Some(path) = normalize_entry_path(rest)? else {
            continue;
        };

        let header = entry.header();
        let mode = header.mode().unwrap_or(0o644) & 0o7777;
        let uid = header.uid().unwrap_or(0);
        let gid = header.gid().unwrap_or(0);
        let mtime = header.mtime().unwrap_or(0);

        let meta = match header.entry_type() {
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                EntryMeta::file(path, entry.size(), mode, mtime)
            }
            tar::EntryType::Directory => {
                let path = if path.ends_with('/') { path } else { format!("{}/", path) };
                EntryMeta::directory(path, mode, mtime)
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .map(|t| t.to_string_lossy().into_owned())
                    .unwrap_or_default();
                EntryMeta::symlink(path, target, mtime)
            }
            other => {
                debug!("Dropping unsupported {:?} entry {}", other, raw);
                stats.dropped += 1;
                continue;
            }
        }
        .with_owner(uid, gid);

        let target = match class {
            EntryClass::ExternalData => external.as_deref_mut(),
            _ => internal.as_deref_mut(),
        };
        let Some(target) = target else {
            debug!("No destination stream for {:?} entry {}", class, raw);
            stats.dropped += 1;
            continue;
        };

        target.append(&meta, &mut entry)?;
        options.entry_done();
        match class {
            EntryClass::ExternalData => stats.external += 1,
            _ => stats.internal += 1,
        }
    }

    if stats.dropped > 0 {
        debug!("Dropped {} entries of {}", stats.dropped, source.display());
    }
    Ok(stats)
}

/// Append the file at `source` to `writer` as `name`
pub fn append_file_from_disk(
    writer: &mut TarChunkWriter,
    name: &str,
    source: &Path,
    options: &ConvertOptions,
) -> Result<ArchiveEntryRecord> {
    options.check_cancelled("archive transcoding")?;

    let file = File::open(source)?;
    let metadata = file.metadata()?;
    let size = metadata.len();
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());
    let mode = metadata.permissions().mode() & 0o7777;

    writer.append(
        &EntryMeta::file(name, size, mode, mtime),
        BufReader::new(file).take(size),
    )?;
    debug!("Archived {} as {} ({} bytes)", source.display(), name, size);
    options.entry_done();

    Ok(ArchiveEntryRecord {
        path: name.to_string(),
        size: Some(size),
        class: EntryClass::Apk,
    })
}

fn zip_mtime(time: zip::DateTime) -> u64 {
    chrono::NaiveDate::from_ymd_opt(time.year().into(), time.month().into(), time.day().into())
        .and_then(|date| {
            date.and_hms_opt(
                time.hour().into(),
                time.minute().into(),
                time.second().into(),
            )
        })
        .map_or(0, |dt| dt.and_utc().timestamp().max(0) as u64)
}
