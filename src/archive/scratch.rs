// src/archive/scratch.rs

//! Scratch arena for entries whose size is not known up front
//!
//! A tar header needs the entry size before the data, while a zip entry's
//! real decompressed size is only known after reading it. Entries up to the
//! spill threshold are buffered in memory; larger ones spill to a temporary
//! file that is deleted when the buffer is dropped, on every exit path.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Buffering policy for entry data
#[derive(Debug, Clone)]
pub struct ScratchArena {
    dir: PathBuf,
    threshold: u64,
}

/// Fully buffered entry data
pub enum ScratchBuffer {
    Memory(Vec<u8>),
    Disk { file: NamedTempFile, len: u64 },
}

impl ScratchArena {
    /// Spill to files in `dir` above `threshold` bytes
    pub fn new(dir: &Path, threshold: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            threshold,
        }
    }

    /// Read `reader` to the end, in memory or spilled to disk
    pub fn buffer<R: Read>(&self, reader: &mut R) -> io::Result<ScratchBuffer> {
        let mut head = Vec::new();
        reader
            .by_ref()
            .take(self.threshold.saturating_add(1))
            .read_to_end(&mut head)?;

        if head.len() as u64 <= self.threshold {
            return Ok(ScratchBuffer::Memory(head));
        }

        let mut file = NamedTempFile::new_in(&self.dir)?;
        file.write_all(&head)?;
        let rest = io::copy(reader, &mut file)?;
        file.flush()?;
        let len = head.len() as u64 + rest;
        debug!("Spilled {} byte entry to {}", len, file.path().display());
        Ok(ScratchBuffer::Disk { file, len })
    }
}

impl ScratchBuffer {
    pub fn len(&self) -> u64 {
        match self {
            Self::Memory(data) => data.len() as u64,
            Self::Disk { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self, Self::Disk { .. })
    }

    /// Reader over the buffered bytes from the start
    pub fn reader(&mut self) -> io::Result<Box<dyn Read + '_>> {
        match self {
            Self::Memory(data) => Ok(Box::new(Cursor::new(data.as_slice()))),
            Self::Disk { file, .. } => {
                let handle = file.as_file_mut();
                handle.seek(SeekFrom::Start(0))?;
                Ok(Box::new(handle))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_small_entry_stays_in_memory() {
        let dir = TempDir::new().unwrap();
        let arena = ScratchArena::new(dir.path(), 16);
        let mut buffer = arena.buffer(&mut &b"0123456789abcdef"[..]).unwrap();

        assert!(!buffer.is_spilled());
        assert_eq!(buffer.len(), 16);
        let mut out = Vec::new();
        buffer.reader().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"0123456789abcdef");
    }

    #[test]
    fn test_large_entry_spills_and_is_removed() {
        let dir = TempDir::new().unwrap();
        let arena = ScratchArena::new(dir.path(), 16);
        let data = vec![9u8; 100];
        let mut buffer = arena.buffer(&mut data.as_slice()).unwrap();

        assert!(buffer.is_spilled());
        assert_eq!(buffer.len(), 100);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let mut out = Vec::new();
        buffer.reader().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, data);

        drop(buffer);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
