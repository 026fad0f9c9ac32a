// src/archive/split.rs

//! Size-bounded chunking of a byte stream
//!
//! [`SplitWriter`] writes `<prefix>.0`, `<prefix>.1`, ... so that every
//! chunk but the last holds exactly `split_size` bytes. A chunk file is only
//! opened once there is a byte to put into it, so a stream of `S` bytes
//! yields exactly `ceil(S / split_size)` files.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct SplitWriter {
    dir: PathBuf,
    prefix: String,
    split_size: u64,
    current: Option<File>,
    written: u64,
    files: Vec<PathBuf>,
}

impl SplitWriter {
    /// Create a writer placing chunks named `<prefix>.<n>` in `dir`
    pub fn new(dir: &Path, prefix: impl Into<String>, split_size: u64) -> io::Result<Self> {
        if split_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "split size must be greater than zero",
            ));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.into(),
            split_size,
            current: None,
            written: 0,
            files: Vec::new(),
        })
    }

    /// Chunk files opened so far
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    fn open_next(&mut self) -> io::Result<()> {
        if let Some(file) = self.current.take() {
            file.sync_all()?;
        }
        let path = self.dir.join(format!("{}.{}", self.prefix, self.files.len()));
        debug!("Opening chunk {}", path.display());
        self.current = Some(File::create(&path)?);
        self.files.push(path);
        self.written = 0;
        Ok(())
    }

    /// Flush the last chunk and return all chunk paths in order
    pub fn finish(mut self) -> io::Result<Vec<PathBuf>> {
        if let Some(mut file) = self.current.take() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(std::mem::take(&mut self.files))
    }
}

impl Write for SplitWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.current.is_none() || self.written >= self.split_size {
            self.open_next()?;
        }

        let room = (self.split_size - self.written).min(buf.len() as u64) as usize;
        let file = self
            .current
            .as_mut()
            .ok_or_else(|| io::Error::other("no open chunk"))?;
        let n = file.write(&buf[..room])?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}
