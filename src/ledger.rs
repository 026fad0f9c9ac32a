// src/ledger.rs

//! Checksum ledger of a converted backup
//!
//! The ledger lists one digest per artifact placed in the backup. It is
//! written once all artifacts exist and is then encrypted as the final step
//! before commit. Its own digest is never recorded.

use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm, HexDigest};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Base name of the ledger file (the crypto extension is appended)
pub const LEDGER_FILE: &str = "checksums.txt";

/// One artifact digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    /// Artifact name relative to the backup directory
    pub name: String,
    /// Lowercase hex digest
    pub digest: String,
}

/// Ordered name to digest manifest
#[derive(Debug)]
pub struct ChecksumLedger {
    algorithm: HashAlgorithm,
    entries: Vec<ChecksumEntry>,
    names: HashSet<String>,
    closed: bool,
}

impl ChecksumLedger {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            entries: Vec::new(),
            names: HashSet::new(),
            closed: false,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Record a digest for `name`
    ///
    /// Fails with [`Error::InvalidState`] if `name` is already present or the
    /// ledger is closed.
    pub fn add(&mut self, name: impl Into<String>, digest: impl Into<String>) -> Result<()> {
        let name = name.into();
        if self.closed {
            return Err(Error::InvalidState(format!(
                "Cannot add {} to a closed checksum ledger",
                name
            )));
        }
        if !self.names.insert(name.clone()) {
            return Err(Error::InvalidState(format!(
                "Duplicate checksum ledger entry: {}",
                name
            )));
        }
        let digest = digest.into();
        debug!("Ledger entry {} = {}", name, digest);
        self.entries.push(ChecksumEntry { name, digest });
        Ok(())
    }

    /// Hash the file at `path` and record it under its file name
    pub fn add_file(&mut self, path: &Path) -> Result<HexDigest> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidState(format!("No file name in {}", path.display())))?;
        let digest = hash::hash_file(self.algorithm, path)?;
        self.add(name, digest.value.clone())?;
        Ok(digest)
    }

    /// Freeze the ledger; later additions fail
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn entries(&self) -> &[ChecksumEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.digest.as_str())
    }

    /// Render as `digest<TAB>name` lines in insertion order
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.digest);
            out.push('\t');
            out.push_str(&entry.name);
            out.push('\n');
        }
        out
    }

    /// Write the closed ledger into `dir`, returning the file path
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        if !self.closed {
            return Err(Error::InvalidState(
                "Checksum ledger must be closed before it is written".to_string(),
            ));
        }
        let path = dir.join(LEDGER_FILE);
        fs::write(&path, self.serialize())?;
        Ok(path)
    }

    /// Parse ledger text back into entries
    pub fn parse(content: &str) -> Result<Vec<ChecksumEntry>> {
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                let (digest, name) = line.split_once('\t').ok_or_else(|| {
                    Error::SourceFormat(format!("Malformed checksum line {}: {}", i + 1, line))
                })?;
                Ok(ChecksumEntry {
                    name: name.to_string(),
                    digest: digest.to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_duplicate_name_rejected() {
        let mut ledger = ChecksumLedger::new(HashAlgorithm::Sha256);
        ledger.add("meta.am.v1", "aa").unwrap();
        let err = ledger.add("meta.am.v1", "bb").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(ledger.entries().len(), 1);
    }

    #[test]
    fn test_closed_ledger_rejects_additions() {
        let mut ledger = ChecksumLedger::new(HashAlgorithm::Sha256);
        ledger.close();
        assert!(ledger.add("icon.png", "cc").is_err());
    }

    #[test]
    fn test_write_requires_close() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ChecksumLedger::new(HashAlgorithm::Sha256);
        ledger.add("cert_0", "dd").unwrap();
        assert!(ledger.write_to(dir.path()).is_err());

        ledger.close();
        let path = ledger.write_to(dir.path()).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "dd\tcert_0\n");
    }

    #[test]
    fn test_add_file_and_parse() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("source.tar.gz.0");
        fs::write(&file, b"Hello, World!").unwrap();

        let mut ledger = ChecksumLedger::new(HashAlgorithm::Sha256);
        ledger.add_file(&file).unwrap();
        ledger.add("cert_0", "00ff").unwrap();

        let parsed = ChecksumLedger::parse(&ledger.serialize()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "source.tar.gz.0");
        assert_eq!(
            parsed[0].digest,
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
        assert_eq!(ledger.get("cert_0"), Some("00ff"));
    }

    #[test]
    fn test_parse_rejects_malformed_line() {
        assert!(ChecksumLedger::parse("no-tab-here\n").is_err());
    }
}
