// src/hash.rs

//! Configurable digests for the checksum ledger
//!
//! Every artifact placed in a converted backup is digested with the
//! algorithm recorded in the destination metadata (`checksum_algo`):
//! - **SHA-256**: default, used for new backups
//! - **SHA-512**: stronger variant some users select
//! - **MD5**: legacy, only needed to check Titanium Backup apk names

use md5::Md5;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// MD5 (128-bit, not collision resistant)
    Md5,
    /// SHA-256 (256-bit cryptographic hash)
    #[default]
    Sha256,
    /// SHA-512 (512-bit cryptographic hash)
    Sha512,
}

impl HashAlgorithm {
    /// Get the hash output length in bytes
    #[inline]
    pub const fn output_len(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    /// Get the hash output length as a hex string
    #[inline]
    pub const fn hex_len(&self) -> usize {
        self.output_len() * 2
    }

    /// Get the algorithm name as a string
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            _ => Err(HashError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl serde::Serialize for HashAlgorithm {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> serde::Deserialize<'de> for HashAlgorithm {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Hash computation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    /// Unknown hash algorithm name
    UnknownAlgorithm(String),
}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAlgorithm(name) => write!(f, "unknown hash algorithm: {}", name),
        }
    }
}

impl std::error::Error for HashError {}

/// A hash value with its algorithm
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HexDigest {
    /// The algorithm used
    pub algorithm: HashAlgorithm,
    /// The hash value as a lowercase hex string
    pub value: String,
}

impl HexDigest {
    /// Get the hash value as a hex string
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for HexDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Incremental hasher over any supported algorithm
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Md5(Md5),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    /// Create a new hasher with the specified algorithm
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Md5 => HasherState::Md5(Md5::new()),
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => HasherState::Sha512(Sha512::new()),
        };
        Self { algorithm, state }
    }

    /// Update the hasher with more data
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Md5(hasher) => hasher.update(data),
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Sha512(hasher) => hasher.update(data),
        }
    }

    /// Finalize and return the digest
    pub fn finalize(self) -> HexDigest {
        let value = match self.state {
            HasherState::Md5(hasher) => hex::encode(hasher.finalize()),
            HasherState::Sha256(hasher) => hex::encode(hasher.finalize()),
            HasherState::Sha512(hasher) => hex::encode(hasher.finalize()),
        };
        HexDigest {
            algorithm: self.algorithm,
            value,
        }
    }
}

/// Compute the digest of a byte slice
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> HexDigest {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compute the digest of data from a reader
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, reader: &mut R) -> io::Result<HexDigest> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 8192];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Compute the digest of a file, streaming its content
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> io::Result<HexDigest> {
    let mut file = File::open(path)?;
    hash_reader(algorithm, &mut file)
}
