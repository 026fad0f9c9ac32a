// src/crypto/mod.rs

//! Encryption of backup artifacts
//!
//! A [`CryptoPipeline`] holds the credentials for one conversion. Artifacts
//! are encrypted in place (the plaintext is removed once the ciphertext is
//! written) and encrypted source files are decrypted into scratch
//! temporaries which the caller deletes after use.
//!
//! Two modes are supported besides `none`:
//! - **password**: an Argon2id session key derived from a password, files
//!   carry the `.enc` extension
//! - **key**: a raw 256-bit key given as hex, files carry the `.aes`
//!   extension

pub mod stream;

use crate::config::CryptoConfig;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use stream::{KEY_SIZE, KdfParams, SALT_SIZE, StreamHeader};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

/// Encryption errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("No credentials configured for {0} encryption")]
    MissingCredentials(CryptoMode),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid encrypted file header: {0}")]
    InvalidHeader(String),

    #[error("Encrypted file was written in {actual} mode, expected {expected}")]
    ModeMismatch { expected: CryptoMode, actual: String },

    #[error("Encrypted stream truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },

    #[error("Unknown encryption mode: {0}")]
    UnknownMode(String),

    #[error("Crypto session already closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Encryption mode of a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CryptoMode {
    #[default]
    None,
    Password,
    Key,
}

impl CryptoMode {
    /// Suffix appended to encrypted file names
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Password => ".enc",
            Self::Key => ".aes",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Password => "password",
            Self::Key => "key",
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !matches!(self, Self::None)
    }

    fn header_byte(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Password => 1,
            Self::Key => 2,
        }
    }

    fn from_header_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::None),
            1 => Some(Self::Password),
            2 => Some(Self::Key),
            _ => None,
        }
    }
}

impl fmt::Display for CryptoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CryptoMode {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "password" | "pgp" => Ok(Self::Password),
            "key" | "aes" => Ok(Self::Key),
            _ => Err(CryptoError::UnknownMode(s.to_string())),
        }
    }
}

impl Serialize for CryptoMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for CryptoMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Key material held by an open session
struct Credentials {
    password: Option<Zeroizing<Vec<u8>>>,
    key: Option<Zeroizing<[u8; KEY_SIZE]>>,
    kdf: KdfParams,
    /// Password-derived key for encryption, derived on first use
    session: Option<([u8; SALT_SIZE], Zeroizing<[u8; KEY_SIZE]>)>,
    /// Password-derived keys seen while decrypting, by KDF salt
    derived: HashMap<[u8; SALT_SIZE], Zeroizing<[u8; KEY_SIZE]>>,
}

/// A crypto session for one conversion
pub struct CryptoPipeline {
    credentials: Option<Credentials>,
}

impl CryptoPipeline {
    /// Open a session with the configured credentials
    ///
    /// Credentials are validated eagerly: a malformed hex key fails here
    /// rather than halfway through a conversion.
    pub fn open(config: &CryptoConfig) -> Result<Self, CryptoError> {
        let key = match &config.key_hex {
            Some(hex_key) => Some(parse_key(hex_key)?),
            None => None,
        };
        let password = config
            .password
            .as_ref()
            .map(|p| Zeroizing::new(p.as_bytes().to_vec()));

        if config.mode == CryptoMode::Password && password.is_none() {
            return Err(CryptoError::MissingCredentials(CryptoMode::Password));
        }
        if config.mode == CryptoMode::Key && key.is_none() {
            return Err(CryptoError::MissingCredentials(CryptoMode::Key));
        }

        Ok(Self {
            credentials: Some(Credentials {
                password,
                key,
                kdf: KdfParams {
                    memory_kib: config.kdf_memory_kib,
                    iterations: config.kdf_iterations,
                    parallelism: config.kdf_parallelism,
                },
                session: None,
                derived: HashMap::new(),
            }),
        })
    }

    /// Whether [`CryptoPipeline::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.credentials.is_none()
    }

    /// Encrypt `files` in place
    ///
    /// Returns the encrypted file paths in input order. The plaintext files
    /// are deleted after their ciphertext is fully written. With
    /// [`CryptoMode::None`] the input list is returned unchanged.
    pub fn encrypt(&mut self, files: &[PathBuf], mode: CryptoMode) -> Result<Vec<PathBuf>, CryptoError> {
        if !mode.is_encrypted() {
            return Ok(files.to_vec());
        }
        let creds = self.credentials.as_mut().ok_or(CryptoError::Closed)?;

        let (kdf_salt, session_key) = session_key(creds, mode)?;
        let mut encrypted = Vec::with_capacity(files.len());

        for file in files {
            let target = append_extension(file, mode.extension());
            let plaintext_len = fs::metadata(file)?.len();

            let mut file_salt = [0u8; SALT_SIZE];
            OsRng.fill_bytes(&mut file_salt);
            let file_key = stream::derive_file_key(&session_key, &file_salt);
            let header = StreamHeader {
                mode: mode.header_byte(),
                kdf: creds.kdf,
                kdf_salt,
                file_salt,
                plaintext_len,
            };

            let result = (|| {
                let mut reader = BufReader::new(File::open(file)?);
                let mut writer = BufWriter::new(File::create(&target)?);
                stream::seal(&mut reader, &mut writer, &header, &file_key)?;
                writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
                Ok::<(), CryptoError>(())
            })();

            if let Err(e) = result {
                let _ = fs::remove_file(&target);
                return Err(e);
            }

            fs::remove_file(file)?;
            debug!("Encrypted {} -> {}", file.display(), target.display());
            encrypted.push(target);
        }

        Ok(encrypted)
    }

    /// Decrypt `files` into `out_dir`
    ///
    /// Each output keeps the source name minus the mode's extension. The
    /// returned temporaries belong to the caller, who must delete them once
    /// consumed. Inputs are never modified.
    pub fn decrypt(
        &mut self,
        files: &[PathBuf],
        mode: CryptoMode,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, CryptoError> {
        if !mode.is_encrypted() {
            return Ok(files.to_vec());
        }
        let creds = self.credentials.as_mut().ok_or(CryptoError::Closed)?;
        let mut decrypted = Vec::with_capacity(files.len());

        for file in files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let stem = name.strip_suffix(mode.extension()).unwrap_or(&name);
            let target = out_dir.join(stem);

            let result = (|| {
                let mut reader = BufReader::new(File::open(file)?);
                let header = stream::read_header(&mut reader)?;
                let actual = CryptoMode::from_header_byte(header.mode);
                if actual != Some(mode) {
                    return Err(CryptoError::ModeMismatch {
                        expected: mode,
                        actual: actual.map_or_else(|| format!("unknown ({})", header.mode), |m| m.to_string()),
                    });
                }
                let key = file_key(creds, mode, &header)?;
                let mut writer = BufWriter::new(File::create(&target)?);
                stream::open(&mut reader, &mut writer, &header, &key)?;
                Ok(())
            })();

            if let Err(e) = result {
                let _ = fs::remove_file(&target);
                for done in &decrypted {
                    let _ = fs::remove_file(done);
                }
                return Err(e);
            }

            debug!("Decrypted {} -> {}", file.display(), target.display());
            decrypted.push(target);
        }

        Ok(decrypted)
    }

    /// Wipe key material; further encrypt/decrypt calls fail
    ///
    /// Idempotent.
    pub fn close(&mut self) {
        if let Some(mut creds) = self.credentials.take() {
            if let Some((salt, _)) = creds.session.as_mut() {
                salt.zeroize();
            }
            creds.derived.clear();
            debug!("Crypto session closed");
        }
    }
}

impl Drop for CryptoPipeline {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("Crypto session dropped without close");
            self.close();
        }
    }
}

fn parse_key(hex_key: &str) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let bytes = Zeroizing::new(
        hex::decode(hex_key.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
    );
    if bytes.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_SIZE,
            bytes.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Session key used for encryption in `mode`
fn session_key(
    creds: &mut Credentials,
    mode: CryptoMode,
) -> Result<([u8; SALT_SIZE], Zeroizing<[u8; KEY_SIZE]>), CryptoError> {
    match mode {
        CryptoMode::Key => {
            let key = creds
                .key
                .as_ref()
                .ok_or(CryptoError::MissingCredentials(CryptoMode::Key))?;
            Ok(([0u8; SALT_SIZE], key.clone()))
        }
        CryptoMode::Password => {
            if creds.session.is_none() {
                let password = creds
                    .password
                    .as_ref()
                    .ok_or(CryptoError::MissingCredentials(CryptoMode::Password))?;
                let mut salt = [0u8; SALT_SIZE];
                OsRng.fill_bytes(&mut salt);
                let key = stream::derive_password_key(password, &salt, creds.kdf)?;
                creds.session = Some((salt, key));
            }
            match &creds.session {
                Some((salt, key)) => Ok((*salt, key.clone())),
                None => Err(CryptoError::MissingCredentials(CryptoMode::Password)),
            }
        }
        CryptoMode::None => Err(CryptoError::UnknownMode("none".to_string())),
    }
}

/// Per-file key for decrypting a file with `header`
fn file_key(
    creds: &mut Credentials,
    mode: CryptoMode,
    header: &StreamHeader,
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let session = match mode {
        CryptoMode::Key => creds
            .key
            .as_ref()
            .ok_or(CryptoError::MissingCredentials(CryptoMode::Key))?
            .clone(),
        CryptoMode::Password => {
            if let Some((salt, key)) = &creds.session
                && *salt == header.kdf_salt
            {
                key.clone()
            } else if let Some(key) = creds.derived.get(&header.kdf_salt) {
                key.clone()
            } else {
                let password = creds
                    .password
                    .as_ref()
                    .ok_or(CryptoError::MissingCredentials(CryptoMode::Password))?;
                let key = stream::derive_password_key(password, &header.kdf_salt, header.kdf)?;
                creds.derived.insert(header.kdf_salt, key.clone());
                key
            }
        }
        CryptoMode::None => return Err(CryptoError::UnknownMode("none".to_string())),
    };
    Ok(stream::derive_file_key(&session, &header.file_salt))
}

fn append_extension(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(extension);
    PathBuf::from(name)
}
