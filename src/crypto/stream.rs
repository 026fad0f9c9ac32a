// src/crypto/stream.rs

//! Framed AES-256-GCM file format
//!
//! ```text
//! [magic "BKC1"][version u8][mode u8][m_cost u32][t_cost u32][p_cost u32]
//! [kdf_salt 32][file_salt 32][plaintext_len u64]
//! [len0 u32][frame0][len1 u32][frame1]...
//! ```
//!
//! All integers are little-endian. Each frame is sealed with the encoded
//! header plus a final-frame byte as associated data, and the top bit of
//! the last frame's length prefix is set. Each file gets its own key derived from
//! the session key and `file_salt`, so frame nonces only need to be unique
//! within one file: the frame index occupies the last 8 bytes of the nonce.

use super::CryptoError;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use zeroize::Zeroizing;

pub const MAGIC: [u8; 4] = *b"BKC1";
pub const FORMAT_VERSION: u8 = 1;
pub const SALT_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;
pub const HEADER_SIZE: usize = 4 + 1 + 1 + 12 + SALT_SIZE * 2 + 8;

/// Plaintext bytes per frame
pub const FRAME_SIZE: usize = 1024 * 1024;

/// Length-prefix bit marking the last frame of a stream
pub const FINAL_FRAME: u32 = 1 << 31;

/// Argon2id cost parameters, stored in each file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 4,
        }
    }
}

/// Fixed-size header preceding the frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub mode: u8,
    pub kdf: KdfParams,
    pub kdf_salt: [u8; SALT_SIZE],
    pub file_salt: [u8; SALT_SIZE],
    pub plaintext_len: u64,
}

impl StreamHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&MAGIC);
        out[4] = FORMAT_VERSION;
        out[5] = self.mode;
        out[6..10].copy_from_slice(&self.kdf.memory_kib.to_le_bytes());
        out[10..14].copy_from_slice(&self.kdf.iterations.to_le_bytes());
        out[14..18].copy_from_slice(&self.kdf.parallelism.to_le_bytes());
        out[18..50].copy_from_slice(&self.kdf_salt);
        out[50..82].copy_from_slice(&self.file_salt);
        out[82..90].copy_from_slice(&self.plaintext_len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self, CryptoError> {
        if bytes[0..4] != MAGIC {
            return Err(CryptoError::InvalidHeader("bad magic".to_string()));
        }
        if bytes[4] != FORMAT_VERSION {
            return Err(CryptoError::InvalidHeader(format!(
                "unsupported version {}",
                bytes[4]
            )));
        }
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mut kdf_salt = [0u8; SALT_SIZE];
        kdf_salt.copy_from_slice(&bytes[18..50]);
        let mut file_salt = [0u8; SALT_SIZE];
        file_salt.copy_from_slice(&bytes[50..82]);
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[82..90]);

        Ok(Self {
            mode: bytes[5],
            kdf: KdfParams {
                memory_kib: u32_at(6),
                iterations: u32_at(10),
                parallelism: u32_at(14),
            },
            kdf_salt,
            file_salt,
            plaintext_len: u64::from_le_bytes(len),
        })
    }
}

/// Derive a session key from a password with Argon2id
pub fn derive_password_key(
    password: &[u8],
    salt: &[u8; SALT_SIZE],
    kdf: KdfParams,
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(KEY_SIZE))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(password, salt, key.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Derive the per-file key from the session key
pub fn derive_file_key(session_key: &[u8; KEY_SIZE], file_salt: &[u8; SALT_SIZE]) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut hasher = Sha256::new();
    hasher.update(b"backup-convert file key");
    hasher.update(session_key);
    hasher.update(file_salt);
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&hasher.finalize());
    key
}

fn frame_nonce(index: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[NONCE_SIZE - 8..].copy_from_slice(&index.to_be_bytes());
    nonce
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Associated data for one frame: the encoded header plus the final flag
fn frame_aad(header: &[u8; HEADER_SIZE], last: bool) -> [u8; HEADER_SIZE + 1] {
    let mut aad = [0u8; HEADER_SIZE + 1];
    aad[..HEADER_SIZE].copy_from_slice(header);
    aad[HEADER_SIZE] = u8::from(last);
    aad
}

/// Encrypt `reader` into `writer` under `file_key`, writing `header` first
///
/// Every frame authenticates the header, and the last one carries
/// [`FINAL_FRAME`] in its length prefix. Empty input still produces one
/// (empty) final frame.
pub fn seal<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    header: &StreamHeader,
    file_key: &[u8; KEY_SIZE],
) -> Result<(), CryptoError> {
    let cipher =
        Aes256Gcm::new_from_slice(file_key).map_err(|e| CryptoError::Encryption(e.to_string()))?;
    let encoded = header.encode();
    writer.write_all(&encoded)?;

    let mut current = Zeroizing::new(vec![0u8; FRAME_SIZE]);
    let mut next = Zeroizing::new(vec![0u8; FRAME_SIZE]);
    let mut n = read_full(reader, &mut current)?;
    let mut index: u64 = 0;
    let mut total: u64 = 0;

    loop {
        // A short read means EOF; a full frame needs a look ahead
        let next_n = if n == FRAME_SIZE { read_full(reader, &mut next)? } else { 0 };
        let last = next_n == 0;

        let nonce = frame_nonce(index);
        let aad = frame_aad(&encoded, last);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &current[..n],
                    aad: &aad,
                },
            )
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        let mut prefix = ciphertext.len() as u32;
        if last {
            prefix |= FINAL_FRAME;
        }
        writer.write_all(&prefix.to_le_bytes())?;
        writer.write_all(&ciphertext)?;
        total += n as u64;
        index += 1;

        if last {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        n = next_n;
    }

    if total != header.plaintext_len {
        return Err(CryptoError::Truncated {
            expected: header.plaintext_len,
            actual: total,
        });
    }
    writer.flush()?;
    Ok(())
}

/// Read and decode the header of an encrypted stream
pub fn read_header<R: Read>(reader: &mut R) -> Result<StreamHeader, CryptoError> {
    let mut bytes = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut bytes)
        .map_err(|_| CryptoError::InvalidHeader("file too short".to_string()))?;
    StreamHeader::decode(&bytes)
}

/// Decrypt the frames following an already-read header
///
/// The stream must end with a frame flagged final; anything after it, or
/// EOF before it, is rejected.
pub fn open<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    header: &StreamHeader,
    file_key: &[u8; KEY_SIZE],
) -> Result<(), CryptoError> {
    let cipher =
        Aes256Gcm::new_from_slice(file_key).map_err(|e| CryptoError::Decryption(e.to_string()))?;
    let encoded = header.encode();
    let mut index: u64 = 0;
    let mut total: u64 = 0;
    let mut finished = false;

    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        if finished {
            return Err(CryptoError::Decryption("data after final frame".to_string()));
        }
        let prefix = u32::from_le_bytes(len_bytes);
        let last = prefix & FINAL_FRAME != 0;
        let frame_len = (prefix & !FINAL_FRAME) as usize;
        if frame_len < TAG_SIZE || frame_len > FRAME_SIZE + TAG_SIZE {
            return Err(CryptoError::Decryption(format!("invalid frame length {}", frame_len)));
        }

        let mut ciphertext = vec![0u8; frame_len];
        reader.read_exact(&mut ciphertext)?;
        let nonce = frame_nonce(index);
        let aad = frame_aad(&encoded, last);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: ciphertext.as_slice(),
                        aad: &aad,
                    },
                )
                .map_err(|_| {
                    CryptoError::Decryption("authentication failed, wrong credentials or corrupted file".to_string())
                })?,
        );
        writer.write_all(&plaintext)?;
        total += plaintext.len() as u64;
        index += 1;
        finished = last;
    }

    if !finished || total != header.plaintext_len {
        return Err(CryptoError::Truncated {
            expected: header.plaintext_len,
            actual: total,
        });
    }
    writer.flush()?;
    Ok(())
}
