// tests/common/mod.rs

//! Shared fixtures for the conversion integration tests.
//!
//! Builders write small but structurally faithful source backups for each
//! tool; readers reassemble destination chunk streams for assertions.

#![allow(dead_code)]

use backup_convert::compression::create_decoder;
use backup_convert::hash::{self, HashAlgorithm};
use backup_convert::{
    ChecksumLedger, CompressionFormat, ConvertConfig, CryptoConfig, CryptoMode, CryptoPipeline,
};
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const PKG: &str = "org.example.app";

/// Bytes standing in for an apk; not a signed archive
pub const APK_BYTES: &[u8] = b"PK\x03\x04 not really an apk, but enough to archive";

/// PNG signature, carried base64-encoded in Titanium Backup properties
pub const ICON_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n";

pub const PASSWORD: &str = "correct horse battery staple";

/// A scratch root holding sources, scratch files and the backup root
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sources")).unwrap();
        Self { dir }
    }

    pub fn sources(&self) -> PathBuf {
        self.dir.path().join("sources")
    }

    pub fn backup_root(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    pub fn scratch(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    /// Configuration with the workspace's directories
    pub fn config(&self) -> ConvertConfig {
        let mut config = ConvertConfig::new(self.backup_root());
        config.scratch_dir = Some(self.scratch());
        config
    }

    /// Canonical location of `label`'s backup of [`PKG`] for user 0
    pub fn canonical(&self, label: &str) -> PathBuf {
        self.backup_root().join(PKG).join(format!("0_{}", label))
    }

    /// Directories in the package directory, hidden ones included
    pub fn package_dirs(&self) -> Vec<String> {
        let dir = self.backup_root().join(PKG);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().unwrap().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Entries left in the scratch directory
    pub fn scratch_entries(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.scratch()) else {
            return Vec::new();
        };
        entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }
}

/// Crypto settings with cheap KDF costs
pub fn fast_crypto(mode: CryptoMode) -> CryptoConfig {
    let mut crypto = CryptoConfig {
        mode,
        kdf_memory_kib: 64,
        kdf_iterations: 1,
        kdf_parallelism: 1,
        ..CryptoConfig::default()
    };
    match mode {
        CryptoMode::Password => crypto.password = Some(PASSWORD.to_string()),
        CryptoMode::Key => {
            crypto.key_hex =
                Some("00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff".to_string())
        }
        CryptoMode::None => {}
    }
    crypto
}

// =============================================================================
// SOURCE BUILDERS
// =============================================================================

/// Write a deflated zip; names ending in `/` are directories
pub fn write_zip<N: AsRef<str>, D: AsRef<[u8]>>(path: &Path, entries: &[(N, D)]) {
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);
    for (name, data) in entries {
        let name = name.as_ref();
        if name.ends_with('/') {
            zip.add_directory(name, options).unwrap();
        } else {
            zip.start_file(name, options).unwrap();
            zip.write_all(data.as_ref()).unwrap();
        }
    }
    zip.finish().unwrap();
}

/// Build an uncompressed tar in memory
pub fn tar_bytes<N: AsRef<str>, D: AsRef<[u8]>>(entries: &[(N, D)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let (name, data) = (name.as_ref(), data.as_ref());
        let mut header = tar::Header::new_gnu();
        header.set_path(name).unwrap();
        header.set_mtime(1_600_000_000);
        if name.ends_with('/') {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o771);
            header.set_size(0);
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o660);
            header.set_size(data.len() as u64);
        }
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Compress `data` with `format`
pub fn compress(data: &[u8], format: CompressionFormat) -> Vec<u8> {
    let mut encoder = backup_convert::compression::Encoder::new(Vec::new(), format).unwrap();
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Data zip of an OAndBackup or Swift Backup source
pub fn data_zip_entries() -> Vec<(String, Vec<u8>)> {
    vec![
        (format!("{}/", PKG), Vec::new()),
        (format!("{}/a/", PKG), Vec::new()),
        (format!("{}/a/b.txt", PKG), b"hello from b".to_vec()),
        (format!("{}/shared_prefs/prefs.xml", PKG), b"<map />".to_vec()),
    ]
}

/// OAndBackup `<pkg>.log` descriptor
pub fn oab_log(package: &str, backup_mode: i64, encrypted: bool) -> String {
    format!(
        r#"{{
  "label": "Example",
  "packageName": "{package}",
  "versionName": "1.0",
  "versionCode": 10,
  "sourceDir": "/data/app/{package}-1/base.apk",
  "dataDir": "/data/data/{package}",
  "lastBackupMillis": 1600000000000,
  "isSystem": false,
  "isEncrypted": {encrypted},
  "backupMode": {backup_mode}
}}"#
    )
}

/// Write an OAndBackup package directory and return it
///
/// With `crypto` set, the artifacts are encrypted the way the source tool
/// leaves them, using the same credentials.
pub fn oab_source(ws: &Workspace, crypto: Option<&CryptoConfig>) -> PathBuf {
    let dir = ws.sources().join("oandbackups").join(PKG);
    fs::create_dir_all(dir.join("external_files")).unwrap();
    fs::write(dir.join(format!("{}.log", PKG)), oab_log(PKG, 3, crypto.is_some())).unwrap();

    let apk = dir.join("base.apk");
    fs::write(&apk, APK_BYTES).unwrap();
    let internal = dir.join(format!("{}.zip", PKG));
    write_zip(&internal, &data_zip_entries());
    let external = dir.join("external_files").join(format!("{}.zip", PKG));
    write_zip(
        &external,
        &[
            (format!("{}/", PKG), Vec::new()),
            (format!("{}/files/ext.bin", PKG), b"external bytes".to_vec()),
        ],
    );

    if let Some(crypto) = crypto {
        let mut pipeline = CryptoPipeline::open(crypto).unwrap();
        pipeline
            .encrypt(&[apk, internal, external], CryptoMode::Password)
            .unwrap();
        pipeline.close();
    }
    dir
}

/// Titanium Backup tar entries, including one outside both data prefixes
pub fn tb_tar_entries() -> Vec<(String, Vec<u8>)> {
    vec![
        (format!("data/data/{}/", PKG), Vec::new()),
        (format!("data/data/{}/files/", PKG), Vec::new()),
        (format!("data/data/{}/files/a.txt", PKG), b"internal a".to_vec()),
        (format!("data/data/.external.{}/", PKG), Vec::new()),
        (format!("data/data/.external.{}/cache/x.bin", PKG), b"external x".to_vec()),
        ("data/app/stray.txt".to_string(), b"dropped".to_vec()),
    ]
}

/// Write a Titanium Backup triple compressed with `codec`
///
/// Returns the properties file path.
pub fn tb_source(ws: &Workspace, codec: CompressionFormat, codec_name: &str, external: bool) -> PathBuf {
    let dir = ws.sources().join("TitaniumBackup");
    fs::create_dir_all(&dir).unwrap();
    let stem = format!("{}-20210101-120000", PKG);
    // The tool records the digest in upper case and names the apk after it
    let md5 = hash::hash_bytes(HashAlgorithm::Md5, APK_BYTES)
        .value
        .to_ascii_uppercase();

    let props = format!(
        "#Titanium Backup\n\
         app_label=Example\n\
         app_version_code=10\n\
         app_version_name=1.0\n\
         app_apk_md5={}\n\
         app_apk_codec={}\n\
         has_external_data={}\n\
         app_gui_icon=iVBORw0KGgo=\n",
        md5,
        codec_name,
        if external { 1 } else { 0 },
    );
    let prop_file = dir.join(format!("{}.properties", stem));
    fs::write(&prop_file, props).unwrap();

    fs::write(
        dir.join(format!("{}-{}.apk{}", PKG, md5, codec.extension())),
        compress(APK_BYTES, codec),
    )
    .unwrap();
    fs::write(
        dir.join(format!("{}{}", stem, codec.tar_extension())),
        compress(&tar_bytes(&tb_tar_entries()), codec),
    )
    .unwrap();
    prop_file
}

/// Write a Swift Backup set and return the XML descriptor path
pub fn sb_source(ws: &Workspace, with_splits: bool) -> PathBuf {
    let dir = ws.sources().join("SwiftBackup");
    fs::create_dir_all(&dir).unwrap();

    let xml = dir.join(format!("{}.xml", PKG));
    fs::write(
        &xml,
        format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<app>\n  <packageName>{}</packageName>\n</app>\n",
            PKG
        ),
    )
    .unwrap();
    fs::write(dir.join(format!("{}.app", PKG)), APK_BYTES).unwrap();
    if with_splits {
        write_zip(
            &dir.join(format!("{}.splits", PKG)),
            &[
                ("split_config.arm64_v8a.apk", b"arm64 split".as_slice()),
                ("split_config.en.apk", b"en split".as_slice()),
            ],
        );
    }
    write_zip(&dir.join(format!("{}.dat", PKG)), &data_zip_entries());
    write_zip(
        &dir.join(format!("{}.exp", PKG)),
        &[(format!("{}/main.1.obb", PKG), b"obb payload".to_vec())],
    );
    xml
}

// =============================================================================
// DESTINATION READERS
// =============================================================================

/// Names of the files in a backup directory, sorted
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Chunk files `<prefix>.0`, `<prefix>.1`, ... in order
pub fn chunks(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    (0..)
        .map(|n| dir.join(format!("{}.{}", prefix, n)))
        .take_while(|p| p.exists())
        .collect()
}

/// One entry read back from a destination stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry {
    pub path: String,
    pub kind: tar::EntryType,
    pub data: Vec<u8>,
}

/// Concatenate a chunked stream, decompress it and list its entries
pub fn read_stream(dir: &Path, prefix: &str, format: CompressionFormat) -> Vec<TarEntry> {
    let files = chunks(dir, prefix);
    assert!(!files.is_empty(), "no chunks for {} in {}", prefix, dir.display());
    let mut joined = Vec::new();
    for file in files {
        joined.extend(fs::read(file).unwrap());
    }

    let decoder = create_decoder(Cursor::new(joined), format).unwrap();
    let mut archive = tar::Archive::new(decoder);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let kind = entry.header().entry_type();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            TarEntry { path, kind, data }
        })
        .collect()
}

/// Look up the entry at `path`
pub fn entry<'a>(entries: &'a [TarEntry], path: &str) -> &'a TarEntry {
    entries
        .iter()
        .find(|e| e.path == path)
        .unwrap_or_else(|| panic!("no entry {} in {:?}", path, entries))
}

/// Assert that every file-backed entry of the ledger at `ledger` matches
/// the file of that name in `dir`
///
/// Returns the parsed ledger. Entries without a file (certificate digests)
/// are skipped.
pub fn verify_ledger(
    ledger: &Path,
    dir: &Path,
    algorithm: HashAlgorithm,
) -> Vec<backup_convert::ChecksumEntry> {
    let content = fs::read_to_string(ledger).unwrap();
    let entries = ChecksumLedger::parse(&content).unwrap();
    for entry in &entries {
        let path = dir.join(&entry.name);
        if path.exists() {
            let actual = hash::hash_file(algorithm, &path).unwrap();
            assert_eq!(actual.value, entry.digest, "digest of {}", entry.name);
        }
    }
    entries
}

/// Decrypt every `*.ext` file of `dir` into a new directory
pub fn decrypt_backup(dir: &Path, crypto: &CryptoConfig) -> TempDir {
    let out = TempDir::new().unwrap();
    let ext = crypto.mode.extension();
    let encrypted: Vec<PathBuf> = file_names(dir)
        .into_iter()
        .filter(|n| n.ends_with(ext))
        .map(|n| dir.join(n))
        .collect();
    let mut pipeline = CryptoPipeline::open(crypto).unwrap();
    pipeline.decrypt(&encrypted, crypto.mode, out.path()).unwrap();
    pipeline.close();
    out
}
