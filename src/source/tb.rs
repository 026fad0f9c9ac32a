// src/source/tb.rs

//! Titanium Backup reader
//!
//! Every backup is a set of siblings sharing the descriptor's stem:
//!
//! ```text
//! <pkg>-YYYYMMDD-HHMMSS.properties       key=value descriptor
//! <pkg>-YYYYMMDD-HHMMSS.tar.{gz,bz2}     internal and external data
//! <pkg>-<md5>.apk.{gz,bz2}               the compressed apk
//! ```
//!
//! Titanium backups are never read as encrypted.

use super::{
    ArtifactRole, FormatReader, Properties, SourceArtifact, SourceBackup, SourceKind, existing_file,
    file_name_of, modified_time,
};
use crate::compression::CompressionFormat;
use crate::config::ConvertConfig;
use crate::crypto::CryptoMode;
use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, HexDigest};
use crate::metadata::{BackupFlags, CURRENT_SCHEMA_VERSION, SourceMetadata, data_dir_paths};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const PROPERTIES_EXT: &str = ".properties";

/// Reader for one Titanium Backup properties file
#[derive(Debug, Clone)]
pub struct TbReader {
    prop_file: PathBuf,
    dir: PathBuf,
    /// File name without `.properties`
    stem: String,
    package_name: String,
}

impl TbReader {
    /// `location` is the descriptor, e.g. `/sdcard/TitaniumBackup/org.example-20210101-120000.properties`
    pub fn new(location: &Path) -> Result<Self> {
        let file_name = file_name_of(location)?;
        let stem = file_name.strip_suffix(PROPERTIES_EXT).unwrap_or(file_name);
        let (package_name, _) = stem.split_once('-').ok_or_else(|| {
            Error::SourceFormat(format!("Could not read package name from {}", file_name))
        })?;
        if package_name.is_empty() {
            return Err(Error::SourceFormat(format!(
                "Could not read package name from {}",
                file_name
            )));
        }

        Ok(Self {
            prop_file: location.to_path_buf(),
            dir: location.parent().map(Path::to_path_buf).unwrap_or_default(),
            stem: stem.to_string(),
            package_name: package_name.to_string(),
        })
    }

    /// Backup time encoded in the file name, if present
    fn time_from_name(&self) -> Option<DateTime<Utc>> {
        let stamp = self.stem.strip_prefix(&self.package_name)?.strip_prefix('-')?;
        NaiveDateTime::parse_from_str(stamp, "%Y%m%d-%H%M%S")
            .ok()
            .map(|dt| dt.and_utc())
    }

    fn codec(props: &Properties) -> Result<CompressionFormat> {
        match props.get("app_apk_codec") {
            Some("GZIP") => Ok(CompressionFormat::Gzip),
            Some("BZIP2") => Ok(CompressionFormat::Bzip2),
            Some(other) => Err(Error::UnsupportedCodec(other.to_string())),
            None => Err(Error::UnsupportedCodec("(unset)".to_string())),
        }
    }

    /// Compressed apk file name for `apk_name`
    fn compressed(name: &str, codec: CompressionFormat) -> String {
        format!("{}{}", name, codec.extension())
    }

    fn data_file(&self, codec: CompressionFormat) -> PathBuf {
        self.dir.join(format!("{}{}", self.stem, codec.tar_extension()))
    }
}

/// Reject a file whose magic bytes name a different codec than declared
///
/// Unrecognized leading bytes are left for the decoder to report.
fn check_codec(path: &Path, declared: CompressionFormat) -> Result<()> {
    let mut magic = [0u8; 4];
    let n = fs::File::open(path)?.read(&mut magic)?;
    let detected = CompressionFormat::from_magic_bytes(&magic[..n]);
    if detected != CompressionFormat::None && detected != declared {
        return Err(Error::SourceFormat(format!(
            "{} is declared {} but contains {} data",
            path.display(),
            declared,
            detected
        )));
    }
    Ok(())
}

/// Decode the inline base64 icon; a broken icon is dropped, not fatal
fn decode_icon(encoded: &str) -> Option<Vec<u8>> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    match STANDARD.decode(compact.as_bytes()) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Ignoring undecodable app_gui_icon: {}", e);
            None
        }
    }
}

impl FormatReader for TbReader {
    fn kind(&self) -> SourceKind {
        SourceKind::TitaniumBackup
    }

    fn package_name(&self) -> &str {
        &self.package_name
    }

    fn read(&self, config: &ConvertConfig) -> Result<SourceBackup> {
        let content = match fs::read_to_string(&self.prop_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SourceFormat(format!(
                    "Descriptor {} not found",
                    self.prop_file.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let props = Properties::parse(&content);

        let version_code = props
            .get("app_version_code")
            .ok_or_else(|| Error::SourceFormat("app_version_code is missing".to_string()))?
            .trim()
            .parse::<i64>()
            .map_err(|e| Error::SourceFormat(format!("Invalid app_version_code: {}", e)))?;
        let md5 = props
            .get("app_apk_md5")
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| Error::SourceFormat("app_apk_md5 is missing".to_string()))?;
        let codec = Self::codec(&props)?;
        let apk_name = format!("{}-{}.apk", self.package_name, md5);

        let backup_time = match self.time_from_name() {
            Some(time) => time,
            None => {
                debug!("No timestamp in {}, using its mtime", self.stem);
                modified_time(&self.prop_file)?
            }
        };

        let mut flags = BackupFlags::MULTIPLE;
        let mut artifacts = Vec::new();

        if let Some(data) = existing_file(self.data_file(codec)) {
            check_codec(&data, codec)?;
            flags.insert(BackupFlags::HAS_INTERNAL_DATA);
            if props.is_set("has_external_data") {
                flags.insert(BackupFlags::HAS_EXTERNAL_DATA);
            }
            flags.insert(BackupFlags::HAS_CACHE);
            artifacts.push(SourceArtifact::new(ArtifactRole::CombinedData, data));
        }
        if let Some(apk) = existing_file(self.dir.join(Self::compressed(&apk_name, codec))) {
            check_codec(&apk, codec)?;
            flags.insert(BackupFlags::HAS_APK);
            artifacts.push(SourceArtifact::new(ArtifactRole::Apk, apk));
        }

        debug!("{} backup flags: {}", self.package_name, flags);
        info!("Read Titanium Backup descriptor {}", self.stem);

        let metadata = SourceMetadata {
            label: props
                .get("app_label")
                .filter(|l| !l.is_empty())
                .unwrap_or(&self.package_name)
                .to_string(),
            package_name: self.package_name.clone(),
            version_name: props.get("app_version_name").unwrap_or_default().to_string(),
            version_code,
            is_system: props.is_set("app_is_system"),
            is_split_apk: false,
            split_configs: Vec::new(),
            has_rules: false,
            backup_time,
            crypto: CryptoMode::None,
            apk_name,
            flags,
            data_dirs: data_dir_paths(&self.package_name, config.user_id, flags),
            tar_type: codec,
            checksum_algo: config.checksum_algorithm,
            key_store: false,
            installer: config.installer.clone(),
            user_handle: config.user_id,
            version: CURRENT_SCHEMA_VERSION,
        };

        Ok(SourceBackup {
            kind: SourceKind::TitaniumBackup,
            metadata,
            artifacts,
            icon: props.get("app_gui_icon").and_then(decode_icon),
            apk_digest: Some(HexDigest {
                algorithm: HashAlgorithm::Md5,
                value: md5.to_ascii_lowercase(),
            }),
            cache: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use tempfile::TempDir;

    const PKG: &str = "org.example.app";
    const STEM: &str = "org.example.app-20210102-030405";

    fn write_props(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join(format!("{}{}", STEM, PROPERTIES_EXT));
        fs::write(&path, body).unwrap();
        path
    }

    fn props(codec: &str, external: bool) -> String {
        format!(
            "app_label=Example\napp_version_name=2.0\napp_version_code=20\napp_is_system=0\n\
             app_apk_md5=ABCDEF\napp_apk_codec={}\nhas_external_data={}\napp_gui_icon=aGVs\\\n  bG8=\n",
            codec,
            if external { 1 } else { 0 }
        )
    }

    #[test]
    fn test_package_name_requires_dash() {
        let err = TbReader::new(Path::new("/tb/orgexample.properties")).unwrap_err();
        assert!(matches!(err, Error::SourceFormat(_)));
        let reader = TbReader::new(Path::new("/tb/org.example-20210102-030405.properties")).unwrap();
        assert_eq!(reader.package_name(), "org.example");
    }

    #[test]
    fn test_read_bzip2_backup() {
        let dir = TempDir::new().unwrap();
        let prop_file = write_props(dir.path(), &props("BZIP2", true));
        fs::write(dir.path().join(format!("{}.tar.bz2", STEM)), b"data").unwrap();
        fs::write(dir.path().join(format!("{}-ABCDEF.apk.bz2", PKG)), b"apk").unwrap();

        let backup = TbReader::new(&prop_file).unwrap().read(&ConvertConfig::default()).unwrap();
        let meta = &backup.metadata;
        assert_eq!(meta.package_name, PKG);
        assert_eq!(meta.label, "Example");
        assert_eq!(meta.version_code, 20);
        assert!(!meta.is_system);
        assert_eq!(meta.tar_type, CompressionFormat::Bzip2);
        assert_eq!(meta.crypto, CryptoMode::None);
        assert_eq!(meta.apk_name, format!("{}-ABCDEF.apk", PKG));
        assert!(meta.flags.contains(
            BackupFlags::HAS_APK
                | BackupFlags::HAS_INTERNAL_DATA
                | BackupFlags::HAS_EXTERNAL_DATA
                | BackupFlags::HAS_CACHE
        ));
        assert_eq!(meta.data_dirs.len(), 2);
        assert_eq!(meta.backup_time.year(), 2021);
        assert_eq!(meta.backup_time.hour(), 3);
        assert_eq!(backup.icon.as_deref(), Some(&b"hello"[..]));
        assert_eq!(backup.apk_digest.as_ref().map(|d| d.as_str()), Some("abcdef"));
        assert!(backup.artifact(ArtifactRole::CombinedData).is_some());
    }

    #[test]
    fn test_flags_follow_files() {
        let dir = TempDir::new().unwrap();
        let prop_file = write_props(dir.path(), &props("GZIP", true));

        let backup = TbReader::new(&prop_file).unwrap().read(&ConvertConfig::default()).unwrap();
        assert_eq!(backup.metadata.flags, BackupFlags::MULTIPLE);
        assert!(backup.artifacts.is_empty());
        assert!(backup.metadata.data_dirs.is_empty());
    }

    #[test]
    fn test_unsupported_codec() {
        let dir = TempDir::new().unwrap();
        let prop_file = write_props(dir.path(), &props("LZMA", false));
        let err = TbReader::new(&prop_file).unwrap().read(&ConvertConfig::default()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCodec(ref c) if c == "LZMA"));
    }

    #[test]
    fn test_codec_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let prop_file = write_props(dir.path(), &props("BZIP2", false));
        // Gzip magic under a name and descriptor that both say bzip2
        fs::write(dir.path().join(format!("{}.tar.bz2", STEM)), [0x1f, 0x8b, 0x08, 0x00]).unwrap();

        let err = TbReader::new(&prop_file).unwrap().read(&ConvertConfig::default()).unwrap_err();
        assert!(matches!(err, Error::SourceFormat(ref msg) if msg.contains("gzip")));
    }

    #[test]
    fn test_codec_check_accepts_declared_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.apk.bz2");
        fs::write(&path, b"BZh91AY&SY").unwrap();
        check_codec(&path, CompressionFormat::Bzip2).unwrap();
        assert!(check_codec(&path, CompressionFormat::Gzip).is_err());

        // Too short to identify
        fs::write(&path, b"B").unwrap();
        check_codec(&path, CompressionFormat::Gzip).unwrap();
    }

    #[test]
    fn test_invalid_version_code() {
        let dir = TempDir::new().unwrap();
        let prop_file = write_props(dir.path(), &props("GZIP", false).replace("=20", "=twenty"));
        let err = TbReader::new(&prop_file).unwrap().read(&ConvertConfig::default()).unwrap_err();
        assert!(matches!(err, Error::SourceFormat(_)));
    }

    #[test]
    fn test_bad_icon_is_dropped() {
        assert_eq!(decode_icon("!!not base64!!"), None);
        assert_eq!(decode_icon(""), None);
        assert_eq!(decode_icon("aGVs bG8="), Some(b"hello".to_vec()));
    }
}
