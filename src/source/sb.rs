// src/source/sb.rs

//! Swift Backup reader
//!
//! ```text
//! <pkg>.xml       descriptor (only checked for well-formedness)
//! <pkg>.app       the apk
//! <pkg>.splits    zip of split apks
//! <pkg>.dat       internal data zip
//! <pkg>.extdat    external data zip
//! <pkg>.exp       obb/media zip
//! ```
//!
//! The descriptor does not identify the app, so the apk is cached and run
//! through a [`PackageArchiveParser`].

use super::{
    ArtifactRole, FormatReader, SourceArtifact, SourceBackup, SourceKind, existing_file, file_name_of,
    modified_time,
};
use crate::apk::{ManifestParser, PackageArchiveParser};
use crate::config::ConvertConfig;
use crate::crypto::CryptoMode;
use crate::error::{Error, Result};
use crate::metadata::{BackupFlags, CANONICAL_APK_NAME, CURRENT_SCHEMA_VERSION, SourceMetadata, data_dir_paths};
use quick_xml::Reader as XmlReader;
use quick_xml::events::Event;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

/// Reader for one Swift Backup descriptor
#[derive(Clone)]
pub struct SbReader {
    xml_file: PathBuf,
    dir: PathBuf,
    package_name: String,
    parser: Arc<dyn PackageArchiveParser>,
}

impl std::fmt::Debug for SbReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SbReader")
            .field("xml_file", &self.xml_file)
            .field("package_name", &self.package_name)
            .finish_non_exhaustive()
    }
}

impl SbReader {
    /// `location` is the descriptor, e.g. `/sdcard/SwiftBackup/org.example.xml`
    pub fn new(location: &Path) -> Result<Self> {
        Self::with_parser(location, Arc::new(ManifestParser))
    }

    /// Use `parser` instead of the built-in manifest parser
    pub fn with_parser(location: &Path, parser: Arc<dyn PackageArchiveParser>) -> Result<Self> {
        let file_name = file_name_of(location)?;
        let package_name = match file_name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => file_name,
        };

        Ok(Self {
            xml_file: location.to_path_buf(),
            dir: location.parent().map(Path::to_path_buf).unwrap_or_default(),
            package_name: package_name.to_string(),
            parser,
        })
    }

    /// Parser used for the cached apk
    pub fn parser(&self) -> &Arc<dyn PackageArchiveParser> {
        &self.parser
    }

    fn sibling(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.package_name, ext))
    }

    /// Unpack `<pkg>.splits` into `cache`, returning the split names
    fn cache_splits(&self, splits: &Path, cache: &Path) -> Result<Vec<String>> {
        let mut zip = zip::ZipArchive::new(BufReader::new(File::open(splits)?))?;
        let mut names = Vec::new();

        for index in 0..zip.len() {
            let mut entry = zip.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry
                .name()
                .rsplit('/')
                .next()
                .filter(|n| !n.is_empty() && *n != "." && *n != "..")
                .ok_or_else(|| {
                    Error::SourceFormat(format!("Invalid split entry {:?} in {}", entry.name(), splits.display()))
                })?
                .to_string();
            if name == CANONICAL_APK_NAME || names.contains(&name) {
                return Err(Error::SourceFormat(format!(
                    "Duplicate split {} in {}",
                    name,
                    splits.display()
                )));
            }

            let mut out = File::create(cache.join(&name))?;
            io::copy(&mut entry, &mut out)?;
            debug!("Cached split {}", name);
            names.push(name);
        }
        Ok(names)
    }
}

/// Check that `content` is one well-formed XML document
fn check_descriptor(content: &str, path: &Path) -> Result<()> {
    let malformed = |reason: String| Error::SourceFormat(format!("Malformed {}: {}", path.display(), reason));

    let mut reader = XmlReader::from_str(content);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut saw_root = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(_)) => {
                if depth == 0 && saw_root {
                    return Err(malformed("multiple root elements".to_string()));
                }
                depth += 1;
                saw_root = true;
            }
            Ok(Event::Empty(_)) => {
                if depth == 0 && saw_root {
                    return Err(malformed("multiple root elements".to_string()));
                }
                saw_root = true;
            }
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(malformed(e.to_string())),
        }
        buf.clear();
    }

    if !saw_root {
        return Err(malformed("no root element".to_string()));
    }
    if depth != 0 {
        return Err(malformed("unclosed element".to_string()));
    }
    Ok(())
}

impl FormatReader for SbReader {
    fn kind(&self) -> SourceKind {
        SourceKind::SwiftBackup
    }

    fn package_name(&self) -> &str {
        &self.package_name
    }

    fn read(&self, config: &ConvertConfig) -> Result<SourceBackup> {
        let content = match fs::read_to_string(&self.xml_file) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::SourceFormat(format!(
                    "Descriptor {} not found",
                    self.xml_file.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        check_descriptor(&content, &self.xml_file)?;

        let app = self.sibling("app");
        let app = existing_file(app.clone()).ok_or(Error::SourceArtifactMissing(app))?;

        let scratch = config.scratch_root();
        fs::create_dir_all(&scratch)?;
        let cache = tempfile::Builder::new()
            .prefix(&format!("{}-", self.package_name))
            .tempdir_in(&scratch)?;
        let cached_apk = cache.path().join(CANONICAL_APK_NAME);
        fs::copy(&app, &cached_apk)?;

        let info = self.parser.parse(&cached_apk)?;
        if info.package_name != self.package_name {
            return Err(Error::PackageIdentityMismatch {
                expected: self.package_name.clone(),
                actual: info.package_name,
            });
        }

        let mut flags = BackupFlags::HAS_APK;
        let mut artifacts = vec![SourceArtifact::new(ArtifactRole::Apk, &cached_apk)];

        let split_configs = match existing_file(self.sibling("splits")) {
            Some(splits) => self.cache_splits(&splits, cache.path())?,
            None => Vec::new(),
        };
        for name in &split_configs {
            artifacts.push(SourceArtifact::new(ArtifactRole::SplitApk, cache.path().join(name)));
        }

        if let Some(dat) = existing_file(self.sibling("dat")) {
            flags.insert(BackupFlags::HAS_INTERNAL_DATA | BackupFlags::HAS_CACHE);
            artifacts.push(SourceArtifact::new(ArtifactRole::InternalData, dat));
        }
        if let Some(extdat) = existing_file(self.sibling("extdat")) {
            flags.insert(BackupFlags::HAS_EXTERNAL_DATA | BackupFlags::HAS_CACHE);
            artifacts.push(SourceArtifact::new(ArtifactRole::ExternalData, extdat));
        }
        if let Some(exp) = existing_file(self.sibling("exp")) {
            flags.insert(BackupFlags::HAS_MEDIA_OBB);
            artifacts.push(SourceArtifact::new(ArtifactRole::MediaObb, exp));
        }

        debug!("{} backup flags: {}", self.package_name, flags);
        info!("Read Swift Backup descriptor for {}", self.package_name);

        let metadata = SourceMetadata {
            label: info.label,
            package_name: self.package_name.clone(),
            version_name: info.version_name,
            version_code: info.version_code,
            is_system: false,
            is_split_apk: !split_configs.is_empty(),
            split_configs,
            has_rules: false,
            backup_time: modified_time(&self.xml_file)?,
            crypto: CryptoMode::None,
            apk_name: CANONICAL_APK_NAME.to_string(),
            flags,
            data_dirs: data_dir_paths(&self.package_name, config.user_id, flags),
            tar_type: config.compression,
            checksum_algo: config.checksum_algorithm,
            key_store: false,
            installer: config.installer.clone(),
            user_handle: config.user_id,
            version: CURRENT_SCHEMA_VERSION,
        };

        Ok(SourceBackup {
            kind: SourceKind::SwiftBackup,
            metadata,
            artifacts,
            icon: None,
            apk_digest: None,
            cache: Some(cache),
        })
    }
}
