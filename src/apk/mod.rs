// src/apk/mod.rs

//! Android package inspection
//!
//! Swift Backup descriptors do not carry the app identity, so it is
//! recovered from the cached apk. The [`PackageArchiveParser`] trait lets an
//! embedding application substitute the platform's own package parser; the
//! default [`ManifestParser`] reads the compiled manifest directly.

pub mod manifest;
pub mod signing;

use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

pub use manifest::{ManifestInfo, parse_manifest};
pub use signing::signer_cert_digests;

/// Identity recovered from an apk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApkInfo {
    pub package_name: String,
    pub label: String,
    pub version_name: String,
    pub version_code: i64,
}

/// Parser for package archives
pub trait PackageArchiveParser: Send + Sync {
    /// Read the identity of the apk at `apk`
    fn parse(&self, apk: &Path) -> Result<ApkInfo>;

    /// Write the launcher icon of `apk` to `dest`
    ///
    /// Returns `false` when the apk has no usable icon.
    fn extract_icon(&self, apk: &Path, dest: &Path) -> Result<bool>;
}

/// Default parser reading `AndroidManifest.xml` from the apk
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestParser;

impl PackageArchiveParser for ManifestParser {
    fn parse(&self, apk: &Path) -> Result<ApkInfo> {
        let mut zip = zip::ZipArchive::new(BufReader::new(File::open(apk)?))?;
        let mut data = Vec::new();
        zip.by_name("AndroidManifest.xml")
            .map_err(|_| {
                Error::SourceFormat(format!("{} has no AndroidManifest.xml", apk.display()))
            })?
            .read_to_end(&mut data)?;

        let info = parse_manifest(&data)?;
        debug!("Parsed manifest of {}: {:?}", apk.display(), info);
        Ok(ApkInfo {
            label: info.label.unwrap_or_else(|| info.package.clone()),
            package_name: info.package,
            version_name: info.version_name.unwrap_or_default(),
            version_code: info.version_code,
        })
    }

    fn extract_icon(&self, apk: &Path, dest: &Path) -> Result<bool> {
        let mut zip = zip::ZipArchive::new(BufReader::new(File::open(apk)?))?;
        let best = zip
            .file_names()
            .filter_map(|name| icon_rank(name).map(|rank| (rank, name.to_string())))
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)));

        let Some((_, name)) = best else {
            return Ok(false);
        };

        let mut data = Vec::new();
        zip.by_name(&name)?.read_to_end(&mut data)?;
        fs::write(dest, data)?;
        debug!("Extracted icon {} from {}", name, apk.display());
        Ok(true)
    }
}

/// Rank of a launcher icon candidate, higher is better
///
/// Density dominates; mipmap beats drawable at equal density.
fn icon_rank(name: &str) -> Option<(u32, u32)> {
    let rest = name.strip_prefix("res/")?;
    let (dir, file) = rest.split_once('/')?;
    if file != "ic_launcher.png" {
        return None;
    }
    let kind = if dir.starts_with("mipmap") {
        1
    } else if dir.starts_with("drawable") {
        0
    } else {
        return None;
    };

    let density = dir
        .split('-')
        .find_map(|qualifier| match qualifier {
            "ldpi" => Some(120),
            "mdpi" => Some(160),
            "hdpi" => Some(240),
            "xhdpi" => Some(320),
            "xxhdpi" => Some(480),
            "xxxhdpi" => Some(640),
            _ => None,
        })
        .unwrap_or(160);

    Some((density, kind))
}
