// src/apk/manifest.rs

//! Binary AndroidManifest.xml reader
//!
//! Compiled manifests are stored in Android's binary XML format: a sequence
//! of chunks, each starting with `type: u16, header_size: u16, size: u32`
//! (little-endian). Only the chunks needed to recover the package identity
//! are interpreted:
//!
//! - `0x0001` string pool
//! - `0x0180` resource id map (attribute name index -> framework id)
//! - `0x0102` start element with its attributes

use crate::error::{Error, Result};

const CHUNK_XML: u16 = 0x0003;
const CHUNK_STRING_POOL: u16 = 0x0001;
const CHUNK_RESOURCE_MAP: u16 = 0x0180;
const CHUNK_START_ELEMENT: u16 = 0x0102;

const UTF8_FLAG: u32 = 1 << 8;
const NO_INDEX: u32 = 0xffff_ffff;

const ATTR_LABEL: u32 = 0x0101_0001;
const ATTR_VERSION_CODE: u32 = 0x0101_021b;
const ATTR_VERSION_NAME: u32 = 0x0101_021c;

const TYPE_REFERENCE: u8 = 0x01;
const TYPE_STRING: u8 = 0x03;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;

/// Identity fields of a compiled manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestInfo {
    pub package: String,
    pub version_code: i64,
    pub version_name: Option<String>,
    /// Application label when stored inline; resource references are not
    /// resolved
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrValue {
    Str(String),
    Int(i64),
    Reference,
    Other,
}

fn truncated() -> Error {
    Error::SourceFormat("Truncated binary AndroidManifest.xml".to_string())
}

fn u16_at(data: &[u8], off: usize) -> Result<u16> {
    data.get(off..off + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(truncated)
}

fn u32_at(data: &[u8], off: usize) -> Result<u32> {
    data.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(truncated)
}

fn u8_at(data: &[u8], off: usize) -> Result<u8> {
    data.get(off).copied().ok_or_else(truncated)
}

/// Parse a compiled manifest
pub fn parse_manifest(data: &[u8]) -> Result<ManifestInfo> {
    if u16_at(data, 0)? != CHUNK_XML {
        return Err(Error::SourceFormat(
            "AndroidManifest.xml is not binary XML".to_string(),
        ));
    }

    let mut strings: Vec<String> = Vec::new();
    let mut resource_ids: Vec<u32> = Vec::new();
    let mut info = ManifestInfo::default();
    let mut seen_manifest = false;

    let mut off = u16_at(data, 2)? as usize;
    while off + 8 <= data.len() {
        let chunk_type = u16_at(data, off)?;
        let header_size = u16_at(data, off + 2)? as usize;
        let size = u32_at(data, off + 4)? as usize;
        if size < 8 || off + size > data.len() {
            return Err(truncated());
        }
        let chunk = &data[off..off + size];

        match chunk_type {
            CHUNK_STRING_POOL => strings = parse_string_pool(chunk)?,
            CHUNK_RESOURCE_MAP => {
                resource_ids = (header_size..size)
                    .step_by(4)
                    .map(|at| u32_at(chunk, at))
                    .collect::<Result<_>>()?;
            }
            CHUNK_START_ELEMENT => {
                let name = string_at(&strings, u32_at(chunk, header_size + 4)?);
                let attrs = parse_attributes(chunk, header_size, &strings, &resource_ids)?;
                match name.as_deref() {
                    Some("manifest") => {
                        seen_manifest = true;
                        for (attr, value) in attrs {
                            match (attr, value) {
                                (AttrName::Package, AttrValue::Str(s)) => info.package = s,
                                (AttrName::VersionCode, AttrValue::Int(v)) => info.version_code = v,
                                (AttrName::VersionCode, AttrValue::Str(s)) => {
                                    info.version_code = s.parse().unwrap_or(0)
                                }
                                (AttrName::VersionName, AttrValue::Str(s)) => {
                                    info.version_name = Some(s)
                                }
                                _ => {}
                            }
                        }
                    }
                    Some("application") => {
                        for (attr, value) in attrs {
                            if let (AttrName::Label, AttrValue::Str(s)) = (attr, value) {
                                info.label = Some(s);
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }

        off += size;
    }

    if !seen_manifest || info.package.is_empty() {
        return Err(Error::SourceFormat(
            "AndroidManifest.xml has no package attribute".to_string(),
        ));
    }
    Ok(info)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrName {
    Package,
    VersionCode,
    VersionName,
    Label,
    Other,
}

fn parse_attributes(
    chunk: &[u8],
    header_size: usize,
    strings: &[String],
    resource_ids: &[u32],
) -> Result<Vec<(AttrName, AttrValue)>> {
    let ext = header_size;
    let attr_start = u16_at(chunk, ext + 8)? as usize;
    let attr_size = u16_at(chunk, ext + 10)? as usize;
    let attr_count = u16_at(chunk, ext + 12)? as usize;
    if attr_size < 20 {
        return Err(truncated());
    }

    let mut attrs = Vec::with_capacity(attr_count);
    for i in 0..attr_count {
        let at = ext + attr_start + i * attr_size;
        let name_index = u32_at(chunk, at + 4)?;
        let raw_value = u32_at(chunk, at + 8)?;
        let data_type = u8_at(chunk, at + 15)?;
        let data = u32_at(chunk, at + 16)?;

        let resource_id = resource_ids.get(name_index as usize).copied();
        let name = match (resource_id, string_at(strings, name_index).as_deref()) {
            (Some(ATTR_VERSION_CODE), _) | (_, Some("versionCode")) => AttrName::VersionCode,
            (Some(ATTR_VERSION_NAME), _) | (_, Some("versionName")) => AttrName::VersionName,
            (Some(ATTR_LABEL), _) | (_, Some("label")) => AttrName::Label,
            (None, Some("package")) => AttrName::Package,
            _ => AttrName::Other,
        };

        let value = if raw_value != NO_INDEX {
            string_at(strings, raw_value).map_or(AttrValue::Other, AttrValue::Str)
        } else {
            match data_type {
                TYPE_STRING => string_at(strings, data).map_or(AttrValue::Other, AttrValue::Str),
                TYPE_INT_DEC | TYPE_INT_HEX => AttrValue::Int(i64::from(data)),
                TYPE_REFERENCE => AttrValue::Reference,
                _ => AttrValue::Other,
            }
        };
        attrs.push((name, value));
    }
    Ok(attrs)
}

fn string_at(strings: &[String], index: u32) -> Option<String> {
    if index == NO_INDEX {
        return None;
    }
    strings.get(index as usize).cloned()
}

fn parse_string_pool(chunk: &[u8]) -> Result<Vec<String>> {
    let header_size = u16_at(chunk, 2)? as usize;
    let count = u32_at(chunk, 8)? as usize;
    let flags = u32_at(chunk, 16)?;
    let strings_start = u32_at(chunk, 20)? as usize;
    let utf8 = flags & UTF8_FLAG != 0;

    if header_size + count * 4 > chunk.len() {
        return Err(truncated());
    }

    (0..count)
        .map(|i| {
            let pos = strings_start + u32_at(chunk, header_size + i * 4)? as usize;
            if utf8 {
                decode_utf8(chunk, pos)
            } else {
                decode_utf16(chunk, pos)
            }
        })
        .collect()
}

fn decode_utf16(chunk: &[u8], mut pos: usize) -> Result<String> {
    let mut len = u16_at(chunk, pos)? as usize;
    pos += 2;
    if len & 0x8000 != 0 {
        len = ((len & 0x7fff) << 16) | u16_at(chunk, pos)? as usize;
        pos += 2;
    }
    let units = (0..len)
        .map(|i| u16_at(chunk, pos + i * 2))
        .collect::<Result<Vec<u16>>>()?;
    Ok(String::from_utf16_lossy(&units))
}

fn decode_utf8(chunk: &[u8], mut pos: usize) -> Result<String> {
    // UTF-16 length first, unused
    if u8_at(chunk, pos)? & 0x80 != 0 {
        pos += 2;
    } else {
        pos += 1;
    }
    let first = u8_at(chunk, pos)? as usize;
    let len = if first & 0x80 != 0 {
        let len = ((first & 0x7f) << 8) | u8_at(chunk, pos + 1)? as usize;
        pos += 2;
        len
    } else {
        pos += 1;
        first
    };
    let bytes = chunk.get(pos..pos + len).ok_or_else(truncated)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn le16(out: &mut Vec<u8>, v: u16) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    fn le32(out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    fn string_pool(strings: &[&str]) -> Vec<u8> {
        let mut offsets = Vec::new();
        let mut data = Vec::new();
        for s in strings {
            offsets.push(data.len() as u32);
            let units: Vec<u16> = s.encode_utf16().collect();
            le16(&mut data, units.len() as u16);
            for u in units {
                le16(&mut data, u);
            }
            le16(&mut data, 0);
        }
        while data.len() % 4 != 0 {
            data.push(0);
        }

        let strings_start = 28 + 4 * strings.len() as u32;
        let mut out = Vec::new();
        le16(&mut out, CHUNK_STRING_POOL);
        le16(&mut out, 28);
        le32(&mut out, strings_start + data.len() as u32);
        le32(&mut out, strings.len() as u32);
        le32(&mut out, 0);
        le32(&mut out, 0);
        le32(&mut out, strings_start);
        le32(&mut out, 0);
        for o in offsets {
            le32(&mut out, o);
        }
        out.extend(data);
        out
    }

    fn resource_map(ids: &[u32]) -> Vec<u8> {
        let mut out = Vec::new();
        le16(&mut out, CHUNK_RESOURCE_MAP);
        le16(&mut out, 8);
        le32(&mut out, 8 + 4 * ids.len() as u32);
        for id in ids {
            le32(&mut out, *id);
        }
        out
    }

    /// Attribute as (name index, raw value index, data type, data)
    fn start_element(name: u32, attrs: &[(u32, u32, u8, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        le16(&mut out, CHUNK_START_ELEMENT);
        le16(&mut out, 16);
        le32(&mut out, 16 + 20 + 20 * attrs.len() as u32);
        le32(&mut out, 1);
        le32(&mut out, NO_INDEX);
        le32(&mut out, NO_INDEX);
        le32(&mut out, name);
        le16(&mut out, 20);
        le16(&mut out, 20);
        le16(&mut out, attrs.len() as u16);
        le16(&mut out, 0);
        le16(&mut out, 0);
        le16(&mut out, 0);
        for (attr_name, raw, data_type, data) in attrs {
            le32(&mut out, NO_INDEX);
            le32(&mut out, *attr_name);
            le32(&mut out, *raw);
            le16(&mut out, 8);
            out.push(0);
            out.push(*data_type);
            le32(&mut out, *data);
        }
        out
    }

    /// Compiled manifest for `package` with an optional inline label
    pub(crate) fn build_manifest(package: &str, version_code: u32, version_name: &str, label: Option<&str>) -> Vec<u8> {
        let strings = [
            "versionCode",
            "versionName",
            "label",
            "package",
            "manifest",
            "application",
            package,
            version_name,
            label.unwrap_or(""),
        ];
        let mut body = Vec::new();
        body.extend(string_pool(&strings));
        body.extend(resource_map(&[ATTR_VERSION_CODE, ATTR_VERSION_NAME, ATTR_LABEL]));
        body.extend(start_element(
            4,
            &[
                (0, NO_INDEX, TYPE_INT_DEC, version_code),
                (1, 7, TYPE_STRING, 7),
                (3, 6, TYPE_STRING, 6),
            ],
        ));
        let label_attr = match label {
            Some(_) => (2, 8, TYPE_STRING, 8),
            None => (2, NO_INDEX, TYPE_REFERENCE, 0x7f0b_0001),
        };
        body.extend(start_element(5, &[label_attr]));

        let mut out = Vec::new();
        le16(&mut out, CHUNK_XML);
        le16(&mut out, 8);
        le32(&mut out, 8 + body.len() as u32);
        out.extend(body);
        out
    }

    #[test]
    fn test_parse_manifest_inline_label() {
        let data = build_manifest("org.example.app", 42, "1.4.2", Some("Example App"));
        let info = parse_manifest(&data).unwrap();
        assert_eq!(
            info,
            ManifestInfo {
                package: "org.example.app".to_string(),
                version_code: 42,
                version_name: Some("1.4.2".to_string()),
                label: Some("Example App".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_manifest_reference_label() {
        let data = build_manifest("org.example.app", 7, "2.0", None);
        let info = parse_manifest(&data).unwrap();
        assert_eq!(info.label, None);
        assert_eq!(info.version_code, 7);
    }

    #[test]
    fn test_text_manifest_rejected() {
        assert!(parse_manifest(b"<?xml version=\"1.0\"?><manifest/>").is_err());
    }

    #[test]
    fn test_truncated_manifest_rejected() {
        let data = build_manifest("org.example.app", 1, "1", Some("x"));
        assert!(parse_manifest(&data[..data.len() - 10]).is_err());
    }
}
