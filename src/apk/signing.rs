// src/apk/signing.rs

//! Signer certificate digests of an apk
//!
//! v1 (JAR) signatures store a PKCS#7 SignedData block per signer under
//! `META-INF/*.RSA`, `*.DSA` or `*.EC`. The DER encoding of every embedded
//! certificate is digested. Newer signature schemes without a v1 block yield
//! no digests.

use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm, HexDigest};
use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::SignedData;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use x509_cert::der::{Decode, Encode};

fn is_signature_block(name: &str) -> bool {
    let Some(file) = name.strip_prefix("META-INF/") else {
        return false;
    };
    if file.contains('/') {
        return false;
    }
    let upper = file.to_ascii_uppercase();
    upper.ends_with(".RSA") || upper.ends_with(".DSA") || upper.ends_with(".EC")
}

/// Digests of the signer certificates in the apk at `apk`, in block order
pub fn signer_cert_digests(apk: &Path, algorithm: HashAlgorithm) -> Result<Vec<HexDigest>> {
    let mut zip = zip::ZipArchive::new(BufReader::new(File::open(apk)?))?;

    let mut blocks: Vec<String> = zip
        .file_names()
        .filter(|name| is_signature_block(name))
        .map(str::to_string)
        .collect();
    blocks.sort();

    let mut digests: Vec<HexDigest> = Vec::new();
    for name in blocks {
        let mut data = Vec::new();
        zip.by_name(&name)?.read_to_end(&mut data)?;

        for cert_der in certificates_in_block(&data)? {
            let digest = hash::hash_bytes(algorithm, &cert_der);
            if !digests.contains(&digest) {
                digests.push(digest);
            }
        }
    }
    Ok(digests)
}

/// DER encodings of the certificates in one PKCS#7 signature block
fn certificates_in_block(block: &[u8]) -> Result<Vec<Vec<u8>>> {
    let malformed = |e: x509_cert::der::Error| {
        Error::SourceFormat(format!("Malformed signature block: {}", e))
    };

    let content_info = ContentInfo::from_der(block).map_err(malformed)?;
    let signed_data =
        SignedData::from_der(&content_info.content.to_der().map_err(malformed)?).map_err(malformed)?;

    let mut certs = Vec::new();
    if let Some(set) = signed_data.certificates {
        for choice in set.0.iter() {
            if let CertificateChoices::Certificate(cert) = choice {
                certs.push(cert.to_der().map_err(malformed)?);
            }
        }
    }
    Ok(certs)
}
