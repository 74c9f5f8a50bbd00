//! Certificate fingerprints as used by authorized-services lists.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

const BEGIN_CERT: &str = "-----BEGIN CERTIFICATE-----";
const END_CERT: &str = "-----END CERTIFICATE-----";

#[derive(Debug, Error)]
pub enum CertError {
    #[error("no PEM certificate block found")]
    MissingPemBlock,

    #[error("certificate body is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Decode the first PEM `CERTIFICATE` block in `pem` to DER bytes.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>, CertError> {
    let mut inside = false;
    let mut body = String::new();

    for line in pem.lines().map(str::trim) {
        if line == BEGIN_CERT {
            inside = true;
            body.clear();
        } else if line == END_CERT && inside {
            if body.is_empty() {
                return Err(CertError::MissingPemBlock);
            }
            return Ok(STANDARD.decode(body.as_bytes())?);
        } else if inside {
            body.push_str(line);
        }
    }

    Err(CertError::MissingPemBlock)
}

/// SHA-1 over the DER bytes, upper-case hex, colon between each byte:
/// `A9:99:3E:...`.
pub fn sha1_fingerprint(der: &[u8]) -> String {
    let encoded = hex::encode_upper(Sha1::digest(der));
    encoded
        .as_bytes()
        .chunks(2)
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(":")
}

/// Fingerprint of the certificate in a PEM block.
pub fn pem_fingerprint(pem: &str) -> Result<String, CertError> {
    pem_to_der(pem).map(|der| sha1_fingerprint(&der))
}
