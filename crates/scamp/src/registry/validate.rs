//! Record validation applied during refresh.

use std::collections::HashMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

use super::proxy::ServiceProxy;
use crate::cert::{self, CertError};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Certificate(#[from] CertError),

    #[error("certificate {fingerprint} is not authorized for sector `{sector}`")]
    Unauthorized { fingerprint: String, sector: String },

    #[error("record signature is empty or not base64")]
    MalformedSignature,

    #[error("record rejected: {0}")]
    Rejected(String),
}

/// Decides whether a parsed record may be indexed.
pub trait RecordValidator: Send + Sync {
    fn validate(&self, proxy: &ServiceProxy) -> Result<(), ValidationError>;
}

/// Accepts every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl RecordValidator for AcceptAll {
    fn validate(&self, _proxy: &ServiceProxy) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Allowlist of certificate fingerprints and the sectors each may announce in.
///
/// File format, one grant per line, `#` starts a comment:
///
/// ```text
/// 6B:0F:...:9C  accounts, billing
/// A9:99:...:9D  *
/// ```
#[derive(Debug, Default, Clone)]
pub struct AuthorizedServices {
    grants: HashMap<String, Vec<String>>,
}

impl AuthorizedServices {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut grants: HashMap<String, Vec<String>> = HashMap::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            let Some((fingerprint, sectors)) = line.split_once(char::is_whitespace) else {
                if !line.is_empty() {
                    tracing::warn!(line = %line, "Skipping authorized_services line without sectors");
                }
                continue;
            };
            grants
                .entry(fingerprint.to_ascii_uppercase())
                .or_default()
                .extend(
                    sectors
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                );
        }
        Self { grants }
    }

    pub fn is_authorized(&self, fingerprint: &str, sector: &str) -> bool {
        self.grants
            .get(fingerprint)
            .is_some_and(|sectors| sectors.iter().any(|s| s == "*" || s == sector))
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

impl RecordValidator for AuthorizedServices {
    /// Checks the certificate is authorized for the record's sector and the
    /// signature block is well-formed. The RSA signature itself is not
    /// verified here.
    fn validate(&self, proxy: &ServiceProxy) -> Result<(), ValidationError> {
        let fingerprint = cert::pem_fingerprint(&proxy.certificate)?;
        if !self.is_authorized(&fingerprint, &proxy.sector) {
            return Err(ValidationError::Unauthorized {
                fingerprint,
                sector: proxy.sector.clone(),
            });
        }

        let signature: String = proxy.signature.split_whitespace().collect();
        if signature.is_empty() || STANDARD.decode(signature.as_bytes()).is_err() {
            return Err(ValidationError::MalformedSignature);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::feed::FeedRecord;

    const ABC_FINGERPRINT: &str = "A9:99:3E:36:47:06:81:6A:BA:3E:25:71:78:50:C2:6C:9C:D0:D8:9D";

    fn proxy(sector: &str, certificate: &str, signature: &str) -> ServiceProxy {
        let line = serde_json::json!([3, "id", sector, 1, 1000, "tcp://x", ["json"], [], 0.0]);
        ServiceProxy::from_feed_record(FeedRecord {
            class_records: line.to_string(),
            certificate: certificate.to_string(),
            signature: signature.to_string(),
        })
        .unwrap()
    }

    fn abc_cert() -> &'static str {
        "-----BEGIN CERTIFICATE-----\nYWJj\n-----END CERTIFICATE-----"
    }

    #[test]
    fn test_parse_grants() {
        let text = format!(
            "# authorized services\n{} accounts, billing\n\nff:00 *  # anything\nbogus\n",
            ABC_FINGERPRINT.to_lowercase()
        );
        let auth = AuthorizedServices::parse(&text);
        assert_eq!(auth.len(), 2);
        assert!(auth.is_authorized(ABC_FINGERPRINT, "accounts"));
        assert!(auth.is_authorized(ABC_FINGERPRINT, "billing"));
        assert!(!auth.is_authorized(ABC_FINGERPRINT, "main"));
        assert!(auth.is_authorized("FF:00", "main"));
    }

    #[test]
    fn test_validate_authorized_record() {
        let auth = AuthorizedServices::parse(&format!("{ABC_FINGERPRINT} accounts"));
        assert!(auth.validate(&proxy("accounts", abc_cert(), "c2ln\nbmF0dXJl")).is_ok());
    }

    #[test]
    fn test_validate_rejects_wrong_sector() {
        let auth = AuthorizedServices::parse(&format!("{ABC_FINGERPRINT} accounts"));
        let err = auth.validate(&proxy("billing", abc_cert(), "c2ln")).unwrap_err();
        assert!(matches!(err, ValidationError::Unauthorized { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_cert_and_signature() {
        let auth = AuthorizedServices::parse(&format!("{ABC_FINGERPRINT} *"));
        assert!(matches!(
            auth.validate(&proxy("main", "not a cert", "c2ln")),
            Err(ValidationError::Certificate(_))
        ));
        assert!(matches!(
            auth.validate(&proxy("main", abc_cert(), "%%not base64%%")),
            Err(ValidationError::MalformedSignature)
        ));
    }
}
