//! Authentication tickets presented by callers.
//!
//! Wire form: `version,user_id,client_id,validity_start,ttl[,cap+cap+...],signature`.
//! The signature covers everything before the last comma. Checking it needs
//! the issuer's RSA key and is left to the embedding service; this module
//! only splits and parses.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

const SUPPORTED_VERSION: &str = "1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TicketError {
    #[error("ticket has no signature separator")]
    MissingSignature,

    #[error("ticket must be version 1")]
    UnsupportedVersion,

    #[error("ticket is missing field `{0}`")]
    MissingField(&'static str),

    #[error("ticket field `{field}` is not a number: `{value}`")]
    InvalidField { field: &'static str, value: String },

    #[error("ticket is not valid UTF-8")]
    NotUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub version: i64,
    pub user_id: i64,
    pub client_id: i64,
    pub validity_start: i64,
    pub validity_end: i64,
    pub ttl: i64,
    pub capabilities: Vec<u32>,
}

/// Split a raw ticket into the signed payload and the signature.
pub fn split_payload(incoming: &[u8]) -> Option<(&[u8], &[u8])> {
    let idx = incoming.iter().rposition(|b| *b == b',')?;
    Some((&incoming[..idx], &incoming[idx + 1..]))
}

fn parse_field(fields: &[&str], idx: usize, name: &'static str) -> Result<i64, TicketError> {
    let raw = fields.get(idx).ok_or(TicketError::MissingField(name))?;
    raw.parse().map_err(|_| TicketError::InvalidField {
        field: name,
        value: (*raw).to_string(),
    })
}

impl Ticket {
    /// Parse a ticket without checking its signature.
    pub fn parse_unverified(incoming: &[u8]) -> Result<Self, TicketError> {
        let (payload, _signature) = split_payload(incoming).ok_or(TicketError::MissingSignature)?;
        let payload = std::str::from_utf8(payload).map_err(|_| TicketError::NotUtf8)?;
        let fields: Vec<&str> = payload.split(',').collect();

        if fields.first() != Some(&SUPPORTED_VERSION) {
            return Err(TicketError::UnsupportedVersion);
        }

        let version = parse_field(&fields, 0, "version")?;
        let user_id = parse_field(&fields, 1, "user_id")?;
        let client_id = parse_field(&fields, 2, "client_id")?;
        let validity_start = parse_field(&fields, 3, "validity_start")?;
        let ttl = parse_field(&fields, 4, "ttl")?;

        let capabilities = match fields.get(5) {
            Some(caps) if !caps.is_empty() => caps
                .split('+')
                .map(|c| {
                    c.parse().map_err(|_| TicketError::InvalidField {
                        field: "capabilities",
                        value: c.to_string(),
                    })
                })
                .collect::<Result<Vec<u32>, _>>()?,
            _ => Vec::new(),
        };

        Ok(Self {
            version,
            user_id,
            client_id,
            validity_start,
            validity_end: validity_start + ttl,
            ttl,
            capabilities,
        })
    }

    /// Expired at `now` (seconds since the Unix epoch).
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.validity_end
    }

    pub fn is_expired(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(i64::MAX);
        self.is_expired_at(now)
    }

    pub fn has_capability(&self, capability: u32) -> bool {
        self.capabilities.contains(&capability)
    }
}
