//! In-memory form of one discovered service instance.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::feed::FeedRecord;

/// Announcement format version this client understands.
pub const RECORD_VERSION: u64 = 3;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("class records are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported discovery record version {0}")]
    UnsupportedVersion(u64),

    #[error("malformed {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
}

fn malformed(field: &'static str, reason: impl Into<String>) -> RecordError {
    RecordError::Malformed {
        field,
        reason: reason.into(),
    }
}

/// One versioned action a class exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionSpec {
    pub name: String,
    pub version: u32,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceClass {
    pub name: String,
    pub actions: Vec<ActionSpec>,
}

/// `[version, ident, sector, weight, interval_ms, connspec, protocols, classes, timestamp]`
#[derive(Deserialize)]
struct ClassRecordLine(
    u64,
    String,
    String,
    u32,
    u64,
    String,
    Vec<Value>,
    Vec<Value>,
    f64,
);

/// A discovered, addressable service instance.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceProxy {
    pub ident: String,
    pub sector: String,
    pub weight: u32,
    #[serde(serialize_with = "serialize_millis")]
    pub announce_interval: Duration,
    pub connspec: String,
    pub protocols: Vec<String>,
    pub classes: Vec<ServiceClass>,
    pub timestamp: f64,
    #[serde(skip)]
    pub raw_class_records: String,
    #[serde(skip)]
    pub certificate: String,
    #[serde(skip)]
    pub signature: String,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl ServiceProxy {
    pub fn from_feed_record(record: FeedRecord) -> Result<Self, RecordError> {
        let FeedRecord {
            class_records,
            certificate,
            signature,
        } = record;

        let fields: Vec<Value> = serde_json::from_str(&class_records)?;
        let version = fields
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed("record", "missing version"))?;
        if version != RECORD_VERSION {
            return Err(RecordError::UnsupportedVersion(version));
        }

        let ClassRecordLine(_, ident, sector, weight, interval_ms, connspec, protocols, classes, timestamp) =
            serde_json::from_value(Value::Array(fields))?;

        // Non-string protocol entries carry extension data we don't use.
        let protocols = protocols
            .into_iter()
            .filter_map(|p| match p {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect();

        let classes = classes
            .iter()
            .map(parse_class)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            ident,
            sector,
            weight,
            announce_interval: Duration::from_millis(interval_ms),
            connspec,
            protocols,
            classes,
            timestamp,
            raw_class_records: class_records,
            certificate,
            signature,
        })
    }

    /// Action-index keys this instance is stored under, one per
    /// class × action × protocol: `sector:Class.action~version#protocol`.
    pub fn action_keys(&self) -> impl Iterator<Item = String> + '_ {
        self.classes.iter().flat_map(move |class| {
            class.actions.iter().flat_map(move |action| {
                self.protocols.iter().map(move |protocol| {
                    format!(
                        "{}:{}.{}~{}#{}",
                        self.sector, class.name, action.name, action.version, protocol
                    )
                })
            })
        })
    }

    pub fn supports_protocol(&self, protocol: &str) -> bool {
        self.protocols.iter().any(|p| p == protocol)
    }
}

fn parse_class(value: &Value) -> Result<ServiceClass, RecordError> {
    let parts = value
        .as_array()
        .ok_or_else(|| malformed("class", "expected an array"))?;
    let (name, actions) = parts
        .split_first()
        .ok_or_else(|| malformed("class", "empty class entry"))?;
    let name = name
        .as_str()
        .ok_or_else(|| malformed("class", "class name is not a string"))?;

    Ok(ServiceClass {
        name: name.to_string(),
        actions: actions.iter().map(parse_action).collect::<Result<_, _>>()?,
    })
}

/// `[name]`, `[name, version]`, `[name, "flags"]` or `[name, "flags", version]`.
fn parse_action(value: &Value) -> Result<ActionSpec, RecordError> {
    let parts = value
        .as_array()
        .ok_or_else(|| malformed("action", "expected an array"))?;
    let (name, rest) = parts
        .split_first()
        .ok_or_else(|| malformed("action", "empty action entry"))?;
    let name = name
        .as_str()
        .ok_or_else(|| malformed("action", "action name is not a string"))?;

    let mut version = 1;
    let mut flags = Vec::new();
    for part in rest {
        match part {
            Value::String(tags) => {
                flags = tags
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            Value::Number(n) => {
                version = n
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| malformed("action", format!("bad version for `{name}`")))?;
            }
            _ => return Err(malformed("action", format!("unexpected field in `{name}`"))),
        }
    }

    Ok(ActionSpec {
        name: name.to_string(),
        version,
        flags,
    })
}
