//! Configuration types and loading logic.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::value::{Dict, Map, Value};
use figment::{Figment, Metadata, Profile, Provider};
use scamp_tracing::TracingConfig;
use serde::Deserialize;

use crate::registry::validate::{AcceptAll, AuthorizedServices, RecordValidator};
use crate::retry::RetryPolicy;

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScampConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

/// Where the discovery cache lives and how its records are checked.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    #[serde(default = "default_true")]
    pub verify_records: bool,

    /// Fingerprint-to-sector allowlist. Without one, every record that
    /// parses is accepted.
    #[serde(default)]
    pub authorized_services: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
}

/// Retry bound for loading the discovery cache.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("/backplane/discovery/discovery")
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    300
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_backoff_ms() -> u64 {
    200
}

fn default_max_attempts() -> u32 {
    crate::retry::MAX_RETRIES
}

/// Pause between cache reads, giving an announcer time to finish a write.
fn default_retry_backoff_ms() -> u64 {
    100
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            verify_records: true,
            authorized_services: None,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl DiscoveryConfig {
    pub fn validator(&self) -> anyhow::Result<Arc<dyn RecordValidator>> {
        match &self.authorized_services {
            Some(path) => {
                let authorized = AuthorizedServices::load(path).map_err(|e| {
                    anyhow::anyhow!("cannot read authorized services {}: {e}", path.display())
                })?;
                tracing::debug!(path = %path.display(), grants = authorized.len(), "Loaded authorized services");
                Ok(Arc::new(authorized))
            }
            None => Ok(Arc::new(AcceptAll)),
        }
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connect_attempts,
            Duration::from_millis(self.connect_backoff_ms),
        )
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_ms))
    }
}

impl ScampConfig {
    /// Load configuration from soa.conf, a TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (SCAMP_ prefix, __ for nesting)
    /// 2. TOML config file
    /// 3. soa.conf, when given
    /// 4. Defaults
    pub fn load(config_path: &str, soa_path: Option<&Path>) -> anyhow::Result<Self> {
        let config: ScampConfig = Self::figment(config_path, soa_path).extract()?;
        Ok(config)
    }

    pub fn figment(config_path: &str, soa_path: Option<&Path>) -> Figment {
        let mut figment = Figment::new();
        if let Some(path) = soa_path {
            figment = figment.merge(SoaConf::file(path));
        }
        figment
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("SCAMP_").split("__"))
    }
}

/// Provider for SCAMP `soa.conf` files.
///
/// Each `key = value` line sets one value; dotted keys nest, so
/// `discovery.cache_path = /x` lands at `discovery.cache_path`. The value is
/// the first whitespace-delimited token after `=`. A missing file provides
/// nothing.
#[derive(Debug, Clone)]
pub struct SoaConf {
    path: PathBuf,
}

impl SoaConf {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Provider for SoaConf {
    fn metadata(&self) -> Metadata {
        Metadata::named("SCAMP soa.conf")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => {
                return Err(format!("cannot read {}: {e}", self.path.display()).into());
            }
        };

        let mut dict = Dict::new();
        for (key, raw) in parse_soa_conf(&text) {
            let value = raw
                .parse::<Value>()
                .unwrap_or_else(|_| Value::from(raw.to_string()));
            if let Value::Dict(_, nested) = figment::util::nest(&key.to_ascii_lowercase(), value) {
                merge_dict(&mut dict, nested);
            }
        }
        Ok(Profile::Default.collect(dict))
    }
}

/// `key = value` pairs in file order. Lines without `=`, with an empty key
/// or value, or starting with `#` are skipped.
pub fn parse_soa_conf(text: &str) -> Vec<(&str, &str)> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_start();
            if line.starts_with('#') {
                return None;
            }
            let (key, rest) = line.split_once('=')?;
            let key = key.trim();
            let value = rest.split_whitespace().next()?;
            if key.is_empty() || key.contains(char::is_whitespace) {
                return None;
            }
            Some((key, value))
        })
        .collect()
}

fn merge_dict(dict: &mut Dict, incoming: Dict) {
    for (key, value) in incoming {
        if let (Some(Value::Dict(_, existing)), Value::Dict(_, nested)) = (dict.get_mut(&key), &value) {
            merge_dict(existing, nested.clone());
            continue;
        }
        dict.insert(key, value);
    }
}
