//! Tracing configuration types.

use serde::Deserialize;

/// Logging and span export settings, read from the `[tracing]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct TracingConfig {
    /// Reported as `service.name` on exported spans.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// OTLP collector endpoint (e.g. "http://collector:4317"). Unset or
    /// blank keeps export off; an empty env override switches it off.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    #[serde(default)]
    pub protocol: OtlpProtocol,

    /// `EnvFilter` directives (e.g. "info", "scamp=debug,info").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Shape of the stderr log lines.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Colour stderr output. Turn off when logs go to a file or collector.
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

/// OTLP transport. Also accepts the `OTEL_EXPORTER_OTLP_PROTOCOL` spellings.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    #[serde(alias = "http/protobuf")]
    Http,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_service_name() -> String {
    "scamp-client".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ansi() -> bool {
    true
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            otlp_endpoint: None,
            protocol: OtlpProtocol::default(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            ansi: default_ansi(),
        }
    }
}

impl TracingConfig {
    /// The collector to export to, if export is on.
    pub fn otlp_target(&self) -> Option<&str> {
        self.otlp_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_otlp() {
        let config = TracingConfig::default();
        assert_eq!(config.service_name, "scamp-client");
        assert!(config.otlp_target().is_none());
        assert_eq!(config.protocol, OtlpProtocol::Grpc);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.ansi);
    }

    #[test]
    fn test_blank_endpoint_disables_export() {
        let blank = TracingConfig {
            otlp_endpoint: Some("  ".to_string()),
            ..TracingConfig::default()
        };
        assert!(blank.otlp_target().is_none());

        let set = TracingConfig {
            otlp_endpoint: Some(" http://collector:4317 ".to_string()),
            ..TracingConfig::default()
        };
        assert_eq!(set.otlp_target(), Some("http://collector:4317"));
    }

    #[test]
    fn test_parses_otel_protocol_spellings() {
        let parsed: TracingConfig = serde_json::from_str(
            r#"{"protocol": "http/protobuf", "log_format": "json", "ansi": false}"#,
        )
        .unwrap();
        assert_eq!(parsed.protocol, OtlpProtocol::Http);
        assert_eq!(parsed.log_format, LogFormat::Json);
        assert!(!parsed.ansi);
        assert_eq!(parsed.log_level, "info");
    }
}
