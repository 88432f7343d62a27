//! Relay configuration, taken as one JSON document from the environment.
//!
//! ```json
//! {
//!     "apikey": "9b35f0c3-6c01-4690-bf85-0c5dc7f944c0",
//!     "custom_field": {"type": "k8s", "env": "prod"},
//!     "applog": {
//!         "label": {
//!             "io.kubernetes.pod.namespace": {"rename": "ns"},
//!             "io.kubernetes.container.name": {"rename": "container"}
//!         }
//!     },
//!     "intake": {"host": "api.logmatic.io", "port": 10515}
//! }
//! ```

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use crate::labels::LabelMap;

pub(crate) const CONFIG_ENV: &str = "LOGSHIP_CONFIG";

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("{CONFIG_ENV} is not set")]
    Missing,
    #[error("config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config has no \"applog\" section, nothing would be shipped")]
    NoAppLog,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    apikey: String,
    #[serde(default = "empty_marker")]
    custom_field: serde_json::Value,
    applog: Option<AppLogSection>,
    intake: Option<IntakeSection>,
}

#[derive(Debug, Deserialize)]
struct AppLogSection {
    #[serde(default)]
    label: HashMap<String, LabelRule>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LabelRule {
    pub rename: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IntakeSection {
    #[serde(default = "default_intake_host")]
    pub host: String,
    #[serde(default = "default_intake_port")]
    pub port: u16,
}

impl Default for IntakeSection {
    fn default() -> Self {
        Self {
            host: default_intake_host(),
            port: default_intake_port(),
        }
    }
}

fn empty_marker() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

fn default_intake_host() -> String {
    "api.logmatic.io".to_owned()
}

fn default_intake_port() -> u16 {
    10515
}

/// Validated configuration handed to the rest of the relay.
#[derive(Debug)]
pub(crate) struct RelayConfig {
    pub apikey: String,
    /// Opaque value copied verbatim into every outbound record.
    pub marker: serde_json::Value,
    pub labels: LabelMap,
    pub intake: IntakeSection,
}

impl RelayConfig {
    pub(crate) fn from_env() -> Result<Self, ConfigError> {
        let raw = std::env::var(CONFIG_ENV).map_err(|_| ConfigError::Missing)?;
        Self::from_json(&raw)
    }

    fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let parsed: RawConfig = serde_json::from_str(raw)?;
        // refuse to run as a no-op shipper
        let applog = parsed.applog.ok_or(ConfigError::NoAppLog)?;
        Ok(Self {
            apikey: parsed.apikey,
            marker: parsed.custom_field,
            labels: LabelMap::new(applog.label),
            intake: parsed.intake.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let cfg = RelayConfig::from_json(
            r#"{
                "apikey": "secret",
                "custom_field": {"env": "prod"},
                "applog": {"label": {"io.kubernetes.pod.namespace": {"rename": "ns"}}},
                "intake": {"host": "intake.example.com", "port": 4443}
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.apikey, "secret");
        assert_eq!(cfg.marker["env"], "prod");
        assert_eq!(cfg.intake.host, "intake.example.com");
        assert_eq!(cfg.intake.port, 4443);
    }

    #[test]
    fn marker_and_intake_have_defaults() {
        let cfg =
            RelayConfig::from_json(r#"{"apikey": "secret", "applog": {}}"#).unwrap();
        assert_eq!(cfg.marker, serde_json::json!({}));
        assert_eq!(cfg.intake.host, "api.logmatic.io");
        assert_eq!(cfg.intake.port, 10515);
    }

    #[test]
    fn missing_applog_section_is_fatal() {
        let err = RelayConfig::from_json(r#"{"apikey": "secret"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::NoAppLog));
    }

    #[test]
    fn missing_apikey_is_fatal() {
        let err = RelayConfig::from_json(r#"{"applog": {}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
