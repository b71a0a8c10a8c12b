//! Shared configuration primitives
//!
//! Web client settings are used both by the gateway (for the CEEMS API
//! server) and by updater instances (for their TSDB), so they live here.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings for an outbound HTTP endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebConfig {
    /// Base URL of the endpoint
    #[serde(default)]
    pub url: String,

    /// HTTP client settings
    #[serde(default)]
    pub http_client_config: HttpClientConfig,
}

/// Outbound HTTP client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// Request timeout
    #[serde(default = "default_timeout", with = "serde_duration")]
    pub timeout: Duration,

    /// Basic auth credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,

    /// Bearer token for an Authorization header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

/// Basic auth username and password.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            basic_auth: None,
            bearer_token: None,
        }
    }
}

/// Read a YAML configuration file into a typed config.
pub fn load_config<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidConfiguration(
            "no configuration file path given".to_string(),
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Serde adapter for `"2m"`-style duration strings.
pub mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
