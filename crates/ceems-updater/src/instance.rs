//! Updater instance configuration

use ceems_core::WebConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of updater backing an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdaterKind {
    /// Aggregation queries against a Prometheus-family TSDB
    Tsdb,
}

impl fmt::Display for UpdaterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdaterKind::Tsdb => write!(f, "tsdb"),
        }
    }
}

/// A single configured updater instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Instance identifier, referenced by cluster `updaters` lists
    pub id: String,

    /// Updater kind
    pub updater: UpdaterKind,

    /// Backend endpoint and HTTP client settings
    #[serde(default)]
    pub web: WebConfig,

    /// Kind-specific settings, interpreted by the chosen updater
    #[serde(default)]
    pub extra: serde_yaml::Value,
}
