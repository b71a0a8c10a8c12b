//! Load balancer configuration

use ceems_core::config::serde_duration;
use ceems_core::{Error, WebConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Resources a non-admin user may reach on a TSDB backend.
static TSDB_RESOURCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(query|query_range|labels|series|values)/?$").unwrap());

/// Resources a non-admin user may reach on a Pyroscope backend.
static PYRO_RESOURCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(SelectMergeStacktraces|LabelNames|LabelValues)/?$").unwrap());

/// Kind of backends fronted by the load balancer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LbType {
    /// Prometheus-family time series databases
    #[default]
    Tsdb,
    /// Pyroscope profilers
    Pyroscope,
}

impl LbType {
    /// Regex of resource paths allowed for non-admin users.
    pub fn allowed_resources(&self) -> &'static Regex {
        match self {
            LbType::Tsdb => &TSDB_RESOURCES,
            LbType::Pyroscope => &PYRO_RESOURCES,
        }
    }

    /// Readiness probe path on backends of this kind.
    pub fn ready_path(&self) -> &'static str {
        match self {
            LbType::Tsdb => "/-/ready",
            LbType::Pyroscope => "/ready",
        }
    }
}

impl fmt::Display for LbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LbType::Tsdb => write!(f, "tsdb"),
            LbType::Pyroscope => write!(f, "pyroscope"),
        }
    }
}

/// Load balancing strategy for picking a live backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Monotonic counter modulo the live backend count
    #[default]
    RoundRobin,
    /// Live backend with the fewest in-flight requests
    LeastConnection,
}

/// One configured backend endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the backend
    pub url: String,

    /// Cluster this backend serves
    pub cluster_id: String,
}

/// Location of CEEMS API server resources used for authorization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiServerConfig {
    /// On-disk data of the API server
    #[serde(default)]
    pub data: DataConfig,

    /// HTTP endpoint of the API server
    #[serde(default)]
    pub web: WebConfig,
}

/// On-disk data settings of the CEEMS API server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory containing the ownership database file
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Backend health probing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Probe interval
    #[serde(default = "default_probe_interval", with = "serde_duration")]
    pub interval: Duration,

    /// Probe timeout
    #[serde(default = "default_probe_timeout", with = "serde_duration")]
    pub timeout: Duration,

    /// Consecutive failures before a backend is marked dead
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Top-level load balancer configuration.
///
/// Unknown top-level keys (such as the `updaters` section consumed by the
/// API server) are ignored, so one file can configure the whole stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LbConfig {
    /// Kind of backends being fronted
    #[serde(default)]
    pub lb_type: LbType,

    /// Load balancing strategy
    #[serde(default)]
    pub strategy: Strategy,

    /// Backend endpoints, at least one
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// CEEMS API server resources for authorization
    #[serde(default)]
    pub api_server: ApiServerConfig,

    /// Backend health probing
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Timeout for forwarded client requests
    #[serde(default = "default_request_timeout", with = "serde_duration")]
    pub request_timeout: Duration,
}

impl Default for LbConfig {
    fn default() -> Self {
        Self {
            lb_type: LbType::default(),
            strategy: Strategy::default(),
            backends: Vec::new(),
            api_server: ApiServerConfig::default(),
            health_check: HealthCheckConfig::default(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl LbConfig {
    /// Check the configuration for fatal problems.
    pub fn validate(&self) -> Result<(), Error> {
        if self.backends.is_empty() {
            return Err(Error::InvalidConfiguration(
                "no backends configured".to_string(),
            ));
        }
        for backend in &self.backends {
            Url::parse(&backend.url).map_err(|e| {
                Error::InvalidConfiguration(format!(
                    "invalid backend URL {:?}: {}",
                    backend.url, e
                ))
            })?;
            if backend.cluster_id.is_empty() {
                return Err(Error::InvalidConfiguration(format!(
                    "backend {:?} has no cluster_id",
                    backend.url
                )));
            }
        }
        if let Some(path) = &self.api_server.data.path {
            if !path.is_dir() {
                return Err(Error::InvalidConfiguration(format!(
                    "api_server.data.path {:?} is not a readable directory",
                    path
                )));
            }
        }
        Ok(())
    }

    /// Distinct cluster IDs, in configuration order.
    pub fn cluster_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for backend in &self.backends {
            if !ids.contains(&backend.cluster_id) {
                ids.push(backend.cluster_id.clone());
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> LbConfig {
        LbConfig {
            backends: vec![BackendConfig {
                url: "http://localhost:9090".to_string(),
                cluster_id: "slurm-0".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn parses_full_config() {
        let config: LbConfig = serde_yaml::from_str(
            r#"
strategy: least-connection
lb_type: tsdb
backends:
  - url: http://tsdb-0:9090
    cluster_id: slurm-0
  - url: http://tsdb-1:9090
    cluster_id: slurm-0
  - url: http://tsdb-2:9090
    cluster_id: os-0
api_server:
  data:
    path: /var/lib/ceems
  web:
    url: http://ceems-api:9020
health_check:
  interval: 10s
  timeout: 1s
  failure_threshold: 2
updaters:
  - id: default
    updater: tsdb
    web:
      url: http://tsdb-0:9090
"#,
        )
        .unwrap();
        assert_eq!(config.strategy, Strategy::LeastConnection);
        assert_eq!(config.backends.len(), 3);
        assert_eq!(config.cluster_ids(), vec!["slurm-0", "os-0"]);
        assert_eq!(config.health_check.interval, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn validate_rejects_empty_backends() {
        let config = LbConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_backend_url() {
        let mut config = minimal_config();
        config.backends[0].url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_db_dir() {
        let mut config = minimal_config();
        config.api_server.data.path = Some(PathBuf::from("/definitely/not/here"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn acl_regexes_match_expected_resources() {
        let tsdb = LbType::Tsdb.allowed_resources();
        assert!(tsdb.is_match("/api/v1/query"));
        assert!(tsdb.is_match("/api/v1/query_range"));
        assert!(tsdb.is_match("/api/v1/labels"));
        assert!(tsdb.is_match("/api/v1/series"));
        assert!(tsdb.is_match("/api/v1/label/uuid/values"));
        assert!(!tsdb.is_match("/api/v1/admin/tsdb/delete_series"));
        assert!(!tsdb.is_match("/api/v1/status/config"));

        let pyro = LbType::Pyroscope.allowed_resources();
        assert!(pyro.is_match("/querier.v1.QuerierService/SelectMergeStacktraces"));
        assert!(pyro.is_match("/querier.v1.QuerierService/LabelNames"));
        assert!(!pyro.is_match("/querier.v1.QuerierService/Series"));
    }

    #[test]
    fn strategies_use_kebab_case_names() {
        assert_eq!(
            serde_yaml::to_string(&Strategy::RoundRobin).unwrap().trim(),
            "round-robin"
        );
        assert_eq!(
            serde_yaml::to_string(&Strategy::LeastConnection)
                .unwrap()
                .trim(),
            "least-connection"
        );
    }
}
