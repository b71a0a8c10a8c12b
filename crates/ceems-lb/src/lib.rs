//! # ceems-lb
//!
//! Tenant-aware load balancer for CEEMS metric backends.
//!
//! This crate provides:
//! - An authenticating reverse proxy between Grafana and per-cluster TSDB
//!   or Pyroscope backends
//! - Query inspection that extracts unit UUIDs and cluster IDs from
//!   PromQL and profile queries
//! - Ownership verification against the CEEMS database or API server
//! - Health-checked backend pools with round-robin and least-connection
//!   load balancing

use thiserror::Error;

pub mod admin;
pub mod config;
pub mod inspector;
pub mod metrics;
pub mod middleware;
pub mod ownership;
pub mod pool;
pub mod proxy;
pub mod response;
pub mod server;

// Re-export main types
pub use config::{LbConfig, LbType, Strategy};
pub use inspector::RequestParams;
pub use response::{ApiError, ErrorType};
pub use server::AppState;

/// Header carrying the authenticated Grafana user.
pub const GRAFANA_USER_HEADER: &str = "X-Grafana-User";

/// Header carrying the cluster the query is aimed at.
pub const CLUSTER_ID_HEADER: &str = "X-Ceems-Cluster-Id";

/// Header synthesized with the resolved user before forwarding.
pub const LOGGED_USER_HEADER: &str = "X-Logged-User";

/// Header synthesized for admin users before forwarding.
pub const ADMIN_USER_HEADER: &str = "X-Admin-User";

/// Identity used when the gateway itself calls the CEEMS API server.
pub const SERVICE_ACCOUNT: &str = "ceems-service-account";

/// File name of the ownership database inside `api_server.data.path`.
pub const DB_NAME: &str = "ceems.db";

/// Result type for load balancer operations
pub type Result<T> = std::result::Result<T, LbError>;

/// Errors that can occur setting up or running the load balancer
#[derive(Error, Debug)]
pub enum LbError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Core error: {0}")]
    Core(#[from] ceems_core::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
