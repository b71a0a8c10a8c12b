//! # ceems-core
//!
//! Core data model and shared helpers for the CEEMS stack.
//!
//! This crate provides:
//! - The compute unit model (`Unit`, `Cluster`, `ClusterUnits`, `MetricMap`)
//! - A unified error type for CEEMS components
//! - Float sanitization and deterministic UUID derivation
//! - Web client settings shared by the gateway and the updater
//! - YAML configuration file loading

pub mod config;
pub mod error;
pub mod helpers;
pub mod types;

// Re-export main types
pub use config::{load_config, HttpClientConfig, WebConfig};
pub use error::{Error, Result};
pub use helpers::{sanitize_float, uuid_from_strings};
pub use types::{Cluster, ClusterUnits, MetricMap, Unit};
