//! # ceems-tsdb
//!
//! HTTP client for Prometheus-family time series databases.
//!
//! This crate provides:
//! - Instant and range queries against `/api/v1/query` and
//!   `/api/v1/query_range`
//! - Decoding of vector and matrix responses into flat sample lists
//! - Sanitization of NaN and infinite sample values

use thiserror::Error;

pub mod client;

// Re-export main types
pub use client::{RangeSample, Sample, TsdbClient};

/// Result type for TSDB operations
pub type Result<T> = std::result::Result<T, TsdbError>;

/// Errors that can occur talking to a TSDB
#[derive(Error, Debug)]
pub enum TsdbError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("TSDB returned error: {0}")]
    Api(String),

    #[error("Malformed response: {0}")]
    Decode(String),
}
