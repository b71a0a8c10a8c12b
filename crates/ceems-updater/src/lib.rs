//! # ceems-updater
//!
//! Periodic enrichment of finished compute units with aggregate metrics.
//!
//! An updater instance is handed batches of recently finished units and
//! fills in their per-unit metric maps by querying a backing store. The
//! `Updater` trait is a capability: callers hold `Box<dyn Updater>` and new
//! updater kinds plug in through [`new_updater`] without touching call
//! sites. The only kind shipped today is `tsdb`.

use async_trait::async_trait;
use ceems_core::ClusterUnits;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod instance;
pub mod tsdb;

// Re-export main types
pub use instance::{Instance, UpdaterKind};
pub use tsdb::TsdbUpdater;

/// Result type for updater operations
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Errors that can occur constructing or running an updater
#[derive(Error, Debug)]
pub enum UpdaterError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("TSDB error: {0}")]
    Tsdb(#[from] ceems_tsdb::TsdbError),
}

/// A periodic job that enriches unit records with metrics.
#[async_trait]
pub trait Updater: Send + Sync {
    /// Enrich the given units with metrics observed in `[start, end]`.
    ///
    /// Clusters that do not list this instance among their updaters pass
    /// through untouched. A backend failure must leave the affected
    /// cluster's units exactly as passed in; the caller retries on its next
    /// tick.
    async fn update(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        units: Vec<ClusterUnits>,
    ) -> Vec<ClusterUnits>;
}

/// Construct the updater described by an instance config.
pub fn new_updater(instance: &Instance) -> Result<Box<dyn Updater>> {
    match instance.updater {
        UpdaterKind::Tsdb => Ok(Box::new(TsdbUpdater::new(instance)?)),
    }
}
