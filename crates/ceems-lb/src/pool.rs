//! Health-checked backend pools
//!
//! Backends are grouped per cluster. Each pool is probed by its own
//! recurring task; request paths only ever read the liveness flags.

use crate::config::{HealthCheckConfig, LbConfig, Strategy};
use crate::{LbError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// One backend endpoint with its health state.
#[derive(Debug)]
pub struct Backend {
    cluster_id: String,
    url: Url,
    alive: AtomicBool,
    failures: AtomicU32,
    inflight: AtomicUsize,
    failure_threshold: u32,
}

impl Backend {
    fn new(cluster_id: String, url: Url, failure_threshold: u32) -> Self {
        Self {
            cluster_id,
            url,
            alive: AtomicBool::new(true),
            failures: AtomicU32::new(0),
            inflight: AtomicUsize::new(0),
            failure_threshold,
        }
    }

    /// Base URL of the backend.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Cluster this backend serves.
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Whether the backend is currently considered live.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Number of requests currently being forwarded to this backend.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// One probe or forward succeeded: live again, strikes cleared.
    pub fn mark_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
        if !self.alive.swap(true, Ordering::Relaxed) {
            info!(url = %self.url, "backend is live again");
        }
    }

    /// One probe or forward failed; declared dead on the configured strike.
    pub fn mark_failure(&self) {
        let strikes = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if strikes >= self.failure_threshold && self.alive.swap(false, Ordering::Relaxed) {
            warn!(url = %self.url, strikes, "backend declared dead");
        }
    }

    /// Track one in-flight request for the lifetime of the guard.
    pub fn inflight_guard(self: &Arc<Self>) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        InflightGuard {
            backend: self.clone(),
        }
    }
}

/// Decrements the owning backend's in-flight counter on drop, which also
/// covers client disconnects cancelling the forward.
pub struct InflightGuard {
    backend: Arc<Backend>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.backend.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Backends of one cluster plus the selection strategy.
#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    strategy: Strategy,
    counter: AtomicUsize,
}

impl BackendPool {
    fn new(backends: Vec<Arc<Backend>>, strategy: Strategy) -> Self {
        Self {
            backends,
            strategy,
            counter: AtomicUsize::new(0),
        }
    }

    /// All backends of the pool, live or dead.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Pick a live backend, or `None` when the whole pool is dead.
    pub fn select(&self) -> Option<Arc<Backend>> {
        let live: Vec<&Arc<Backend>> = self
            .backends
            .iter()
            .filter(|backend| backend.is_alive())
            .collect();
        if live.is_empty() {
            return None;
        }
        let chosen = match self.strategy {
            Strategy::RoundRobin => {
                let index = self.counter.fetch_add(1, Ordering::Relaxed) % live.len();
                live[index]
            }
            // min_by_key keeps the first minimum, so ties break by
            // configuration order.
            Strategy::LeastConnection => live
                .iter()
                .min_by_key(|backend| backend.inflight())
                .expect("live set is non-empty"),
        };
        Some(chosen.clone())
    }
}

/// All pools, keyed by cluster ID.
#[derive(Debug)]
pub struct PoolManager {
    pools: HashMap<String, Arc<BackendPool>>,
}

impl PoolManager {
    /// Build pools from configuration.
    pub fn from_config(config: &LbConfig) -> Result<Self> {
        let mut grouped: HashMap<String, Vec<Arc<Backend>>> = HashMap::new();
        for backend in &config.backends {
            let url = Url::parse(&backend.url).map_err(|e| {
                LbError::Configuration(format!("invalid backend URL {:?}: {}", backend.url, e))
            })?;
            grouped
                .entry(backend.cluster_id.clone())
                .or_default()
                .push(Arc::new(Backend::new(
                    backend.cluster_id.clone(),
                    url,
                    config.health_check.failure_threshold,
                )));
        }
        if grouped.is_empty() {
            return Err(LbError::Configuration("no backends configured".to_string()));
        }

        let pools = grouped
            .into_iter()
            .map(|(cluster_id, backends)| {
                (
                    cluster_id,
                    Arc::new(BackendPool::new(backends, config.strategy)),
                )
            })
            .collect();
        Ok(Self { pools })
    }

    /// Pick a live backend for a cluster.
    pub fn select(&self, cluster_id: &str) -> Option<Arc<Backend>> {
        self.pools.get(cluster_id)?.select()
    }

    /// All pools with their cluster IDs.
    pub fn pools(&self) -> impl Iterator<Item = (&String, &Arc<BackendPool>)> {
        self.pools.iter()
    }

    /// Spawn one recurring health check task per pool.
    pub fn start_health_checks(
        &self,
        config: &HealthCheckConfig,
        ready_path: &'static str,
    ) -> Result<Vec<JoinHandle<()>>> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        let interval = config.interval;

        let mut handles = Vec::new();
        for (cluster_id, pool) in &self.pools {
            let client = client.clone();
            let pool = pool.clone();
            let cluster_id = cluster_id.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    debug!(cluster = %cluster_id, "probing backends");
                    for backend in pool.backends() {
                        probe(&client, backend, ready_path).await;
                    }
                }
            }));
        }
        Ok(handles)
    }
}

/// Probe one backend's readiness endpoint and record the outcome.
pub(crate) async fn probe(client: &reqwest::Client, backend: &Arc<Backend>, ready_path: &str) {
    let url = match backend.url().join(ready_path) {
        Ok(url) => url,
        Err(e) => {
            warn!(url = %backend.url(), error = %e, "cannot build probe URL");
            backend.mark_failure();
            return;
        }
    };
    match client.get(url).send().await {
        Ok(response) if response.status().is_success() => backend.mark_success(),
        Ok(response) => {
            debug!(url = %backend.url(), status = response.status().as_u16(), "probe failed");
            backend.mark_failure();
        }
        Err(e) => {
            debug!(url = %backend.url(), error = %e, "probe failed");
            backend.mark_failure();
        }
    }
}
