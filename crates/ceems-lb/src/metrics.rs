//! Internal gateway metrics

use crate::pool::PoolManager;
use crate::Result;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Gateway-internal metrics exposed on `/metrics`.
#[derive(Debug, Clone)]
pub struct LbMetrics {
    registry: Registry,

    /// Requests handled, by cluster and response status
    pub requests_total: IntCounterVec,

    /// Backend liveness (1 = live, 0 = dead)
    pub backend_up: IntGaugeVec,

    /// Requests currently being forwarded per backend
    pub backend_inflight: IntGaugeVec,
}

impl LbMetrics {
    /// Create and register the metric set on a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("ceems_lb_requests_total", "Requests handled by the gateway"),
            &["cluster_id", "status"],
        )?;
        let backend_up = IntGaugeVec::new(
            Opts::new("ceems_lb_backend_up", "Backend liveness (1=live, 0=dead)"),
            &["cluster_id", "url"],
        )?;
        let backend_inflight = IntGaugeVec::new(
            Opts::new(
                "ceems_lb_backend_inflight_requests",
                "Requests currently in flight per backend",
            ),
            &["cluster_id", "url"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(backend_up.clone()))?;
        registry.register(Box::new(backend_inflight.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            backend_up,
            backend_inflight,
        })
    }

    /// Count one handled request.
    pub fn observe_request(&self, cluster_id: &str, status: &str) {
        self.requests_total
            .with_label_values(&[cluster_id, status])
            .inc();
    }

    /// Refresh backend gauges from pool state and render the registry.
    pub fn render(&self, pools: &PoolManager) -> Result<String> {
        for (cluster_id, pool) in pools.pools() {
            for backend in pool.backends() {
                let url = backend.url().as_str();
                self.backend_up
                    .with_label_values(&[cluster_id.as_str(), url])
                    .set(i64::from(backend.is_alive()));
                self.backend_inflight
                    .with_label_values(&[cluster_id.as_str(), url])
                    .set(backend.inflight() as i64);
            }
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::LbError::Internal(e.to_string()))
    }
}
