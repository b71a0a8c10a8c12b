//! HTTP server assembly

use crate::admin::{AdminResolver, DEFAULT_ADMIN_TTL};
use crate::config::{LbConfig, LbType};
use crate::inspector::RequestParams;
use crate::metrics::LbMetrics;
use crate::middleware::auth_middleware;
use crate::ownership::{AdminSource, CeemsApi, Verifier};
use crate::pool::PoolManager;
use crate::proxy::ReverseProxy;
use crate::response::ApiError;
use crate::Result;
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Router};
use regex::Regex;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared state of the gateway.
pub struct AppState {
    /// Configured cluster IDs, the only ones requests may target
    pub cluster_ids: Vec<String>,

    /// Kind of backends being fronted
    pub lb_type: LbType,

    /// Resource paths allowed for non-admin users
    pub acl: Regex,

    /// Whether any ownership source is configured
    pub auth_configured: bool,

    /// Admin set resolver
    pub admin: AdminResolver,

    /// Ownership verifier
    pub verifier: Arc<dyn Verifier>,

    /// Per-cluster backend pools
    pub pools: Arc<PoolManager>,

    /// Upstream forwarding
    pub proxy: ReverseProxy,

    /// Internal metrics
    pub metrics: LbMetrics,
}

impl AppState {
    /// Assemble the gateway state from configuration.
    pub fn from_config(config: &LbConfig) -> Result<Arc<Self>> {
        let api = Arc::new(CeemsApi::from_config(&config.api_server)?);
        let auth_configured = api.is_configured();
        let admin_source: Arc<dyn AdminSource> = api.clone();

        Ok(Arc::new(Self {
            cluster_ids: config.cluster_ids(),
            lb_type: config.lb_type,
            acl: config.lb_type.allowed_resources().clone(),
            auth_configured,
            admin: AdminResolver::new(admin_source, DEFAULT_ADMIN_TTL),
            verifier: api,
            pools: Arc::new(PoolManager::from_config(config)?),
            proxy: ReverseProxy::new(config.request_timeout),
            metrics: LbMetrics::new()?,
        }))
    }

    /// Spawn the recurring health check tasks for all pools.
    pub fn start_health_checks(&self, config: &LbConfig) -> Result<Vec<JoinHandle<()>>> {
        self.pools
            .start_health_checks(&config.health_check, self.lb_type.ready_path())
    }
}

/// Build the gateway router.
///
/// Everything except the gateway's own endpoints is authenticated and
/// proxied; TSDB reads live under `/api/v1` while Pyroscope uses its
/// querier service paths, so the proxy is the fallback rather than a
/// fixed route.
pub fn build_app(state: Arc<AppState>) -> Router {
    let proxied = Router::new()
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(proxied)
        .layer(TraceLayer::new_for_http())
}

/// Serve until SIGINT or SIGTERM.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let app = build_app(state);
    info!(addr = %listener.local_addr()?, "gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = interrupt => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
    }
    info!("shutdown signal received");
}

async fn health_handler() -> &'static str {
    "CEEMS LB is healthy"
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render(&state.pools) {
        Ok(rendered) => rendered.into_response(),
        Err(e) => {
            error!(error = %e, "failed to render metrics");
            ApiError::new(
                crate::response::ErrorType::UserError,
                "failed to render metrics",
            )
            .into_response()
        }
    }
}

async fn proxy_handler(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    let params = req
        .extensions()
        .get::<RequestParams>()
        .cloned()
        .unwrap_or_default();

    let Some(backend) = state.pools.select(&params.cluster_id) else {
        return state.reject(
            &params,
            ApiError::no_backend("all backends for cluster are down"),
        );
    };

    match state.proxy.forward(backend, req).await {
        Ok(response) => {
            state
                .metrics
                .observe_request(&params.cluster_id, response.status().as_str());
            response.into_response()
        }
        Err(error) => state.reject(&params, error),
    }
}
