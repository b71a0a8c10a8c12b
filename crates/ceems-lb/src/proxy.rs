//! Reverse proxying to a chosen backend

use crate::pool::Backend;
use crate::response::ApiError;
use axum::body::{to_bytes, Body};
use axum::http::header::HOST;
use axum::http::{Request, Response, Uri};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Single-shot reverse proxy over a shared HTTP client.
///
/// Forwards are not retried here; a failed backend gets a failure strike
/// and the client decides whether to try again.
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl ReverseProxy {
    /// Create a proxy with the given per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            timeout,
        }
    }

    /// Forward a request to `backend` and hand back its response.
    pub async fn forward(
        &self,
        backend: Arc<Backend>,
        req: Request<Body>,
    ) -> Result<Response<Body>, ApiError> {
        let (mut parts, body) = req.into_parts();
        let bytes = to_bytes(body, usize::MAX)
            .await
            .map_err(|e| ApiError::bad_gateway(format!("failed to read request body: {}", e)))?;

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target: Uri = format!(
            "{}{}",
            backend.url().as_str().trim_end_matches('/'),
            path_and_query
        )
        .parse()
        .map_err(|e| ApiError::bad_gateway(format!("invalid backend URI: {}", e)))?;
        debug!(uri = %target, "forwarding request");

        // The client derives Host from the target URI.
        parts.headers.remove(HOST);

        let mut upstream = Request::builder().method(parts.method).uri(target);
        if let Some(headers) = upstream.headers_mut() {
            *headers = parts.headers;
        }
        let upstream = upstream
            .body(Full::new(bytes))
            .map_err(|e| ApiError::bad_gateway(format!("failed to build request: {}", e)))?;

        // The guard also covers cancellation: a disconnecting client drops
        // this future and with it the in-flight count.
        let _guard = backend.inflight_guard();
        let exchange = async {
            let response = self.client.request(upstream).await?;
            let (parts, body) = response.into_parts();
            let bytes = body.collect().await?.to_bytes();
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(Response::from_parts(
                parts,
                Body::from(bytes),
            ))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => {
                backend.mark_success();
                Ok(response)
            }
            Ok(Err(e)) => {
                warn!(url = %backend.url(), error = %e, "backend transport error");
                backend.mark_failure();
                Err(ApiError::bad_gateway("error contacting backend"))
            }
            Err(_) => {
                warn!(url = %backend.url(), "backend timed out");
                backend.mark_failure();
                Err(ApiError::bad_gateway("backend timed out"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, LbConfig};
    use crate::pool::PoolManager;
    use crate::response::ErrorType;
    use axum::extract::Request as AxumRequest;
    use axum::http::{HeaderMap, Method, StatusCode};
    use axum::routing::get;
    use axum::Router;

    async fn echo_backend() -> String {
        let app = Router::new().route(
            "/api/v1/query",
            get(|headers: HeaderMap, req: AxumRequest| async move {
                let logged = headers
                    .get("X-Logged-User")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                format!("{}|{}", req.uri(), logged)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn single_backend(url: &str) -> Arc<Backend> {
        let config = LbConfig {
            backends: vec![BackendConfig {
                url: url.to_string(),
                cluster_id: "c1".to_string(),
            }],
            ..Default::default()
        };
        PoolManager::from_config(&config)
            .unwrap()
            .select("c1")
            .unwrap()
    }

    #[tokio::test]
    async fn forwards_path_query_and_headers() {
        let url = echo_backend().await;
        let backend = single_backend(&url);
        let proxy = ReverseProxy::new(Duration::from_secs(5));

        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/v1/query?query=up")
            .header("X-Logged-User", "alice")
            .body(Body::empty())
            .unwrap();

        let response = proxy.forward(backend.clone(), req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes, "/api/v1/query?query=up|alice".as_bytes());
        assert_eq!(backend.inflight(), 0);
    }

    #[tokio::test]
    async fn transport_error_is_bad_gateway_and_a_strike() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let backend = single_backend(&format!("http://{}", addr));
        let proxy = ReverseProxy::new(Duration::from_secs(5));

        for _ in 0..3 {
            let req = Request::builder()
                .uri("/api/v1/query")
                .body(Body::empty())
                .unwrap();
            let err = proxy.forward(backend.clone(), req).await.unwrap_err();
            assert_eq!(err.error_type, ErrorType::BadGateway);
        }
        // Three consecutive transport failures kill the backend.
        assert!(!backend.is_alive());
        assert_eq!(backend.inflight(), 0);
    }
}
