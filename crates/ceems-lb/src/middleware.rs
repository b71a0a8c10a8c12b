//! Authentication and authorization middleware
//!
//! Every proxied request walks the same sequence: cluster gate, header
//! sanitizing, user gate, admin lookup, resource ACL, query inspection and
//! finally ownership verification. Any failure answers with a CEEMS API
//! error envelope and nothing reaches a backend.

use crate::inspector::{inspect_request, RequestParams};
use crate::response::ApiError;
use crate::server::AppState;
use crate::{ADMIN_USER_HEADER, CLUSTER_ID_HEADER, GRAFANA_USER_HEADER, LOGGED_USER_HEADER};
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{debug, error};

fn header_value(req: &Request<Body>, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Run the auth sequence ahead of the proxy handler.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let mut params = RequestParams {
        cluster_id: header_value(&req, CLUSTER_ID_HEADER),
        ..Default::default()
    };

    // Cluster gate: only configured clusters may be queried.
    if !state.cluster_ids.contains(&params.cluster_id) {
        error!(url = %req.uri(), "cluster ID header missing or unknown");
        return state.reject(
            &params,
            ApiError::bad_request(
                "invalid cluster ID. Set cluster ID using X-Ceems-Cluster-Id header \
                 in Prometheus datasource.",
            ),
        );
    }

    // Without an ownership source there is nothing further to check.
    if !state.auth_configured {
        req.extensions_mut().insert(params);
        return next.run(req).await;
    }

    // Never trust identity headers minted by the client.
    req.headers_mut().remove(ADMIN_USER_HEADER);
    req.headers_mut().remove(LOGGED_USER_HEADER);

    let user = header_value(&req, GRAFANA_USER_HEADER);
    if user.is_empty() {
        error!(url = %req.uri(), "Grafana user header not found");
        return state.reject(
            &params,
            ApiError::unauthorized(
                "no user header found. Make sure to set send_user_header = true in \
                 [dataproxy] section of Grafana configuration file.",
            ),
        );
    }
    params.user = user.clone();
    debug!(logged_user = %user, url = %req.uri(), "authenticating request");

    params.is_admin = state.admin.contains(&user).await;
    if let Ok(value) = HeaderValue::from_str(&user) {
        req.headers_mut().insert(LOGGED_USER_HEADER, value.clone());
        if params.is_admin {
            req.headers_mut().insert(ADMIN_USER_HEADER, value);
        }
    }

    // Non-admins may only touch the read resources of this backend kind.
    if !params.is_admin && !state.acl.is_match(req.uri().path()) {
        error!(logged_user = %user, resource = %req.uri().path(), "forbidden resource");
        return state.reject(
            &params,
            ApiError::forbidden("user do not have permissions to this resource"),
        );
    }

    // Inspection failures leave the UUID set empty, which the ownership
    // check below treats as a denial for non-admins.
    let mut req = inspect_request(&mut params, state.lb_type, req).await;

    if !params.is_admin {
        let owned = state
            .verifier
            .verify_ownership(
                &params.user,
                &[params.cluster_id.clone()],
                &params.uuids,
                &[params.time],
            )
            .await;
        if !owned {
            return state.reject(
                &params,
                ApiError::forbidden("user do not have permissions to view unit metrics"),
            );
        }
    }

    req.extensions_mut().insert(params);
    next.run(req).await
}

impl AppState {
    /// Record and render a middleware rejection.
    pub(crate) fn reject(&self, params: &RequestParams, error: ApiError) -> Response {
        self.metrics
            .observe_request(&params.cluster_id, &error.status_label());
        error.into_response()
    }
}
