//! Query inspection
//!
//! Pulls unit UUIDs, the cluster ID and the query instant out of incoming
//! queries so ownership can be checked before anything reaches a backend.
//! This is deliberately regex-based rather than a PromQL parser; queries the
//! regexes cannot see yield no UUIDs, which makes the ownership check fail
//! closed for non-admin users.

use crate::config::LbType;
use axum::body::{to_bytes, Body};
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, Request};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

/// Matches `uuid="..."` / `service_name=~"..."` label selectors. The leading
/// class keeps `gpuuuid` (and friends) from being mistaken for a unit UUID.
static UUID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[^gpu](?:uuid|service_name)=~?"([a-zA-Z0-9|-]+)""#).unwrap());

/// Matches `ceems_id="..."` label selectors.
static CLUSTER_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"ceems_id=~?"([a-zA-Z0-9_|-]+)""#).unwrap());

/// Parameters derived from one client request.
///
/// Lives as a request extension from the auth middleware to the proxy.
#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    /// Target cluster
    pub cluster_id: String,

    /// Unit UUIDs referenced by the query, possibly empty
    pub uuids: Vec<String>,

    /// Query instant (ms since epoch), 0 when absent
    pub time: i64,

    /// Resolved user
    pub user: String,

    /// Whether the user is an admin
    pub is_admin: bool,
}

/// JSON body of a Pyroscope read request.
#[derive(Debug, Deserialize)]
struct PyroQuery {
    #[serde(default)]
    label_selector: String,

    /// Window start (ms since epoch)
    #[serde(default)]
    start: Option<i64>,
}

/// Inspect a request, filling `params` and handing the request back intact.
///
/// POST bodies that have to be read for inspection are re-attached before
/// the request is returned. Parse problems are logged and otherwise ignored:
/// an uninspectable query simply yields no UUIDs.
pub async fn inspect_request(
    params: &mut RequestParams,
    lb_type: LbType,
    req: Request<Body>,
) -> Request<Body> {
    match lb_type {
        LbType::Tsdb => inspect_tsdb(params, req).await,
        LbType::Pyroscope => inspect_pyro(params, req).await,
    }
}

async fn inspect_tsdb(params: &mut RequestParams, req: Request<Body>) -> Request<Body> {
    if let Some(query) = req.uri().query() {
        collect_pairs(params, url::form_urlencoded::parse(query.as_bytes()));
    }

    let is_form = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if req.method() != Method::POST || !is_form {
        return req;
    }

    let (parts, body) = req.into_parts();
    match to_bytes(body, usize::MAX).await {
        Ok(bytes) => {
            collect_pairs(params, url::form_urlencoded::parse(&bytes));
            Request::from_parts(parts, Body::from(bytes))
        }
        Err(e) => {
            warn!(error = %e, "failed to read form body for inspection");
            Request::from_parts(parts, Body::empty())
        }
    }
}

async fn inspect_pyro(params: &mut RequestParams, req: Request<Body>) -> Request<Body> {
    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to read profile query body for inspection");
            return Request::from_parts(parts, Body::empty());
        }
    };

    match serde_json::from_slice::<PyroQuery>(&bytes) {
        Ok(query) => {
            scan_expression(params, &query.label_selector);
            if params.time == 0 {
                params.time = query.start.unwrap_or(0);
            }
        }
        Err(e) => debug!(error = %e, "profile query body is not inspectable JSON"),
    }
    Request::from_parts(parts, Body::from(bytes))
}

fn collect_pairs<'a>(
    params: &mut RequestParams,
    pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
) {
    for (key, value) in pairs {
        match key.as_ref() {
            "query" => scan_expression(params, &value),
            "time" | "start" => {
                if params.time == 0 {
                    match parse_time_ms(&value) {
                        Some(time) => params.time = time,
                        None => debug!(value = %value, "unparseable query instant"),
                    }
                }
            }
            _ => {}
        }
    }
}

/// Scan a query expression for unit UUIDs and a cluster ID label.
pub fn scan_expression(params: &mut RequestParams, expr: &str) {
    for captures in UUID_REGEX.captures_iter(expr) {
        for uuid in captures[1].split('|') {
            if !uuid.is_empty() && !params.uuids.iter().any(|u| u == uuid) {
                params.uuids.push(uuid.to_string());
            }
        }
    }

    if let Some(captures) = CLUSTER_ID_REGEX.captures(expr) {
        let label_id = &captures[1];
        if params.cluster_id.is_empty() {
            params.cluster_id = label_id.to_string();
        } else if params.cluster_id != label_id {
            // The header is authoritative; a disagreeing label usually means
            // a dashboard is pointed at the wrong datasource.
            warn!(
                header = %params.cluster_id,
                label = %label_id,
                "ceems_id label disagrees with cluster ID header"
            );
        }
    }
}

/// Parse an RFC 3339 or unix-seconds timestamp into ms since epoch.
pub fn parse_time_ms(value: &str) -> Option<i64> {
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(parsed.timestamp_millis());
    }
    value
        .parse::<f64>()
        .ok()
        .map(|seconds| (seconds * 1000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(expr: &str) -> RequestParams {
        let mut params = RequestParams::default();
        scan_expression(&mut params, expr);
        params
    }

    #[test]
    fn extracts_uuid_selectors() {
        assert_eq!(scan(r#"up{uuid="j1"}"#).uuids, vec!["j1"]);
        assert_eq!(
            scan(r#"avg(foo{uuid=~"abc-123"}) / bar{uuid="def-456"}"#).uuids,
            vec!["abc-123", "def-456"]
        );
        assert_eq!(
            scan(r#"process_cpu{service_name=~"svc-1"}"#).uuids,
            vec!["svc-1"]
        );
    }

    #[test]
    fn splits_pipe_separated_uuids() {
        assert_eq!(scan(r#"up{uuid=~"j1|j2|j3"}"#).uuids, vec!["j1", "j2", "j3"]);
    }

    #[test]
    fn deduplicates_uuids() {
        assert_eq!(
            scan(r#"foo{uuid="j1"} + bar{uuid=~"j1|j2"}"#).uuids,
            vec!["j1", "j2"]
        );
    }

    #[test]
    fn ignores_gpu_uuid_labels() {
        assert!(scan(r#"DCGM_FI_DEV_GPU_UTIL{gpuuuid="GPU-956348bc"}"#)
            .uuids
            .is_empty());
    }

    #[test]
    fn takes_cluster_id_from_label_when_header_absent() {
        let params = scan(r#"up{ceems_id="slurm-0",uuid="j1"}"#);
        assert_eq!(params.cluster_id, "slurm-0");
    }

    #[test]
    fn header_wins_over_disagreeing_label() {
        let mut params = RequestParams {
            cluster_id: "slurm-0".to_string(),
            ..Default::default()
        };
        scan_expression(&mut params, r#"up{ceems_id="os-1",uuid="j1"}"#);
        assert_eq!(params.cluster_id, "slurm-0");
    }

    #[test]
    fn parses_timestamps() {
        assert_eq!(parse_time_ms("1700000000"), Some(1_700_000_000_000));
        assert_eq!(parse_time_ms("1700000000.5"), Some(1_700_000_000_500));
        assert_eq!(
            parse_time_ms("2023-11-14T22:13:20Z"),
            Some(1_700_000_000_000)
        );
        assert_eq!(parse_time_ms("yesterday"), None);
    }

    #[tokio::test]
    async fn inspects_get_requests() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/v1/query?query=up%7Buuid%3D%22j1%22%7D&time=1700000000")
            .body(Body::empty())
            .unwrap();

        let mut params = RequestParams::default();
        inspect_request(&mut params, LbType::Tsdb, req).await;
        assert_eq!(params.uuids, vec!["j1"]);
        assert_eq!(params.time, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn inspects_post_form_and_preserves_body() {
        let form = "query=up%7Buuid%3D%22j9%22%7D&time=1700000000";
        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/query")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form))
            .unwrap();

        let mut params = RequestParams::default();
        let req = inspect_request(&mut params, LbType::Tsdb, req).await;
        assert_eq!(params.uuids, vec!["j9"]);

        let bytes = to_bytes(req.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes, form.as_bytes());
    }

    #[tokio::test]
    async fn inspects_pyroscope_label_selectors() {
        let body = serde_json::json!({
            "label_selector": r#"{service_name=~"svc-1|svc-2"}"#,
            "start": 1_700_000_000_000i64,
        });
        let req = Request::builder()
            .method(Method::POST)
            .uri("/querier.v1.QuerierService/SelectMergeStacktraces")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let mut params = RequestParams::default();
        inspect_request(&mut params, LbType::Pyroscope, req).await;
        assert_eq!(params.uuids, vec!["svc-1", "svc-2"]);
        assert_eq!(params.time, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn unparseable_query_yields_no_uuids() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/v1/query?query=%7Bmalformed")
            .body(Body::empty())
            .unwrap();

        let mut params = RequestParams::default();
        inspect_request(&mut params, LbType::Tsdb, req).await;
        assert!(params.uuids.is_empty());
    }
}
