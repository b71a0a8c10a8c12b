//! TSDB query client

use crate::{Result, TsdbError};
use ceems_core::{sanitize_float, WebConfig};
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// One decoded instant-vector sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Label set of the series
    pub labels: HashMap<String, String>,

    /// Sample value, sanitized
    pub value: f64,
}

/// One decoded range-matrix series.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSample {
    /// Label set of the series
    pub labels: HashMap<String, String>,

    /// `(timestamp, value)` points, values sanitized
    pub values: Vec<(f64, f64)>,
}

/// Client for a Prometheus-compatible TSDB.
#[derive(Debug, Clone)]
pub struct TsdbClient {
    base: Url,
    client: Client,
    basic_auth: Option<(String, String)>,
}

impl TsdbClient {
    /// Create a client from web endpoint settings.
    pub fn new(config: &WebConfig) -> Result<Self> {
        let base = Url::parse(&config.url)
            .map_err(|e| TsdbError::Configuration(format!("invalid TSDB URL: {}", e)))?;

        let mut builder = Client::builder().timeout(config.http_client_config.timeout);
        if let Some(token) = &config.http_client_config.bearer_token {
            let mut headers = reqwest::header::HeaderMap::new();
            let value = format!("Bearer {}", token)
                .parse()
                .map_err(|_| TsdbError::Configuration("invalid bearer token".to_string()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }
        let client = builder.build()?;

        let basic_auth = config
            .http_client_config
            .basic_auth
            .as_ref()
            .map(|auth| (auth.username.clone(), auth.password.clone()));

        Ok(Self {
            base,
            client,
            basic_auth,
        })
    }

    /// Issue an instant query evaluated at `time`.
    pub async fn query(&self, query: &str, time: DateTime<Utc>) -> Result<Vec<Sample>> {
        let url = self.endpoint("api/v1/query")?;
        debug!(%query, time = time.timestamp(), "instant query");

        let mut request = self.client.get(url).query(&[
            ("query", query.to_string()),
            ("time", time.timestamp().to_string()),
        ]);
        if let Some((user, password)) = &self.basic_auth {
            request = request.basic_auth(user, Some(password));
        }

        let response: ApiResponse = request.send().await?.json().await?;
        let data = response.into_data()?;

        data.result.into_iter().map(Sample::try_from).collect()
    }

    /// Issue a range query over `[start, end]` with the given step.
    pub async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<RangeSample>> {
        let url = self.endpoint("api/v1/query_range")?;
        debug!(%query, start = start.timestamp(), end = end.timestamp(), "range query");

        let mut request = self.client.get(url).query(&[
            ("query", query.to_string()),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
            ("step", format!("{}s", step.as_secs().max(1))),
        ]);
        if let Some((user, password)) = &self.basic_auth {
            request = request.basic_auth(user, Some(password));
        }

        let response: ApiResponse = request.send().await?.json().await?;
        let data = response.into_data()?;

        data.result.into_iter().map(RangeSample::try_from).collect()
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| TsdbError::Configuration(format!("invalid query URL: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,

    #[serde(default)]
    data: Option<QueryData>,

    #[serde(default)]
    error: Option<String>,
}

impl ApiResponse {
    fn into_data(self) -> Result<QueryData> {
        if self.status != "success" {
            return Err(TsdbError::Api(
                self.error.unwrap_or_else(|| self.status.clone()),
            ));
        }
        self.data
            .ok_or_else(|| TsdbError::Decode("success response without data".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<RawResult>,
}

#[derive(Debug, Deserialize)]
struct RawResult {
    #[serde(default)]
    metric: HashMap<String, String>,

    #[serde(default)]
    value: Option<(f64, String)>,

    #[serde(default)]
    values: Option<Vec<(f64, String)>>,
}

fn parse_sample_value(raw: &str) -> Result<f64> {
    let value = raw
        .parse::<f64>()
        .map_err(|_| TsdbError::Decode(format!("unparseable sample value {:?}", raw)))?;
    Ok(sanitize_float(value))
}

impl TryFrom<RawResult> for Sample {
    type Error = TsdbError;

    fn try_from(raw: RawResult) -> Result<Self> {
        let (_, value) = raw
            .value
            .ok_or_else(|| TsdbError::Decode("vector sample without value".to_string()))?;
        Ok(Self {
            labels: raw.metric,
            value: parse_sample_value(&value)?,
        })
    }
}

impl TryFrom<RawResult> for RangeSample {
    type Error = TsdbError;

    fn try_from(raw: RawResult) -> Result<Self> {
        let points = raw
            .values
            .ok_or_else(|| TsdbError::Decode("matrix sample without values".to_string()))?;
        let values = points
            .into_iter()
            .map(|(ts, value)| Ok((ts, parse_sample_value(&value)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            labels: raw.metric,
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn serve(response: Value) -> String {
        let app = Router::new().route(
            "/api/v1/query",
            get(move || {
                let response = response.clone();
                async move { Json(response) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client_for(url: String) -> TsdbClient {
        TsdbClient::new(&WebConfig {
            url,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn decodes_instant_vectors() {
        let url = serve(json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"uuid": "1"}, "value": [12345, "1.1"]},
                    {"metric": {"uuid": "2"}, "value": [12345, "2.2"]},
                ],
            },
        }))
        .await;

        let samples = client_for(url)
            .query("foo", Utc::now())
            .await
            .unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].labels["uuid"], "1");
        assert_eq!(samples[0].value, 1.1);
        assert_eq!(samples[1].value, 2.2);
    }

    #[tokio::test]
    async fn sanitizes_non_finite_values() {
        let url = serve(json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"uuid": "1"}, "value": [12345, "NaN"]},
                    {"metric": {"uuid": "2"}, "value": [12345, "+Inf"]},
                    {"metric": {"uuid": "3"}, "value": [12345, "-Inf"]},
                ],
            },
        }))
        .await;

        let samples = client_for(url)
            .query("foo", Utc::now())
            .await
            .unwrap();
        assert!(samples.iter().all(|s| s.value == 0.0));
    }

    #[tokio::test]
    async fn surfaces_api_errors() {
        let url = serve(json!({
            "status": "error",
            "error": "query processing would load too many samples",
        }))
        .await;

        let err = client_for(url).query("foo", Utc::now()).await.unwrap_err();
        assert!(matches!(err, TsdbError::Api(_)));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_request_error() {
        // Nothing listens on this port; bind and drop to find a free one.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client_for(format!("http://{}", addr))
            .query("foo", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, TsdbError::Request(_)));
    }
}
