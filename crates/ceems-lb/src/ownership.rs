//! Ownership verification and admin lookup against CEEMS
//!
//! Two sources answer "does this user own these units" and "who are the
//! admins": the CEEMS API server's SQLite database read directly, or the
//! API server over HTTP. The database is preferred when both are
//! configured; a direct query is far cheaper than a round trip.

use crate::config::ApiServerConfig;
use crate::{LbError, Result, DB_NAME, GRAFANA_USER_HEADER, SERVICE_ACCOUNT};
use async_trait::async_trait;
use ceems_core::WebConfig;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

/// Per-call timeout for admin and ownership lookups.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Busy timeout for the read-only database handle.
const DB_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Answers whether a user may read metrics of the given units.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// True iff `user` owns every unit in `uuids` on one of `cluster_ids`,
    /// considering only units started at or before every provided start
    /// timestamp. An empty `uuids` set is never owned.
    async fn verify_ownership(
        &self,
        user: &str,
        cluster_ids: &[String],
        uuids: &[String],
        starts: &[i64],
    ) -> bool;
}

/// Source of the current admin user set.
#[async_trait]
pub trait AdminSource: Send + Sync {
    /// Fetch the current set of admin user names.
    async fn admin_users(&self) -> Result<Vec<String>>;
}

/// CEEMS API server access, via its database and/or its HTTP endpoint.
pub struct CeemsApi {
    db: Option<Arc<Mutex<Connection>>>,
    web: Option<WebClient>,
}

struct WebClient {
    base: Url,
    client: reqwest::Client,
    basic_auth: Option<(String, String)>,
}

/// Response of `GET /api/v1/users/admin`.
#[derive(Debug, Deserialize)]
struct AdminUsersResponse {
    #[serde(default)]
    data: Vec<AdminUsers>,
}

#[derive(Debug, Deserialize)]
struct AdminUsers {
    #[serde(default)]
    users: Vec<String>,
}

impl CeemsApi {
    /// Open the configured sources.
    ///
    /// A configured but unreadable database path is fatal; an absent one
    /// simply leaves HTTP as the only source.
    pub fn from_config(config: &ApiServerConfig) -> Result<Self> {
        let db = match &config.data.path {
            Some(dir) => {
                let path = dir.join(DB_NAME);
                if !path.is_file() {
                    return Err(LbError::Configuration(format!(
                        "ownership database {:?} is not readable",
                        path
                    )));
                }
                let conn = Connection::open_with_flags(
                    &path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(DB_BUSY_TIMEOUT)?;
                debug!(path = %path.display(), "opened ownership database");
                Some(Arc::new(Mutex::new(conn)))
            }
            None => None,
        };

        let web = match config.web.url.is_empty() {
            true => None,
            false => Some(WebClient::new(&config.web)?),
        };

        Ok(Self { db, web })
    }

    /// Whether any source is configured at all.
    pub fn is_configured(&self) -> bool {
        self.db.is_some() || self.web.is_some()
    }

    async fn query_owned_count(
        db: Arc<Mutex<Connection>>,
        user: String,
        cluster_ids: Vec<String>,
        uuids: Vec<String>,
        start: Option<i64>,
    ) -> Result<usize> {
        let lookup = tokio::task::spawn_blocking(move || -> Result<usize> {
            let conn = db.lock();
            let mut sql = format!(
                "SELECT COUNT(DISTINCT uuid) FROM units WHERE username = ? \
                 AND cluster_id IN ({}) AND uuid IN ({})",
                placeholders(cluster_ids.len()),
                placeholders(uuids.len()),
            );
            let mut values: Vec<rusqlite::types::Value> = Vec::new();
            values.push(user.into());
            values.extend(cluster_ids.into_iter().map(Into::into));
            values.extend(uuids.into_iter().map(Into::into));
            if let Some(start) = start {
                sql.push_str(" AND started_at <= ?");
                values.push(start.into());
            }
            let mut statement = conn.prepare(&sql)?;
            let count: i64 =
                statement.query_row(rusqlite::params_from_iter(values), |row| row.get(0))?;
            Ok(count as usize)
        });

        match tokio::time::timeout(LOOKUP_TIMEOUT, lookup).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(LbError::Internal(join_error.to_string())),
            Err(_) => Err(LbError::Internal(
                "ownership database query timed out".to_string(),
            )),
        }
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

impl WebClient {
    fn new(config: &WebConfig) -> Result<Self> {
        let base = Url::parse(&config.url)
            .map_err(|e| LbError::Configuration(format!("invalid API server URL: {}", e)))?;

        // Lookups keep their own short timeout regardless of the configured
        // client timeout; a slow API server must not stall request auth.
        let mut builder = reqwest::Client::builder().timeout(LOOKUP_TIMEOUT);
        if let Some(token) = &config.http_client_config.bearer_token {
            let mut headers = reqwest::header::HeaderMap::new();
            let value = format!("Bearer {}", token)
                .parse()
                .map_err(|_| LbError::Configuration("invalid bearer token".to_string()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }
        let basic_auth = config
            .http_client_config
            .basic_auth
            .as_ref()
            .map(|auth| (auth.username.clone(), auth.password.clone()));

        Ok(Self {
            base,
            client: builder.build()?,
            basic_auth,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| LbError::Configuration(format!("invalid API server path: {}", e)))
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        let mut request = self.client.get(url);
        if let Some((username, password)) = &self.basic_auth {
            request = request.basic_auth(username, Some(password));
        }
        request
    }
}

#[async_trait]
impl Verifier for CeemsApi {
    async fn verify_ownership(
        &self,
        user: &str,
        cluster_ids: &[String],
        uuids: &[String],
        starts: &[i64],
    ) -> bool {
        // No unit scope means nothing can be verified; deny.
        if uuids.is_empty() {
            return false;
        }

        if let Some(db) = &self.db {
            // Per-unit AND across all provided timestamps: a unit must have
            // started at or before the earliest of them.
            let start = starts.iter().copied().filter(|s| *s > 0).min();
            match Self::query_owned_count(
                db.clone(),
                user.to_string(),
                cluster_ids.to_vec(),
                uuids.to_vec(),
                start,
            )
            .await
            {
                Ok(count) => return count == uuids.len(),
                Err(e) => {
                    error!(user, error = %e, "ownership database query failed");
                    return false;
                }
            }
        }

        if let Some(web) = &self.web {
            let url = match web.endpoint("/api/v1/units/verify") {
                Ok(url) => url,
                Err(e) => {
                    error!(error = %e, "cannot build verify endpoint");
                    return false;
                }
            };
            let mut query: Vec<(&str, String)> = Vec::new();
            query.extend(uuids.iter().map(|uuid| ("uuid", uuid.clone())));
            query.extend(cluster_ids.iter().map(|id| ("cluster_id", id.clone())));
            query.extend(
                starts
                    .iter()
                    .filter(|s| **s > 0)
                    .map(|s| ("time", s.to_string())),
            );

            // Transport errors and non-200s both deny: when the API server
            // is down, operators should notice, not leak metrics.
            return match web
                .get(url)
                .query(&query)
                .header(GRAFANA_USER_HEADER, user)
                .send()
                .await
            {
                Ok(response) if response.status() == reqwest::StatusCode::OK => true,
                Ok(response) => {
                    warn!(
                        user,
                        queried_uuids = uuids.join(","),
                        status = response.status().as_u16(),
                        "ownership verification denied"
                    );
                    false
                }
                Err(e) => {
                    error!(user, error = %e, "ownership verification request failed");
                    false
                }
            };
        }

        false
    }
}

#[async_trait]
impl AdminSource for CeemsApi {
    async fn admin_users(&self) -> Result<Vec<String>> {
        if let Some(db) = &self.db {
            let db = db.clone();
            let lookup = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
                let conn = db.lock();
                let mut statement =
                    conn.prepare("SELECT DISTINCT name FROM users WHERE role = 'admin'")?;
                let users = statement
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(users)
            });
            return match tokio::time::timeout(LOOKUP_TIMEOUT, lookup).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(LbError::Internal(join_error.to_string())),
                Err(_) => Err(LbError::Internal(
                    "admin user database query timed out".to_string(),
                )),
            };
        }

        if let Some(web) = &self.web {
            let url = web.endpoint("/api/v1/users/admin")?;
            let response: AdminUsersResponse = web
                .get(url)
                .query(&[("role", "admin")])
                .header(GRAFANA_USER_HEADER, SERVICE_ACCOUNT)
                .send()
                .await?
                .json()
                .await?;
            return Ok(response
                .data
                .into_iter()
                .flat_map(|entry| entry.users)
                .collect());
        }

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataConfig;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};

    fn seeded_db(dir: &std::path::Path) {
        let conn = Connection::open(dir.join(DB_NAME)).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE units (
                uuid TEXT NOT NULL,
                cluster_id TEXT NOT NULL,
                username TEXT NOT NULL,
                started_at INTEGER NOT NULL
            );
            CREATE TABLE users (name TEXT NOT NULL, role TEXT NOT NULL);
            INSERT INTO units VALUES ('j1', 'c1', 'alice', 1000);
            INSERT INTO units VALUES ('j2', 'c1', 'alice', 5000);
            INSERT INTO units VALUES ('j3', 'c1', 'bob', 1000);
            INSERT INTO units VALUES ('j4', 'c2', 'alice', 1000);
            INSERT INTO users VALUES ('root', 'admin');
            INSERT INTO users VALUES ('ops', 'admin');
            INSERT INTO users VALUES ('alice', 'user');
            "#,
        )
        .unwrap();
    }

    fn db_api(dir: &std::path::Path) -> CeemsApi {
        CeemsApi::from_config(&ApiServerConfig {
            data: DataConfig {
                path: Some(dir.to_path_buf()),
            },
            web: WebConfig::default(),
        })
        .unwrap()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[tokio::test]
    async fn db_mode_verifies_owned_units() {
        let dir = tempfile::tempdir().unwrap();
        seeded_db(dir.path());
        let api = db_api(dir.path());

        assert!(
            api.verify_ownership("alice", &strings(&["c1"]), &strings(&["j1", "j2"]), &[0])
                .await
        );
        // j3 belongs to bob
        assert!(
            !api.verify_ownership("alice", &strings(&["c1"]), &strings(&["j1", "j3"]), &[0])
                .await
        );
        // j4 is on another cluster
        assert!(
            !api.verify_ownership("alice", &strings(&["c1"]), &strings(&["j4"]), &[0])
                .await
        );
    }

    #[tokio::test]
    async fn db_mode_denies_empty_uuid_set() {
        let dir = tempfile::tempdir().unwrap();
        seeded_db(dir.path());
        let api = db_api(dir.path());

        assert!(!api.verify_ownership("alice", &strings(&["c1"]), &[], &[0]).await);
    }

    #[tokio::test]
    async fn db_mode_applies_start_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        seeded_db(dir.path());
        let api = db_api(dir.path());

        // j2 started at 5000, after the queried instant: not visible there.
        assert!(
            !api.verify_ownership("alice", &strings(&["c1"]), &strings(&["j2"]), &[2000])
                .await
        );
        // Historical queries over ended units are legitimate.
        assert!(
            api.verify_ownership("alice", &strings(&["c1"]), &strings(&["j1"]), &[2000])
                .await
        );
        // Several instants: the unit must predate the earliest one.
        assert!(
            !api.verify_ownership(
                "alice",
                &strings(&["c1"]),
                &strings(&["j2"]),
                &[9000, 2000]
            )
            .await
        );
        assert!(
            api.verify_ownership("alice", &strings(&["c1"]), &strings(&["j2"]), &[9000, 6000])
                .await
        );
    }

    #[tokio::test]
    async fn db_mode_lists_admin_users() {
        let dir = tempfile::tempdir().unwrap();
        seeded_db(dir.path());
        let api = db_api(dir.path());

        let mut admins = api.admin_users().await.unwrap();
        admins.sort();
        assert_eq!(admins, vec!["ops", "root"]);
    }

    #[tokio::test]
    async fn missing_db_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let result = CeemsApi::from_config(&ApiServerConfig {
            data: DataConfig {
                path: Some(dir.path().to_path_buf()),
            },
            web: WebConfig::default(),
        });
        assert!(result.is_err());
    }

    async fn http_api(grant: bool) -> CeemsApi {
        let verify = get(move |headers: HeaderMap| async move {
            // Only requests carrying the user header can be granted.
            if grant && headers.contains_key(GRAFANA_USER_HEADER) {
                StatusCode::OK
            } else {
                StatusCode::FORBIDDEN
            }
        });
        let admins = get(|| async {
            Json(serde_json::json!({"data": [{"users": ["root", "ops"]}]}))
        });
        let app = Router::new()
            .route("/api/v1/units/verify", verify)
            .route("/api/v1/users/admin", admins);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        CeemsApi::from_config(&ApiServerConfig {
            data: DataConfig::default(),
            web: WebConfig {
                url: format!("http://{}", addr),
                ..Default::default()
            },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn http_mode_follows_api_server_verdict() {
        let api = http_api(true).await;
        assert!(
            api.verify_ownership("alice", &strings(&["c1"]), &strings(&["j1"]), &[0])
                .await
        );

        let api = http_api(false).await;
        assert!(
            !api.verify_ownership("alice", &strings(&["c1"]), &strings(&["j1"]), &[0])
                .await
        );
    }

    #[tokio::test]
    async fn http_mode_fails_closed_when_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let api = CeemsApi::from_config(&ApiServerConfig {
            data: DataConfig::default(),
            web: WebConfig {
                url: format!("http://{}", addr),
                ..Default::default()
            },
        })
        .unwrap();
        assert!(
            !api.verify_ownership("alice", &strings(&["c1"]), &strings(&["j1"]), &[0])
                .await
        );
    }

    #[tokio::test]
    async fn http_mode_lists_admin_users() {
        let api = http_api(true).await;
        assert_eq!(api.admin_users().await.unwrap(), vec!["root", "ops"]);
    }

    #[tokio::test]
    async fn unconfigured_api_denies_everything() {
        let api = CeemsApi::from_config(&ApiServerConfig::default()).unwrap();
        assert!(!api.is_configured());
        assert!(
            !api.verify_ownership("alice", &strings(&["c1"]), &strings(&["j1"]), &[0])
                .await
        );
        assert!(api.admin_users().await.unwrap().is_empty());
    }
}
