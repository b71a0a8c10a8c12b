//! Admin user resolution with a TTL cache

use crate::ownership::AdminSource;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Default lifetime of a cached admin set.
pub const DEFAULT_ADMIN_TTL: Duration = Duration::from_secs(300);

/// Resolves the current admin users, caching the set for a TTL.
///
/// On refresh failure the last known set keeps being served, so a flapping
/// API server cannot demote every admin at once; the failure is logged and
/// the next call retries.
pub struct AdminResolver {
    source: Arc<dyn AdminSource>,
    ttl: Duration,
    cache: RwLock<CachedAdmins>,
}

#[derive(Default)]
struct CachedAdmins {
    users: Arc<Vec<String>>,
    refreshed_at: Option<Instant>,
}

impl AdminResolver {
    /// Create a resolver over the given source.
    pub fn new(source: Arc<dyn AdminSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: RwLock::new(CachedAdmins::default()),
        }
    }

    /// Whether `user` is currently an admin.
    pub async fn contains(&self, user: &str) -> bool {
        self.current().await.iter().any(|admin| admin == user)
    }

    /// The current admin set, refreshed when stale.
    pub async fn current(&self) -> Arc<Vec<String>> {
        if let Some(users) = self.fresh_snapshot() {
            return users;
        }
        self.refresh().await
    }

    fn fresh_snapshot(&self) -> Option<Arc<Vec<String>>> {
        let cache = self.cache.read();
        match cache.refreshed_at {
            Some(at) if at.elapsed() < self.ttl => Some(cache.users.clone()),
            _ => None,
        }
    }

    async fn refresh(&self) -> Arc<Vec<String>> {
        match self.source.admin_users().await {
            Ok(users) => {
                let users = Arc::new(users);
                let mut cache = self.cache.write();
                cache.users = users.clone();
                cache.refreshed_at = Some(Instant::now());
                users
            }
            Err(e) => {
                // Stale timestamp is kept so the next call retries.
                warn!(error = %e, "failed to refresh admin users, serving last known set");
                self.cache.read().users.clone()
            }
        }
    }
}
