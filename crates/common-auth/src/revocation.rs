use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::clock::Clock;

/// Tokens invalidated before their natural expiry (logout).
///
/// Entries live only in process memory; a restart forgets every revocation.
/// An entry is only useful until its token would have expired anyway, so a
/// periodic sweep drops entries past their original `exp`.
pub struct RevocationRegistry {
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl RevocationRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub async fn add(&self, token: &str, expires_at: DateTime<Utc>) {
        self.entries
            .write()
            .await
            .insert(token.to_string(), expires_at);
    }

    /// Revoke `token` unless it already is. Returns `false` when another
    /// caller got there first, so exactly one redemption of a token wins.
    pub async fn revoke_if_absent(&self, token: &str, expires_at: DateTime<Utc>) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(token) {
            return false;
        }
        entries.insert(token.to_string(), expires_at);
        true
    }

    pub async fn is_revoked(&self, token: &str) -> bool {
        self.entries.read().await.contains_key(token)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop entries whose token has expired on its own. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at >= now);
        before - entries.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = registry.sweep().await;
                if removed > 0 {
                    tracing::debug!(removed, "swept expired revocation entries");
                }
            }
        })
    }
}
