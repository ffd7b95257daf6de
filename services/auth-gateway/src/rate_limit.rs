//! Per-client admission control for the authentication endpoints.
//!
//! Each client identity gets its own token bucket (capacity `burst`, refilled
//! at `rate_per_second`). Buckets are created full on first sight and evicted
//! by a background sweep once idle for longer than the sweep interval.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::HeaderMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::RateLimitSettings;

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const REAL_IP_HEADER: &str = "x-real-ip";

#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

struct Inner {
    visitors: RwLock<HashMap<String, Arc<Visitor>>>,
    capacity: f64,
    rate_per_second: f64,
    idle_ttl: Duration,
}

struct Visitor {
    state: Mutex<State>,
}

struct State {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl Visitor {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            state: Mutex::new(State {
                tokens: capacity,
                last_refill: now,
                last_seen: now,
            }),
        }
    }

    fn try_acquire(&self, capacity: f64, rate_per_second: f64, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            let replenished = elapsed * rate_per_second;
            state.tokens = (state.tokens + replenished).min(capacity);
            state.last_refill = now;
        }
        state.last_seen = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        now.duration_since(state.last_seen)
    }
}

impl AdmissionController {
    pub fn new(settings: &RateLimitSettings) -> Self {
        let capacity = settings.burst.max(1) as f64;
        let rate_per_second = if settings.rate_per_second > 0.0 {
            settings.rate_per_second
        } else {
            1.0
        };
        Self {
            inner: Arc::new(Inner {
                visitors: RwLock::new(HashMap::new()),
                capacity,
                rate_per_second,
                idle_ttl: Duration::from_secs(settings.sweep_interval_secs.max(1)),
            }),
        }
    }

    /// Try to take one permit from `identity`'s bucket.
    pub async fn allow(&self, identity: &str) -> bool {
        let visitor = self.visitor(identity).await;
        visitor.try_acquire(
            self.inner.capacity,
            self.inner.rate_per_second,
            Instant::now(),
        )
    }

    async fn visitor(&self, identity: &str) -> Arc<Visitor> {
        if let Some(visitor) = self.inner.visitors.read().await.get(identity) {
            return visitor.clone();
        }

        let mut visitors = self.inner.visitors.write().await;
        visitors
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Visitor::new(self.inner.capacity, Instant::now())))
            .clone()
    }

    pub async fn visitor_count(&self) -> usize {
        self.inner.visitors.read().await.len()
    }

    /// Evict clients idle for longer than the sweep interval. Returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle_ttl = self.inner.idle_ttl;
        let mut visitors = self.inner.visitors.write().await;
        let before = visitors.len();
        visitors.retain(|_, visitor| visitor.idle_for(now) <= idle_ttl);
        before - visitors.len()
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let controller = self.clone();
        let every = self.inner.idle_ttl;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = controller.sweep().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted idle rate limit buckets");
                }
            }
        })
    }
}

/// Client identity used for admission control.
///
/// Prefers `X-Forwarded-For` (first hop), then `X-Real-IP`, then the peer
/// address. The headers are trusted as-is, which is only sound behind a
/// proxy that overwrites them; without one a client can pick its own identity.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(',').next().unwrap_or("").trim().to_string())
            .filter(|value| !value.is_empty())
    };

    header(FORWARDED_FOR_HEADER)
        .or_else(|| header(REAL_IP_HEADER))
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}
