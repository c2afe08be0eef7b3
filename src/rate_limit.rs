use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::AppError;
use crate::extract::ClientIp;
use crate::state::AppState;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(3 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterConfig {
    /// Sustained tokens per second.
    pub rps: f64,
    pub burst: u32,
    pub enabled: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        LimiterConfig {
            rps: 2.0,
            burst: 4,
            enabled: true,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Bucket {
            tokens: capacity,
            refilled_at: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, rps: f64, capacity: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rps).min(capacity);
        self.refilled_at = now;
    }
}

/// Per-source token buckets. The request path and the eviction sweep share
/// one lock.
#[derive(Debug)]
pub struct RateLimiter {
    config: LimiterConfig,
    clients: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        RateLimiter {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> LimiterConfig {
        self.config
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn allow(&self, source: &str) -> bool {
        self.allow_at(source, Instant::now())
    }

    /// Takes one token from `source`'s bucket, creating a full bucket on
    /// first sight. A denied request consumes nothing.
    pub fn allow_at(&self, source: &str, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }

        let capacity = f64::from(self.config.burst);
        let mut clients = self.clients();
        let bucket = clients
            .entry(source.to_string())
            .or_insert_with(|| Bucket::full(capacity, now));

        bucket.last_seen = now;
        bucket.refill(self.config.rps, capacity, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops buckets idle for longer than [`IDLE_THRESHOLD`]. Returns how
    /// many were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut clients = self.clients();
        let before = clients.len();
        clients.retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) <= IDLE_THRESHOLD);
        before - clients.len()
    }

    pub fn tracked(&self) -> usize {
        self.clients().len()
    }

    /// Runs the eviction sweep every [`SWEEP_INTERVAL`] for the life of the
    /// process.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = limiter.sweep_at(Instant::now());
                if evicted > 0 {
                    debug!(evicted, "Evicted idle rate limiter buckets");
                }
            }
        })
    }
}

pub async fn rate_limit(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !state.limiter.allow(&ip) {
        debug!(%ip, "Rate limit exceeded");
        return Err(AppError::RateLimited);
    }

    Ok(next.run(request).await)
}
