use std::sync::Arc;

use crate::{config::Config, metrics::Metrics, poll::PollService, rate_limit::RateLimiter};

/// Shared handles passed to every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub polls: Arc<PollService>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
    pub env: Arc<str>,
}

impl AppState {
    pub fn new(polls: PollService, limiter: Arc<RateLimiter>, config: &Config) -> Self {
        Self::from_parts(Arc::new(polls), limiter, &config.env)
    }

    pub fn from_parts(polls: Arc<PollService>, limiter: Arc<RateLimiter>, env: &str) -> Self {
        Self {
            polls,
            limiter,
            metrics: Arc::new(Metrics::new()),
            env: Arc::from(env),
        }
    }
}
