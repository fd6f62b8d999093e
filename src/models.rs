use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::GatewayConfig;
use crate::errors::GatewayError;
use crate::middleware::OriginPolicy;
use crate::services::RateLimiter;

/// Per-client counter for the current window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub count: u32,
    pub window_start: Instant,
}

impl RateLimit {
    pub fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }
}

/// Outcome of a rate-limit check, advertised through the `RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the current window resets.
    pub reset_secs: u64,
    pub allowed: bool,
}

/// Identity attached to a request before rate limiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

pub struct AppState {
    pub config: GatewayConfig,
    pub origins: OriginPolicy,
    pub rate_limits: RateLimiter,
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Arc<Self>, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build upstream client: {e}")))?;

        Ok(Arc::new(Self {
            origins: OriginPolicy::new(&config.allowed_origins),
            rate_limits: RateLimiter::new(config.rate_limit),
            client,
            config,
        }))
    }
}
