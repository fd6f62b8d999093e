use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hyper::header::{HeaderValue, AUTHORIZATION};
use hyper::HeaderMap;
use tokio::sync::RwLock;

use crate::config::{RateLimitConfig, RATE_LIMIT_PRUNE_THRESHOLD};
use crate::models::{Principal, RateLimit, RateLimitStatus};

pub mod proxy;


pub const RATE_LIMIT_LIMIT: &str = "ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "ratelimit-reset";

/// Fixed-window request counter keyed by client IP.
pub struct RateLimiter {
    config: RateLimitConfig,
    prune_threshold: usize,
    rate_limits: RwLock<Counters>,
}

#[derive(Default)]
struct Counters {
    clients: HashMap<String, RateLimit>,
    last_prune: Option<Instant>,
}

impl Counters {
    /// Drops expired clients once the map is large, at most once per window.
    fn prune(&mut self, now: Instant, window: Duration, threshold: usize) {
        if self.clients.len() < threshold {
            return;
        }
        if let Some(last) = self.last_prune {
            if now.saturating_duration_since(last) < window {
                return;
            }
        }
        self.clients.retain(|_, rl| !rl.is_expired(now, window));
        self.last_prune = Some(now);
        tracing::debug!(tracked = self.clients.len(), "pruned expired rate-limit entries");
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            prune_threshold: RATE_LIMIT_PRUNE_THRESHOLD,
            rate_limits: RwLock::new(Counters::default()),
        }
    }

    pub fn with_prune_threshold(mut self, threshold: usize) -> Self {
        self.prune_threshold = threshold;
        self
    }

    /// Counts one request for `client` and reports whether it fits the budget.
    ///
    /// The increment and the comparison happen under one write lock, so two
    /// concurrent requests can never both observe the last free slot.
    pub async fn check(&self, client: &str, authenticated: bool) -> RateLimitStatus {
        self.check_at(client, authenticated, Instant::now()).await
    }

    pub async fn check_at(&self, client: &str, authenticated: bool, now: Instant) -> RateLimitStatus {
        let limit = if authenticated {
            self.config.authenticated_max
        } else {
            self.config.anonymous_max
        };
        let window = self.config.window;

        let mut counters = self.rate_limits.write().await;
        counters.prune(now, window, self.prune_threshold);

        let rate_limit = counters
            .clients
            .entry(client.to_string())
            .and_modify(|rl| {
                if rl.is_expired(now, window) {
                    rl.count = 1;
                    rl.window_start = now;
                } else {
                    rl.count = rl.count.saturating_add(1);
                }
            })
            .or_insert_with(|| RateLimit {
                count: 1,
                window_start: now,
            });

        let elapsed = now.saturating_duration_since(rate_limit.window_start);
        let reset = window.saturating_sub(elapsed);
        RateLimitStatus {
            limit,
            remaining: limit.saturating_sub(rate_limit.count),
            reset_secs: reset.as_secs() + u64::from(reset.subsec_nanos() > 0),
            allowed: rate_limit.count <= limit,
        }
    }

    pub async fn tracked_clients(&self) -> usize {
        self.rate_limits.read().await.clients.len()
    }

    #[cfg(test)]
    pub(crate) async fn set(&self, client: &str, rate_limit: RateLimit) {
        self.rate_limits
            .write()
            .await
            .clients
            .insert(client.to_string(), rate_limit);
    }
}

pub fn add_rate_limit_headers(headers: &mut HeaderMap, status: &RateLimitStatus) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(status.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(status.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(status.reset_secs));
}

/// Client identity used as the rate-limit key.
///
/// Behind a trusted proxy the left-most `X-Forwarded-For` entry is the
/// original client; otherwise only the socket peer can be trusted.
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>, trust_proxy: bool) -> String {
    let forwarded = trust_proxy
        .then(|| headers.get("x-forwarded-for"))
        .flatten()
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    match (forwarded, remote) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => "unknown".to_string(),
    }
}

/// Attaches a principal for bearer tokens the gateway was configured to trust.
pub fn resolve_principal(headers: &HeaderMap, tokens: &HashMap<String, String>) -> Option<Principal> {
    let auth_str = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = auth_str.strip_prefix("Bearer ")?.trim();
    tokens.get(token).map(|name| Principal { name: name.clone() })
}
