use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::errors::GatewayError;
use crate::router::{PathRewrite, Route, RouteTable};

pub const DEFAULT_PORT: u16 = 8080;
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60; // window size in seconds
pub const RATE_LIMIT_ANONYMOUS: u32 = 100; // requests per window without a principal
pub const RATE_LIMIT_AUTHENTICATED: u32 = 1000; // requests per window with a principal
pub const RATE_LIMIT_PRUNE_THRESHOLD: usize = 10_000;
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
pub const MAX_BODY_SIZE_MB: u64 = 100;

pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:3001",
    "https://eshop-seperated.vercel.app",
    "https://eshop-seperated-admin.vercel.app",
];

/// Environment variable, default base URL, and service label for each upstream.
const UPSTREAMS: &[(&str, &str, &str)] = &[
    ("AUTH_SERVICE_URL", "http://localhost:5001", "auth"),
    ("CATALOGUE_SERVICE_URL", "http://localhost:5002", "catalogue"),
    ("NOTIFICATION_SERVICE_URL", "http://localhost:5003", "notification"),
    ("PAYMENT_SERVICE_URL", "http://localhost:5004", "payment"),
    ("REVIEW_SERVICE_URL", "http://localhost:5005", "review"),
    ("INVENTORY_SERVICE_URL", "http://localhost:5006", "inventory"),
    ("MESSAGING_SERVICE_URL", "http://localhost:5007", "messaging"),
    ("CHECKOUT_SERVICE_URL", "http://localhost:5008", "checkout"),
    ("ORDER_SERVICE_URL", "http://localhost:5009", "order"),
    ("CUSTOMER_SERVICE_URL", "http://localhost:5010", "customer"),
    ("AI_SEARCH_URL", "http://localhost:8000", "ai-search"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub anonymous_max: u32,
    pub authenticated_max: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
            anonymous_max: RATE_LIMIT_ANONYMOUS,
            authenticated_max: RATE_LIMIT_AUTHENTICATED,
        }
    }
}

/// Immutable gateway configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub routes: RouteTable,
    pub rate_limit: RateLimitConfig,
    pub max_body_bytes: u64,
    pub upstream_timeout: Duration,
    /// Resolve the client IP from `X-Forwarded-For` instead of the socket peer.
    pub trust_proxy: bool,
    /// Bearer token -> principal name.
    pub service_tokens: HashMap<String, String>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, GatewayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup, so fixture
    /// environments can be used without touching the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = match var("PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| GatewayError::Config(format!("PORT must be a port number, got {raw:?}")))?,
            None => DEFAULT_PORT,
        };

        let mut allowed_origins = match var("CORS_ALLOWED_ORIGINS") {
            Some(raw) => split_list(&raw),
            None => Vec::new(),
        };
        if allowed_origins.is_empty() {
            allowed_origins = DEFAULT_ALLOWED_ORIGINS.iter().map(|s| s.to_string()).collect();
        }
        for key in ["NEXT_PUBLIC_GATEWAY_URL", "NEXT_PUBLIC_API_URL"] {
            if let Some(origin) = var(key) {
                allowed_origins.push(origin.trim_end_matches('/').to_string());
            }
        }
        let mut seen = HashSet::new();
        allowed_origins.retain(|origin| seen.insert(origin.clone()));

        let upstreams: HashMap<&str, String> = UPSTREAMS
            .iter()
            .map(|&(key, default, service)| (service, var(key).unwrap_or_else(|| default.to_string())))
            .collect();
        let routes = default_routes(&upstreams)?;

        let upstream_timeout = Duration::from_secs(parse_number(var("PROXY_TIMEOUT_SECS"), "PROXY_TIMEOUT_SECS", REQUEST_TIMEOUT_SECS)?);
        let max_body_bytes = parse_number(var("MAX_BODY_SIZE_MB"), "MAX_BODY_SIZE_MB", MAX_BODY_SIZE_MB)? * 1024 * 1024;

        let trust_proxy = matches!(var("TRUST_PROXY").as_deref(), Some("true" | "1" | "yes"));

        let service_tokens = var("GATEWAY_SERVICE_TOKENS")
            .map(|raw| parse_tokens(&raw))
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            port,
            allowed_origins,
            routes,
            rate_limit: RateLimitConfig::default(),
            max_body_bytes,
            upstream_timeout,
            trust_proxy,
            service_tokens,
        })
    }
}

/// The eshop route table. `/api` stays last: it is the catch-all for the auth
/// service's legacy paths.
fn default_routes(upstreams: &HashMap<&str, String>) -> Result<RouteTable, GatewayError> {
    let upstream = |service: &str| upstreams.get(service).cloned().unwrap_or_default();
    let backend = |prefix: &str, service: &'static str, rewrite: PathRewrite| {
        Route::new(prefix, service, upstream(service), rewrite)
            .forward_cookies(true)
            .relay_set_cookie(true)
    };

    RouteTable::new(vec![
        backend("/auth", "auth", PathRewrite::Relative).preserve_host(true),
        backend("/catalogue", "catalogue", PathRewrite::EnsurePrefix("/products".into())),
        backend("/notifications", "notification", PathRewrite::Prepend("/notifications".into())),
        backend("/payments", "payment", PathRewrite::Prepend("/payments".into())),
        backend("/reviews", "review", PathRewrite::Prepend("/reviews".into())),
        backend("/inventory", "inventory", PathRewrite::Prepend("/inventory".into())),
        backend("/messages", "messaging", PathRewrite::Prepend("/messages".into())),
        backend("/cart", "checkout", PathRewrite::Prepend("/cart".into())),
        backend("/wishlist", "checkout", PathRewrite::Prepend("/wishlist".into())),
        backend("/orders", "order", PathRewrite::Prepend("/orders".into())),
        backend("/profiles", "customer", PathRewrite::Prepend("/api/profiles".into())),
        Route::new("/ai-search", "ai-search", upstream("ai-search"), PathRewrite::Relative),
        backend("/api", "auth", PathRewrite::Original).preserve_host(true),
    ])
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_number(raw: Option<String>, key: &str, default: u64) -> Result<u64, GatewayError> {
    match raw {
        Some(raw) => raw
            .parse()
            .map_err(|_| GatewayError::Config(format!("{key} must be a non-negative integer, got {raw:?}"))),
        None => Ok(default),
    }
}

fn parse_tokens(raw: &str) -> Result<HashMap<String, String>, GatewayError> {
    split_list(raw)
        .into_iter()
        .map(|pair| match pair.split_once(':') {
            Some((token, name)) if !token.is_empty() && !name.is_empty() => {
                Ok((token.to_string(), name.to_string()))
            }
            _ => Err(GatewayError::Config(
                "GATEWAY_SERVICE_TOKENS entries must look like token:name".to_string(),
            )),
        })
        .collect()
}
