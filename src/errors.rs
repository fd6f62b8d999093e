use thiserror::Error;

use crate::models::RateLimitStatus;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Origin {0} is not allowed by CORS")]
    AdmissionDenied(String),
    #[error("Too many requests, please try again later.")]
    RateLimited(RateLimitStatus),
    #[error("No route for {0}")]
    RouteNotFound(String),
    #[error("Upstream {service} at {upstream} is unreachable: {reason}")]
    UpstreamUnreachable {
        service: &'static str,
        upstream: String,
        reason: String,
    },
    #[error("Upstream {service} at {upstream} timed out")]
    UpstreamTimeout {
        service: &'static str,
        upstream: String,
    },
    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },
    #[error("Invalid URI: {0}")]
    InvalidUri(String),
    #[error("HTTP Error: {0}")]
    Http(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl GatewayError {
    /// Short machine-readable kind, used as the `error` field of JSON bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AdmissionDenied(_) => "admission_denied",
            Self::RateLimited(_) => "rate_limited",
            Self::RouteNotFound(_) => "route_not_found",
            Self::UpstreamUnreachable { .. } => "upstream_unreachable",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::BodyTooLarge { .. } => "body_too_large",
            Self::InvalidUri(_) | Self::Http(_) | Self::Config(_) => "internal",
        }
    }
}

impl warp::reject::Reject for GatewayError {}
