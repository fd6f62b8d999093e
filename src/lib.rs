pub mod config;
pub mod errors;
pub mod filters;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod router;
pub mod services;

pub use config::GatewayConfig;
pub use errors::GatewayError;
pub use models::{AppState, Principal, RateLimit, RateLimitStatus};
pub use router::{PathRewrite, Route, RouteTable};
