use std::convert::Infallible;
use std::sync::Arc;

use warp::{reply::Response, Filter, Reply};

use crate::handlers;
use crate::middleware::{self, Admission};
use crate::models::AppState;

/// The complete gateway: admission, preflight, health, then the proxy.
///
/// Errors raised after admission are rendered inside the CORS layer so
/// browsers can read them; a denied origin gets no CORS headers at all.
pub fn gateway(state: Arc<AppState>) -> impl Filter<Extract = (Response,), Error = Infallible> + Clone {
    let preflight = warp::options().map(handlers::preflight);

    let health = warp::path("gateway-health")
        .and(warp::path::end())
        .and(warp::get())
        .map(handlers::health);

    let routed = middleware::content_length_guard(state.config.max_body_bytes)
        .and(preflight.or(health).unify().or(proxy(state.clone())).unify())
        .recover(handlers::handle_rejection)
        .unify();

    middleware::admission(state)
        .and(routed)
        .map(|admission: Admission, response: Response| admission.decorate(response))
        .recover(handlers::handle_rejection)
        .unify()
}

fn proxy(state: Arc<AppState>) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    let query = warp::query::raw()
        .map(Some)
        .or(warp::any().map(|| None))
        .unify();

    warp::method()
        .and(warp::path::full())
        .and(query)
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(middleware::limited_body(state.config.max_body_bytes))
        .and(with_state(state))
        .and_then(handlers::proxy_request)
}

fn with_state(state: Arc<AppState>) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// The gateway with request tracing spans, as served by the binary.
pub fn serve_routes(state: Arc<AppState>) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    gateway(state).with(warp::trace::request())
}
