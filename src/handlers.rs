use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use warp::{path::FullPath, reply::Response, Rejection, Reply};

use crate::errors::GatewayError;
use crate::models::AppState;
use crate::services::{self, add_rate_limit_headers, proxy};


pub const HEALTH_MESSAGE: &str = "Welcome to api-gateway!";

#[derive(Serialize)]
struct MessageBody<'a> {
    message: &'a str,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

pub fn health() -> Response {
    warp::reply::json(&MessageBody { message: HEALTH_MESSAGE }).into_response()
}

pub fn preflight() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    crate::middleware::add_preflight_headers(response.headers_mut());
    response
}

/// Rate-limits, routes and forwards one request.
pub async fn proxy_request(
    method: Method,
    full_path: FullPath,
    query: Option<String>,
    headers: HeaderMap,
    remote: Option<SocketAddr>,
    body: Bytes,
    state: Arc<AppState>,
) -> Result<Response, Rejection> {
    let start_time = Instant::now();
    let config = &state.config;
    let path = full_path.as_str();

    let client_ip = services::client_ip(&headers, remote, config.trust_proxy);
    let principal = services::resolve_principal(&headers, &config.service_tokens);
    let rate = state.rate_limits.check(&client_ip, principal.is_some()).await;
    if !rate.allowed {
        tracing::warn!(client = %client_ip, limit = rate.limit, "rate limit exceeded");
        return Err(warp::reject::custom(GatewayError::RateLimited(rate)));
    }

    let (route, relative) = match config.routes.route_for(path) {
        Some(found) => found,
        None => return Err(warp::reject::custom(GatewayError::RouteNotFound(path.to_string()))),
    };

    let forwarded = proxy::Forward {
        method: method.clone(),
        path,
        query: query.as_deref(),
        headers: &headers,
        body,
        client_ip: &client_ip,
    };
    let mut response = proxy::forward(&state.client, route, relative, forwarded)
        .await
        .map_err(|e| {
            tracing::error!(
                prefix = %route.prefix,
                upstream = %route.upstream,
                error = %e,
                "upstream request failed"
            );
            warp::reject::custom(e)
        })?;
    add_rate_limit_headers(response.headers_mut(), &rate);

    tracing::info!(
        "{} {} {} {}ms",
        method,
        path,
        response.status(),
        start_time.elapsed().as_millis()
    );

    Ok(response)
}

pub async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (code, kind, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "route_not_found", "Not Found".to_string())
    } else if let Some(e) = err.find::<GatewayError>() {
        let code = match e {
            GatewayError::AdmissionDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match e {
            GatewayError::RouteNotFound(_) => "Not Found".to_string(),
            GatewayError::UpstreamUnreachable { service, .. } => format!("Service {} is unavailable", service),
            GatewayError::UpstreamTimeout { service, .. } => format!("Service {} timed out", service),
            GatewayError::InvalidUri(_) | GatewayError::Http(_) | GatewayError::Config(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (code, e.kind(), message)
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "body_too_large", "Payload too large".to_string())
    } else if err.find::<warp::reject::InvalidHeader>().is_some() {
        (StatusCode::BAD_REQUEST, "bad_request", "Invalid request header".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", "Method not allowed".to_string())
    } else {
        tracing::error!(rejection = ?err, "unhandled rejection");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal", "Internal server error".to_string())
    };

    let body = ErrorBody { error: kind, message };
    let mut response = warp::reply::with_status(warp::reply::json(&body), code).into_response();

    if let Some(GatewayError::RateLimited(rate)) = err.find::<GatewayError>() {
        add_rate_limit_headers(response.headers_mut(), rate);
        response
            .headers_mut()
            .insert(hyper::header::RETRY_AFTER, rate.reset_secs.into());
    }

    Ok(response)
}
