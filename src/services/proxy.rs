use bytes::Bytes;
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::{Body, HeaderMap, Method, Response};

use crate::errors::GatewayError;
use crate::router::Route;

/// Headers that describe a single connection and never cross the proxy.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers sent upstream for `route`.
pub fn upstream_request_headers(route: &Route, inbound: &HeaderMap, client_ip: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 1);
    for (name, value) in inbound.iter() {
        if is_hop_by_hop(name) || *name == header::CONTENT_LENGTH {
            continue;
        }
        if *name == header::HOST && !route.preserve_host {
            continue;
        }
        if *name == header::COOKIE && !route.forward_cookies {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let forwarded_for = match inbound.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        Some(chain) => format!("{}, {}", chain, client_ip),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
    headers
}

/// Headers relayed back to the caller. Every value is appended, so repeated
/// headers such as `Set-Cookie` reach the caller unmerged.
pub fn downstream_response_headers(route: &Route, upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        if *name == header::SET_COOKIE && !route.relay_set_cookie {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// One inbound request, already admitted, counted and collected.
pub struct Forward<'a> {
    pub method: Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
    pub client_ip: &'a str,
}

/// Sends the request to `route`'s upstream and relays the response.
///
/// A failed call is surfaced once; nothing is retried, since forwarded
/// requests are not known to be idempotent.
pub async fn forward(
    client: &reqwest::Client,
    route: &Route,
    relative: &str,
    request: Forward<'_>,
) -> Result<Response<Body>, GatewayError> {
    let url = route.target_url(request.path, relative, request.query);
    let headers = upstream_request_headers(route, request.headers, request.client_ip);

    tracing::debug!(service = route.service, %url, method = %request.method, "forwarding request");

    let upstream = client
        .request(request.method, &url)
        .headers(headers)
        .body(request.body)
        .send()
        .await
        .map_err(|e| classify(route, e))?;

    let status = upstream.status();
    let headers = downstream_response_headers(route, upstream.headers());

    let mut response = Response::new(Body::wrap_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn classify(route: &Route, e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::UpstreamTimeout {
            service: route.service,
            upstream: route.upstream.clone(),
        }
    } else if e.is_builder() {
        GatewayError::InvalidUri(e.to_string())
    } else {
        GatewayError::UpstreamUnreachable {
            service: route.service,
            upstream: route.upstream.clone(),
            reason: e.to_string(),
        }
    }
}
