use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Stream, TryStreamExt};
use http::Uri;
use hyper::{
    header::{self, HeaderName, HeaderValue},
    HeaderMap,
};
use warp::{reply::Response, Filter, Rejection};

use crate::errors::GatewayError;
use crate::models::AppState;


pub const ALLOWED_HEADERS: &str = "Content-Type, Authorization, X-Requested-With";
pub const ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
pub const PREFLIGHT_MAX_AGE_SECS: &str = "86400";

/// Origin allow-list with the `host[:port]` of every parseable entry precomputed.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    exact: Vec<String>,
    hosts: Vec<String>,
}

impl OriginPolicy {
    pub fn new(allowed: &[String]) -> Self {
        let hosts = allowed
            .iter()
            .filter_map(|entry| {
                let key = entry.parse::<Uri>().ok().as_ref().and_then(host_key);
                if key.is_none() {
                    tracing::warn!(origin = %entry, "allowed origin has no host, only exact matches apply");
                }
                key
            })
            .collect();

        Self {
            exact: allowed.to_vec(),
            hosts,
        }
    }

    /// Decides whether `origin` may talk to the gateway.
    ///
    /// Requests without an `Origin` header carry no sender identity and are
    /// always admitted. Otherwise the origin must equal an allowed entry, or
    /// end with an allowed `host[:port]` at a label boundary, which admits subdomains
    /// such as preview deployments but not look-alike hosts.
    pub fn admit(&self, origin: Option<&str>) -> Result<Admission, GatewayError> {
        let origin = match origin {
            None => return Ok(Admission { origin: None }),
            Some(origin) => origin,
        };

        if self.exact.iter().any(|allowed| allowed == origin) || self.matches_host(origin) {
            let value = HeaderValue::from_str(origin)
                .map_err(|_| GatewayError::AdmissionDenied(origin.to_string()))?;
            return Ok(Admission { origin: Some(value) });
        }

        Err(GatewayError::AdmissionDenied(origin.to_string()))
    }

    fn matches_host(&self, origin: &str) -> bool {
        let origin = origin.to_ascii_lowercase();
        self.hosts.iter().any(|host| {
            origin
                .strip_suffix(host.as_str())
                .map(|head| head.ends_with('.') || head.ends_with("//"))
                .unwrap_or(false)
        })
    }
}

/// Lowercased `host[:port]` of an allowed entry. The port stays part of the
/// key, so `http://localhost:3000` never admits `http://localhost`.
fn host_key(uri: &Uri) -> Option<String> {
    let host = uri.host()?.to_ascii_lowercase();
    Some(match uri.port_u16() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

/// An admitted request. Carries the origin to echo back, if any.
#[derive(Debug, Clone, Default)]
pub struct Admission {
    pub origin: Option<HeaderValue>,
}

impl Admission {
    pub fn decorate(&self, mut response: Response) -> Response {
        if let Some(origin) = &self.origin {
            add_cors_headers(response.headers_mut(), origin);
        }
        response
    }
}

pub fn add_cors_headers(headers: &mut HeaderMap, origin: &HeaderValue) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    headers.append(header::VARY, HeaderValue::from_static("Origin"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Set-Cookie"),
    );
}

pub fn add_preflight_headers(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static("access-control-max-age"),
        HeaderValue::from_static(PREFLIGHT_MAX_AGE_SECS),
    );
}

/// Admits or rejects the request by its `Origin` header.
pub fn admission(state: Arc<AppState>) -> impl Filter<Extract = (Admission,), Error = Rejection> + Clone {
    warp::header::optional::<String>("origin").and_then(move |origin: Option<String>| {
        let state = state.clone();
        async move {
            state.origins.admit(origin.as_deref()).map_err(|e| {
                tracing::warn!(error = %e, "rejected cross-origin request");
                warp::reject::custom(e)
            })
        }
    })
}

/// Rejects requests whose declared `Content-Length` exceeds `limit` without
/// reading the body.
pub fn content_length_guard(limit: u64) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<u64>("content-length")
        .and_then(move |length: Option<u64>| async move {
            match length {
                Some(length) if length > limit => Err(warp::reject::custom(GatewayError::BodyTooLarge { limit })),
                _ => Ok(()),
            }
        })
        .untuple_one()
}

/// Collects the request body, failing once more than `limit` bytes arrive.
/// Covers chunked bodies that declare no length; declared lengths are
/// rejected earlier by [`content_length_guard`].
pub fn limited_body(limit: u64) -> impl Filter<Extract = (Bytes,), Error = Rejection> + Clone {
    warp::body::stream()
        .and(warp::any().map(move || limit))
        .and_then(collect_body)
}

pub async fn collect_body<S, B>(stream: S, limit: u64) -> Result<Bytes, Rejection>
where
    S: Stream<Item = Result<B, warp::Error>>,
    B: Buf,
{
    futures::pin_mut!(stream);
    let mut body = BytesMut::new();
    while let Some(chunk) = stream
        .try_next()
        .await
        .map_err(|e| warp::reject::custom(GatewayError::Http(e.to_string())))?
    {
        if (body.len() + chunk.remaining()) as u64 > limit {
            return Err(warp::reject::custom(GatewayError::BodyTooLarge { limit }));
        }
        body.put(chunk);
    }
    Ok(body.freeze())
}
