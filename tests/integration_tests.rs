use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use eshop_gateway::{filters, AppState, GatewayConfig};
use hyper::header::{HeaderValue, SET_COOKIE};
use hyper::{HeaderMap, Method, StatusCode};
use serde_json::{json, Value};
use warp::path::FullPath;
use warp::reply::Response;
use warp::{Filter, Reply};

const UPSTREAM_VARS: &[&str] = &[
    "AUTH_SERVICE_URL",
    "CATALOGUE_SERVICE_URL",
    "NOTIFICATION_SERVICE_URL",
    "PAYMENT_SERVICE_URL",
    "REVIEW_SERVICE_URL",
    "INVENTORY_SERVICE_URL",
    "MESSAGING_SERVICE_URL",
    "CHECKOUT_SERVICE_URL",
    "ORDER_SERVICE_URL",
    "CUSTOMER_SERVICE_URL",
    "AI_SEARCH_URL",
];

const PREVIEW_ORIGIN: &str = "https://preview123.eshop-seperated.vercel.app";

/// Upstream that echoes what it received and sets two cookies.
async fn spawn_echo_upstream() -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    let echo = warp::method()
        .and(warp::path::full())
        .and(warp::query::raw().or(warp::any().map(String::new)).unify())
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .map(
            move |method: Method, path: FullPath, query: String, headers: HeaderMap, body: Bytes| {
                counter.fetch_add(1, Ordering::SeqCst);
                let header = |name: &str| {
                    headers
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string()
                };
                let mut response = warp::reply::json(&json!({
                    "method": method.as_str(),
                    "path": path.as_str(),
                    "query": query,
                    "cookie": header("cookie"),
                    "host": header("host"),
                    "body": String::from_utf8_lossy(&body),
                }))
                .into_response();
                let headers = response.headers_mut();
                headers.append(SET_COOKIE, HeaderValue::from_static("access=1; Path=/; HttpOnly"));
                headers.append(SET_COOKIE, HeaderValue::from_static("refresh=2; Path=/; HttpOnly"));
                response
            },
        );

    let (addr, server) = warp::serve(echo).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (format!("http://{}", addr), hits)
}

async fn spawn_slow_upstream(delay: Duration) -> String {
    let slow = warp::any().and_then(move || async move {
        tokio::time::sleep(delay).await;
        Ok::<_, Infallible>("late")
    });
    let (addr, server) = warp::serve(slow).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    format!("http://{}", addr)
}

fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn config_for(upstream: &str) -> GatewayConfig {
    let env: HashMap<String, String> = UPSTREAM_VARS
        .iter()
        .map(|key| (key.to_string(), upstream.to_string()))
        .collect();
    GatewayConfig::from_lookup(|key| env.get(key).cloned()).unwrap()
}

fn gateway(
    config: GatewayConfig,
) -> impl Filter<Extract = (Response,), Error = Infallible> + Clone + 'static {
    filters::gateway(AppState::new(config).unwrap())
}

fn body_json(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let (upstream, hits) = spawn_echo_upstream().await;
    let api = gateway(config_for(&upstream));

    let resp = warp::test::request()
        .method("GET")
        .path("/gateway-health")
        .reply(&api)
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp.body())["message"], "Welcome to api-gateway!");
    assert!(resp.headers().get("ratelimit-limit").is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_health_check_still_applies_cors() {
    let (upstream, _) = spawn_echo_upstream().await;
    let api = gateway(config_for(&upstream));

    let resp = warp::test::request()
        .path("/gateway-health")
        .header("origin", "https://attacker.example.com")
        .reply(&api)
        .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_cookie_is_forwarded_and_set_cookies_relayed() {
    let (upstream, hits) = spawn_echo_upstream().await;
    let api = gateway(config_for(&upstream));

    let resp = warp::test::request()
        .method("POST")
        .path("/payments/charge")
        .header("cookie", "session=abc")
        .header("content-type", "application/json")
        .body(r#"{"amount":42}"#)
        .reply(&api)
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
    let cookies: Vec<_> = resp.headers().get_all(SET_COOKIE).iter().collect();
    assert_eq!(cookies, vec!["access=1; Path=/; HttpOnly", "refresh=2; Path=/; HttpOnly"]);
    assert_eq!(resp.headers().get("ratelimit-limit").unwrap(), "100");
    assert_eq!(resp.headers().get("ratelimit-remaining").unwrap(), "99");

    let echoed = body_json(resp.body());
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["path"], "/payments/charge");
    assert_eq!(echoed["cookie"], "session=abc");
    assert_eq!(echoed["body"], r#"{"amount":42}"#);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_catalogue_rewrite_keeps_query() {
    let (upstream, _) = spawn_echo_upstream().await;
    let api = gateway(config_for(&upstream));

    for path in ["/catalogue/abc123?fields=name", "/catalogue/products/abc123?fields=name"] {
        let resp = warp::test::request().path(path).reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let echoed = body_json(resp.body());
        assert_eq!(echoed["path"], "/products/abc123");
        assert_eq!(echoed["query"], "fields=name");
    }
}

#[tokio::test]
async fn test_profiles_and_api_routes() {
    let (upstream, _) = spawn_echo_upstream().await;
    let api = gateway(config_for(&upstream));

    let resp = warp::test::request().path("/profiles/42").reply(&api).await;
    assert_eq!(body_json(resp.body())["path"], "/api/profiles/42");

    let resp = warp::test::request().path("/api/users/me").reply(&api).await;
    assert_eq!(body_json(resp.body())["path"], "/api/users/me");
}

#[tokio::test]
async fn test_host_header_handling() {
    let (upstream, _) = spawn_echo_upstream().await;
    let upstream_host = upstream.trim_start_matches("http://").to_string();
    let api = gateway(config_for(&upstream));

    let resp = warp::test::request()
        .path("/auth/login")
        .header("host", "shop.example.com")
        .reply(&api)
        .await;
    let echoed = body_json(resp.body());
    assert_eq!(echoed["path"], "/login");
    assert_eq!(echoed["host"], "shop.example.com");

    let resp = warp::test::request()
        .path("/orders/7")
        .header("host", "shop.example.com")
        .reply(&api)
        .await;
    assert_eq!(body_json(resp.body())["host"], upstream_host.as_str());
}

#[tokio::test]
async fn test_unknown_route_is_not_forwarded() {
    let (upstream, hits) = spawn_echo_upstream().await;
    let api = gateway(config_for(&upstream));

    let resp = warp::test::request()
        .path("/unknown-service/x")
        .reply(&api)
        .await;

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(resp.body())["error"], "route_not_found");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_denied_origin_is_not_forwarded() {
    let (upstream, hits) = spawn_echo_upstream().await;
    let api = gateway(config_for(&upstream));

    let resp = warp::test::request()
        .path("/orders/1")
        .header("origin", "https://evil-eshop-seperated.vercel.app.attacker.com")
        .reply(&api)
        .await;

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(resp.headers().get("access-control-allow-origin").is_none());
    assert_eq!(body_json(resp.body())["error"], "admission_denied");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_allowed_origin_gets_cors_headers() {
    let (upstream, _) = spawn_echo_upstream().await;
    let api = gateway(config_for(&upstream));

    let resp = warp::test::request()
        .path("/reviews/p1")
        .header("origin", PREVIEW_ORIGIN)
        .reply(&api)
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
    let headers = resp.headers();
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), PREVIEW_ORIGIN);
    assert_eq!(headers.get("access-control-allow-credentials").unwrap(), "true");
    assert_eq!(headers.get("access-control-expose-headers").unwrap(), "Set-Cookie");
    assert_eq!(headers.get_all(SET_COOKIE).iter().count(), 2);
}

#[tokio::test]
async fn test_errors_after_admission_carry_cors_headers() {
    let (upstream, _) = spawn_echo_upstream().await;
    let api = gateway(config_for(&upstream));

    let resp = warp::test::request()
        .path("/nowhere")
        .header("origin", "http://localhost:3000")
        .reply(&api)
        .await;

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        resp.headers().get("access-control-allow-origin").unwrap(),
        "http://localhost:3000"
    );
}

#[tokio::test]
async fn test_preflight_is_answered_by_gateway() {
    let (upstream, hits) = spawn_echo_upstream().await;
    let api = gateway(config_for(&upstream));

    let resp = warp::test::request()
        .method("OPTIONS")
        .path("/orders")
        .header("origin", "http://localhost:3000")
        .header("access-control-request-method", "POST")
        .reply(&api)
        .await;

    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let headers = resp.headers();
    assert_eq!(
        headers.get("access-control-allow-methods").unwrap(),
        "GET, POST, PUT, PATCH, DELETE, OPTIONS"
    );
    assert_eq!(
        headers.get("access-control-allow-headers").unwrap(),
        "Content-Type, Authorization, X-Requested-With"
    );
    assert_eq!(headers.get("access-control-max-age").unwrap(), "86400");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rate_limiting() {
    let (upstream, hits) = spawn_echo_upstream().await;
    let mut config = config_for(&upstream);
    config.rate_limit.anonymous_max = 3;
    let api = gateway(config);

    for _ in 0..3 {
        let resp = warp::test::request().path("/inventory/sku").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = warp::test::request().path("/inventory/sku").reply(&api).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers().get("ratelimit-limit").unwrap(), "3");
    assert_eq!(resp.headers().get("ratelimit-remaining").unwrap(), "0");
    assert!(resp.headers().get("ratelimit-reset").is_some());
    assert!(resp.headers().get("x-ratelimit-limit").is_none());
    assert_eq!(
        body_json(resp.body())["message"],
        "Too many requests, please try again later."
    );
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_rate_limit_is_per_client_ip() {
    let (upstream, _) = spawn_echo_upstream().await;
    let mut config = config_for(&upstream);
    config.rate_limit.anonymous_max = 1;
    let api = gateway(config);

    let first: SocketAddr = "192.0.2.1:40000".parse().unwrap();
    let second: SocketAddr = "192.0.2.2:40000".parse().unwrap();

    let resp = warp::test::request().path("/orders").remote_addr(first).reply(&api).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = warp::test::request().path("/orders").remote_addr(first).reply(&api).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let resp = warp::test::request().path("/orders").remote_addr(second).reply(&api).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_authenticated_principal_gets_higher_ceiling() {
    let (upstream, _) = spawn_echo_upstream().await;
    let mut config = config_for(&upstream);
    config.rate_limit.anonymous_max = 1;
    config.rate_limit.authenticated_max = 2;
    config
        .service_tokens
        .insert("storefront-token".to_string(), "storefront".to_string());
    let api = gateway(config);

    for _ in 0..2 {
        let resp = warp::test::request()
            .path("/messages/t1")
            .header("authorization", "Bearer storefront-token")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("ratelimit-limit").unwrap(), "2");
    }

    let resp = warp::test::request()
        .path("/messages/t1")
        .header("authorization", "Bearer storefront-token")
        .reply(&api)
        .await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_body_too_large() {
    let (upstream, hits) = spawn_echo_upstream().await;
    let mut config = config_for(&upstream);
    config.max_body_bytes = 8;
    let api = gateway(config);

    let resp = warp::test::request()
        .method("POST")
        .path("/orders")
        .body("0123456789abcdef")
        .reply(&api)
        .await;

    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_json(resp.body())["error"], "body_too_large");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unreachable_upstream() {
    let api = gateway(config_for(&closed_port_url()));

    let resp = warp::test::request().path("/cart/xyz").reply(&api).await;

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(resp.body())["error"], "upstream_unreachable");
}

#[tokio::test]
async fn test_upstream_timeout() {
    let upstream = spawn_slow_upstream(Duration::from_secs(2)).await;
    let mut config = config_for(&upstream);
    config.upstream_timeout = Duration::from_millis(200);
    let api = gateway(config);

    let resp = warp::test::request().path("/wishlist/xyz").reply(&api).await;

    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body_json(resp.body())["error"], "upstream_timeout");
}

#[tokio::test]
async fn test_failed_upstream_does_not_affect_other_routes() {
    let (upstream, _) = spawn_echo_upstream().await;
    let mut config = config_for(&upstream);
    config.routes = eshop_gateway::RouteTable::new(vec![
        eshop_gateway::Route::new(
            "/orders",
            "order",
            closed_port_url(),
            eshop_gateway::PathRewrite::Prepend("/orders".into()),
        ),
        eshop_gateway::Route::new(
            "/cart",
            "checkout",
            upstream.clone(),
            eshop_gateway::PathRewrite::Prepend("/cart".into()),
        ),
    ])
    .unwrap();
    let api = gateway(config);

    let failed = warp::test::request().path("/orders/1").reply(&api);
    let ok = warp::test::request().path("/cart/1").reply(&api);
    let (failed, ok) = tokio::join!(failed, ok);

    assert_eq!(failed.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(ok.status(), StatusCode::OK);
    assert_eq!(body_json(ok.body())["path"], "/cart/1");
}
