//! Integration tests for end-to-end proxy flow through the full middleware stack

use crate::identity::TokenIdentityResolver;
use crate::metrics::MetricsCollector;
use crate::proxy::cache::CacheStore;
use crate::proxy::forwarding::ForwardingEngine;
use crate::proxy::headers::{content_types, X_API_KEY, X_REQUEST_ID};
use crate::proxy::middleware_stack::MiddlewareStack;
use crate::proxy::service::{Maintainer, ProxyService, CONNECTION_ID_HEADER};
use crate::proxy::test_utils::test_helpers::{body_json, spawn_upstream, test_proxy_config};
use crate::proxy::types::PROXY_TIME_HEADER;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const SERVICE_KEY: &str = "svc-key";

fn proxy_router() -> Router {
    let config = test_proxy_config();
    let cache = Arc::new(CacheStore::from_config(&config));
    let engine =
        Arc::new(ForwardingEngine::new(config, cache, Arc::new(MetricsCollector::new())).unwrap());
    let maintainer = Maintainer {
        email: "ops@example.com".to_string(),
        website: "https://example.com".to_string(),
    };
    let identity = Arc::new(TokenIdentityResolver::new(
        Vec::<(String, String)>::new(),
        vec![SERVICE_KEY.to_string()],
    ));

    MiddlewareStack::new(identity).apply_to_router(ProxyService::new(engine, maintainer).into_router())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_buffered_forward_and_cache_hit() {
    let upstream = spawn_upstream().await;
    let router = proxy_router();
    let request = json!({ "url": upstream.url("/json") });

    let response = router
        .clone()
        .oneshot(post_json("/proxy", request.clone()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(PROXY_TIME_HEADER));
    assert!(response.headers().contains_key(X_REQUEST_ID));
    let body = body_json(response).await;
    assert_eq!(body["status"], 200);
    assert_eq!(body["statusText"], "OK");
    assert_eq!(body["body"], r#"{"ok":true}"#);
    assert_eq!(body["headers"]["x-upstream"], "mock");
    assert!(body["headers"].get("proxy-authenticate").is_none());
    assert_eq!(body["cached"], false);

    let body = body_json(router.oneshot(post_json("/proxy", request)).await.unwrap()).await;
    assert_eq!(body["cached"], true);
    assert_eq!(body["body"], r#"{"ok":true}"#);
}

#[tokio::test]
async fn test_missing_url_is_400_with_request_id() {
    let response = proxy_router()
        .oneshot(post_json("/proxy", json!({ "method": "GET" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let request_id = response.headers()[X_REQUEST_ID].to_str().unwrap().to_string();
    let body = body_json(response).await;
    assert_eq!(body["error"], "Missing URL parameter");
    assert_eq!(body["requestId"], request_id);
}

#[tokio::test]
async fn test_malformed_body_is_400() {
    let request = Request::post("/proxy")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = proxy_router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_unsupported_scheme_is_400() {
    let response = proxy_router()
        .oneshot(post_json("/proxy", json!({ "url": "ftp://example.com/file" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_TARGET_URL");
}

#[tokio::test]
async fn test_upstream_timeout_is_504() {
    let upstream = spawn_upstream().await;
    let response = proxy_router()
        .oneshot(post_json(
            "/proxy",
            json!({ "url": upstream.url("/slow"), "timeout": 0.2 }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body_json(response).await["code"], "UPSTREAM_TIMEOUT");
}

#[tokio::test]
async fn test_timeout_out_of_range_is_400() {
    let upstream = spawn_upstream().await;
    let router = proxy_router();

    for timeout in [json!(1e30), json!(f64::MAX), json!(-5), json!(0), json!(86_401)] {
        let response = router
            .clone()
            .oneshot(post_json(
                "/proxy",
                json!({ "url": upstream.url("/json"), "timeout": timeout }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "timeout {timeout}");
        assert_eq!(body_json(response).await["code"], "INVALID_REQUEST");
    }

    // The stream endpoint validates the same way
    let response = router
        .oneshot(post_json(
            "/proxy/stream",
            json!({ "url": upstream.url("/stream"), "timeout": 1e30 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_concurrent_identical_gets_hit_upstream_once() {
    let upstream = spawn_upstream().await;
    let router = proxy_router();
    let request = json!({ "url": upstream.url("/slow-count") });

    let (a, b) = tokio::join!(
        router.clone().oneshot(post_json("/proxy", request.clone())),
        router.clone().oneshot(post_json("/proxy", request)),
    );
    let a = body_json(a.unwrap()).await;
    let b = body_json(b.unwrap()).await;

    assert_eq!(upstream.hits(), 1);
    assert_eq!(a["body"], "count=1");
    assert_eq!(b["body"], "count=1");
    assert_ne!(a["cached"], b["cached"]);
}

#[tokio::test]
async fn test_cache_endpoints_require_service_key() {
    let router = proxy_router();

    let denied = router
        .clone()
        .oneshot(Request::get("/proxy/cache/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let denied = router
        .clone()
        .oneshot(Request::post("/proxy/cache/clear").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let upstream = spawn_upstream().await;
    router
        .clone()
        .oneshot(post_json("/proxy", json!({ "url": upstream.url("/count") })))
        .await
        .unwrap();

    let stats = router
        .clone()
        .oneshot(
            Request::get("/proxy/cache/stats")
                .header(X_API_KEY, SERVICE_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(stats.status(), StatusCode::OK);
    assert_eq!(body_json(stats).await["stats"]["size"], 1);

    let cleared = router
        .oneshot(
            Request::post("/proxy/cache/clear")
                .header(X_API_KEY, SERVICE_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(cleared).await["cleared"], 1);
}

#[tokio::test]
async fn test_info_endpoints_advertise_versions() {
    let router = proxy_router();

    for (path, versions) in [
        ("/proxy", json!(["v1", "v2"])),
        ("/proxy/", json!(["v1", "v2"])),
        ("/proxy/v2", json!(["v2"])),
        ("/proxy/v2/", json!(["v2"])),
    ] {
        let response = router
            .clone()
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{path}");
        let body = body_json(response).await;
        assert_eq!(body["versions"], versions, "{path}");
        assert_eq!(body["language"], "Rust");
        assert_eq!(body["maintainer"]["email"], "ops@example.com");
        assert_eq!(body["project"]["name"], "bare_gateway");
        assert!(body["metrics"]["total_requests"].is_number());
    }
}

#[tokio::test]
async fn test_stream_endpoint_emits_ndjson_frames() {
    let upstream = spawn_upstream().await;
    let response = proxy_router()
        .oneshot(post_json("/proxy/stream", json!({ "url": upstream.url("/stream") })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], content_types::NDJSON);
    assert!(response.headers().contains_key(CONNECTION_ID_HEADER));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let frames: Vec<Value> = String::from_utf8(bytes.to_vec())
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(frames.first().unwrap()["type"], "headers");
    assert_eq!(frames.first().unwrap()["status"], 200);
    assert_eq!(frames.last().unwrap()["type"], "end");
    let data: String = frames
        .iter()
        .filter(|frame| frame["type"] == "chunk")
        .map(|frame| frame["data"].as_str().unwrap())
        .collect();
    assert_eq!(data, "alpha\nbeta\ngamma\n");
}
