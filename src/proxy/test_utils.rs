//! Test utilities for proxy module testing
//!
//! Provides an in-process mock upstream bound to an ephemeral port, test
//! configurations and small helpers for reading axum responses.

#[cfg(test)]
pub mod test_helpers {
    use crate::proxy::types::ProxyConfig;
    use axum::body::Body;
    use axum::extract::{Path, Request, State};
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{any, get};
    use axum::Router;
    use futures_util::StreamExt;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Create a test proxy configuration with sensible defaults
    pub fn test_proxy_config() -> ProxyConfig {
        ProxyConfig {
            request_timeout: Duration::from_secs(5),
            max_request_size: 1024 * 1024,
            ..ProxyConfig::default()
        }
    }

    /// Handle on a running mock upstream
    pub struct MockUpstream {
        pub addr: SocketAddr,
        hits: Arc<AtomicUsize>,
    }

    impl MockUpstream {
        pub fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }

        /// Number of requests served by `/count` and `/slow-count`
        pub fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    async fn count_handler(State(hits): State<Arc<AtomicUsize>>) -> String {
        let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
        format!("count={n}")
    }

    async fn json_handler() -> Response {
        let mut headers = HeaderMap::new();
        headers.insert("x-upstream", "mock".parse().unwrap());
        headers.insert("proxy-authenticate", "Basic".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        (headers, r#"{"ok":true}"#).into_response()
    }

    /// Echo the method, headers and body back as JSON
    async fn echo_handler(request: Request) -> Result<impl IntoResponse, StatusCode> {
        let (parts, body) = request.into_parts();
        let body_bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|_| StatusCode::BAD_REQUEST)?;

        let response_body = serde_json::json!({
            "method": parts.method.to_string(),
            "headers": parts.headers.iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("<binary>").to_string()))
                .collect::<std::collections::BTreeMap<_, _>>(),
            "body": String::from_utf8_lossy(&body_bytes),
        });

        Ok((StatusCode::OK, axum::Json(response_body)))
    }

    async fn status_handler(Path(code): Path<u16>) -> impl IntoResponse {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::OK);
        (status, "Status response")
    }

    async fn redirect_handler(Path(remaining): Path<u32>) -> Response {
        if remaining == 0 {
            "redirect chain done".into_response()
        } else {
            let location = format!("/redirect/{}", remaining - 1);
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
    }

    async fn slow_handler() -> &'static str {
        tokio::time::sleep(Duration::from_secs(2)).await;
        "Slow response"
    }

    async fn stream_handler() -> Response {
        let parts = ["alpha\n", "beta\n", "gamma\n"];
        let chunks = futures_util::stream::iter(parts).then(|part| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, std::io::Error>(bytes::Bytes::from_static(part.as_bytes()))
        });
        Body::from_stream(chunks).into_response()
    }

    /// One chunk, then nothing until the client gives up
    async fn stall_handler() -> Response {
        let first = futures_util::stream::once(async {
            Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"partial\n"))
        });
        Body::from_stream(first.chain(futures_util::stream::pending())).into_response()
    }

    /// "café" with the two bytes of the é in separate chunks
    async fn split_utf8_handler() -> Response {
        let parts: [&'static [u8]; 2] = [b"caf\xC3", b"\xA9"];
        let chunks = futures_util::stream::iter(parts).then(|part| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, std::io::Error>(bytes::Bytes::from_static(part))
        });
        Body::from_stream(chunks).into_response()
    }

    /// Like `/count`, but takes a moment to answer
    async fn slow_count_handler(State(hits): State<Arc<AtomicUsize>>) -> String {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
        format!("count={n}")
    }

    /// Start the mock upstream on an ephemeral port
    pub async fn spawn_upstream() -> MockUpstream {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/json", get(json_handler))
            .route("/count", get(count_handler))
            .route("/echo", any(echo_handler))
            .route("/status/{code}", get(status_handler))
            .route("/redirect/{remaining}", get(redirect_handler))
            .route("/slow", get(slow_handler))
            .route("/stream", get(stream_handler))
            .route("/stall", get(stall_handler))
            .route("/split-utf8", get(split_utf8_handler))
            .route("/slow-count", get(slow_count_handler))
            .with_state(hits.clone());

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("bind mock upstream");
        let addr = listener.local_addr().expect("mock upstream address");

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockUpstream { addr, hits }
    }

    /// Collect a response body as JSON
    pub async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
