//! Outbound forwarding for the bare proxy
//!
//! [`ForwardingEngine`] dispatches validated [`OutboundRequest`]s either
//! buffered (whole body collected, optionally cached) or as a streaming relay
//! of NDJSON frames.

use crate::metrics::MetricsCollector;
use crate::proxy::cache::{derive_cache_key, should_cache, CacheEntry, CacheStore};
use crate::proxy::headers::{filter_response_headers, is_hop_by_hop};
use crate::proxy::streaming::{
    relay_frames, ConnectionRegistry, RelayStream, StreamFrame, SHUTDOWN_MESSAGE,
};
use crate::proxy::types::{
    CacheKey, OutboundRequest, ProxyConfig, ProxyError, ProxyResponse, ProxyResult,
};
use chrono::Utc;
use futures_util::StreamExt;
use http::{HeaderName, HeaderValue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Request headers the HTTP client manages itself
const CLIENT_MANAGED_HEADERS: [&str; 2] = ["host", "content-length"];

/// Buffered and streaming dispatcher with cache and metrics integration
pub struct ForwardingEngine {
    config: Arc<ProxyConfig>,
    following: reqwest::Client,
    direct: reqwest::Client,
    cache: Arc<CacheStore>,
    fills: FillTable,
    connections: ConnectionRegistry,
    metrics: Arc<MetricsCollector>,
}

impl ForwardingEngine {
    /// Build the engine and its two outbound clients.
    ///
    /// One client follows up to `max_redirects` redirects, the other never
    /// follows them; each request picks one through `follow_redirects`.
    pub fn new(
        config: ProxyConfig,
        cache: Arc<CacheStore>,
        metrics: Arc<MetricsCollector>,
    ) -> ProxyResult<Self> {
        let user_agent = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

        let following = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| ProxyError::Internal(format!("HTTP client construction failed: {e}")))?;
        let direct = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Internal(format!("HTTP client construction failed: {e}")))?;

        Ok(Self {
            config: Arc::new(config),
            following,
            direct,
            cache,
            fills: FillTable::default(),
            connections: ConnectionRegistry::new(),
            metrics,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Dispatch `request` and collect the whole upstream response
    pub async fn forward(&self, request: OutboundRequest) -> ProxyResult<ProxyResponse> {
        let started = Instant::now();
        self.metrics.record_request();

        let result = self.forward_buffered(request).await;
        match &result {
            Ok(_) => self.metrics.record_success(started.elapsed()),
            Err(e) => {
                warn!(error = %e, "Buffered forward failed");
                self.metrics.record_failure(started.elapsed());
            }
        }
        result
    }

    async fn forward_buffered(&self, request: OutboundRequest) -> ProxyResult<ProxyResponse> {
        let Some(key) = should_cache(&self.config, &request).then(|| derive_cache_key(&request))
        else {
            return self.fetch(&request, None).await;
        };

        if let Some(hit) = self.cached_response(&key, &request) {
            return Ok(hit);
        }

        // One upstream fetch per key at a time; later callers wait for the
        // fill and are answered from the cache
        let fill = self.fills.join(&key);
        let _turn = fill.lock.lock().await;
        if let Some(hit) = self.cached_response(&key, &request) {
            return Ok(hit);
        }
        self.fetch(&request, Some(key)).await
    }

    fn cached_response(&self, key: &CacheKey, request: &OutboundRequest) -> Option<ProxyResponse> {
        let entry = self.cache.get(key)?;
        debug!(cache_key = %key, url = %request.url, "Serving cached response");
        self.metrics.record_cache_hit();
        Some(ProxyResponse {
            status: entry.status,
            status_text: entry.status_text,
            headers: entry.headers,
            body: String::from_utf8_lossy(&entry.body).into_owned(),
            timestamp: Utc::now(),
            cached: true,
        })
    }

    async fn fetch(
        &self,
        request: &OutboundRequest,
        cache_key: Option<CacheKey>,
    ) -> ProxyResult<ProxyResponse> {
        let builder = self.build_request(request)?.timeout(request.timeout);
        let response = builder
            .send()
            .await
            .map_err(|e| ProxyError::from_transport(e, request.timeout))?;

        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or_default().to_string();
        let headers = filter_response_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::from_transport(e, request.timeout))?;

        debug!(
            url = %request.url,
            method = %request.method,
            status = status.as_u16(),
            body_bytes = body.len(),
            "Upstream responded"
        );

        if let Some(key) = cache_key {
            let stored = self.cache.put(
                key.clone(),
                CacheEntry {
                    key,
                    status: status.as_u16(),
                    status_text: status_text.clone(),
                    headers: headers.clone(),
                    body: body.clone(),
                    stored_at: Instant::now(),
                },
            );
            debug!(stored, "Cache fill attempted");
        }

        Ok(ProxyResponse {
            status: status.as_u16(),
            status_text,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
            timestamp: Utc::now(),
            cached: false,
        })
    }

    /// Dispatch `request` and relay the response as frames.
    ///
    /// Returns once upstream headers arrived or the request failed; failures
    /// at that point become a single `error` frame. Only malformed request
    /// headers are reported as an `Err`. The outcome is recorded when the
    /// relay reaches its terminal frame; a relay dropped by the client
    /// records neither.
    pub async fn stream(&self, request: OutboundRequest) -> ProxyResult<RelayStream> {
        let builder = self.build_request(&request)?;
        let started = Instant::now();
        self.metrics.record_request();

        let (guard, mut cancelled) = self.connections.register(request.url.to_string());
        let timeout = request.timeout;

        let sent = tokio::select! {
            biased;
            _ = &mut cancelled => return Ok(RelayStream::failed(guard, SHUTDOWN_MESSAGE)),
            sent = tokio::time::timeout(timeout, builder.send()) => sent,
        };

        let response = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let error = ProxyError::from_transport(e, timeout);
                warn!(connection_id = %guard.id(), error = %error, "Streaming request failed");
                self.metrics.record_failure(started.elapsed());
                return Ok(RelayStream::failed(guard, error.to_string()));
            }
            Err(_) => {
                let error = ProxyError::UpstreamTimeout(timeout);
                warn!(connection_id = %guard.id(), error = %error, "Streaming request timed out");
                self.metrics.record_failure(started.elapsed());
                return Ok(RelayStream::failed(guard, error.to_string()));
            }
        };

        let status = response.status();
        let head = StreamFrame::Headers {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: filter_response_headers(response.headers()),
        };

        let connection_id = guard.id();
        let chunks = response.bytes_stream().boxed();
        let metrics = self.metrics.clone();
        let frames = relay_frames(head, chunks, guard, cancelled, timeout)
            .inspect(move |frame| match frame {
                StreamFrame::End => metrics.record_success(started.elapsed()),
                StreamFrame::Error { error } => {
                    warn!(connection_id = %connection_id, error = %error, "Streaming relay failed");
                    metrics.record_failure(started.elapsed());
                }
                _ => {}
            })
            .boxed();

        Ok(RelayStream {
            connection_id,
            frames,
        })
    }

    fn build_request(&self, request: &OutboundRequest) -> ProxyResult<reqwest::RequestBuilder> {
        let client = if request.follow_redirects {
            &self.following
        } else {
            &self.direct
        };
        let mut builder = client.request(request.method.clone(), request.url.to_string());

        for (name, value) in &request.headers {
            if is_hop_by_hop(name)
                || CLIENT_MANAGED_HEADERS
                    .iter()
                    .any(|managed| managed.eq_ignore_ascii_case(name))
            {
                continue;
            }
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ProxyError::InvalidRequest(format!("Invalid header name: {name}")))?;
            let header_value = HeaderValue::from_str(value).map_err(|_| {
                ProxyError::InvalidRequest(format!("Invalid value for header {name}"))
            })?;
            builder = builder.header(header_name, header_value);
        }

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }
}

/// Per-key locks serializing cache fills
#[derive(Default)]
struct FillTable {
    locks: Arc<Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl FillTable {
    fn join(&self, key: &CacheKey) -> Fill {
        let lock = self
            .locks
            .lock()
            .entry(key.clone())
            .or_default()
            .clone();
        Fill {
            key: key.clone(),
            lock,
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// A caller's stake in a key's fill lock; the last one out removes the entry
struct Fill {
    key: CacheKey,
    lock: Arc<tokio::sync::Mutex<()>>,
    locks: Arc<Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Drop for Fill {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // The table's reference plus ours
        if Arc::strong_count(&self.lock) <= 2 {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::test_utils::test_helpers::{spawn_upstream, test_proxy_config};
    use crate::proxy::types::ProxyRequest;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn engine(config: ProxyConfig) -> ForwardingEngine {
        let cache = Arc::new(CacheStore::from_config(&config));
        ForwardingEngine::new(config, cache, Arc::new(MetricsCollector::new())).unwrap()
    }

    fn outbound(url: String, config: &ProxyConfig) -> OutboundRequest {
        OutboundRequest::from_wire(
            ProxyRequest {
                url: Some(url),
                ..ProxyRequest::default()
            },
            config,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_buffered_forward_filters_hop_by_hop_headers() {
        let upstream = spawn_upstream().await;
        let config = test_proxy_config();
        let engine = engine(config.clone());

        let response = engine
            .forward(outbound(upstream.url("/json"), &config))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.status_text, "OK");
        assert!(!response.cached);
        assert_eq!(response.headers.get("x-upstream").unwrap(), "mock");
        assert!(!response.headers.contains_key("proxy-authenticate"));
        assert!(response.body.contains("\"ok\":true"));
    }

    #[tokio::test]
    async fn test_second_get_is_served_from_cache() {
        let upstream = spawn_upstream().await;
        let config = test_proxy_config();
        let engine = engine(config.clone());

        let first = engine
            .forward(outbound(upstream.url("/count"), &config))
            .await
            .unwrap();
        let second = engine
            .forward(outbound(upstream.url("/count"), &config))
            .await
            .unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.body, second.body);
        assert_eq!(upstream.hits(), 1);
        assert_eq!(engine.metrics().snapshot().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_upstream_fetch() {
        let upstream = spawn_upstream().await;
        let config = test_proxy_config();
        let engine = engine(config.clone());

        let (a, b) = tokio::join!(
            engine.forward(outbound(upstream.url("/slow-count"), &config)),
            engine.forward(outbound(upstream.url("/slow-count"), &config)),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(upstream.hits(), 1);
        assert_eq!(a.body, "count=1");
        assert_eq!(b.body, "count=1");
        assert_eq!([a.cached, b.cached].iter().filter(|c| **c).count(), 1);
        assert_eq!(engine.fills.len(), 0);
    }

    #[tokio::test]
    async fn test_failed_fill_lets_the_next_caller_fetch() {
        let upstream = spawn_upstream().await;
        let config = test_proxy_config();
        let engine = engine(config.clone());

        let (a, b) = tokio::join!(
            engine.forward(outbound(upstream.url("/status/503"), &config)),
            engine.forward(outbound(upstream.url("/status/503"), &config)),
        );

        // Error statuses are never cached, so each waiter goes upstream itself
        assert_eq!(a.unwrap().status, 503);
        assert_eq!(b.unwrap().status, 503);
        assert!(engine.cache().is_empty());
        assert_eq!(engine.fills.len(), 0);
    }

    #[tokio::test]
    async fn test_cache_override_disables_caching() {
        let upstream = spawn_upstream().await;
        let config = test_proxy_config();
        let engine = engine(config.clone());

        for _ in 0..2 {
            let mut request = outbound(upstream.url("/count"), &config);
            request.cache = Some(false);
            let response = engine.forward(request).await.unwrap();
            assert!(!response.cached);
        }
        assert_eq!(upstream.hits(), 2);
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn test_post_is_never_cached() {
        let upstream = spawn_upstream().await;
        let config = test_proxy_config();
        let engine = engine(config.clone());

        let mut request = outbound(upstream.url("/echo"), &config);
        request.method = http::Method::POST;
        request.body = Some("payload".to_string());
        request.cache = Some(true);

        let response = engine.forward(request).await.unwrap();
        assert!(response.body.contains("payload"));
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn test_error_status_is_relayed_not_cached() {
        let upstream = spawn_upstream().await;
        let config = test_proxy_config();
        let engine = engine(config.clone());

        let response = engine
            .forward(outbound(upstream.url("/status/503"), &config))
            .await
            .unwrap();
        assert_eq!(response.status, 503);
        assert_eq!(response.status_text, "Service Unavailable");
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_maps_to_upstream_timeout() {
        let upstream = spawn_upstream().await;
        let config = test_proxy_config();
        let engine = engine(config.clone());

        let mut request = outbound(upstream.url("/slow"), &config);
        request.timeout = Duration::from_millis(50);

        let result = engine.forward(request).await;
        assert!(matches!(result, Err(ProxyError::UpstreamTimeout(_))));
        assert_eq!(engine.metrics().snapshot().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_redirects_follow_policy() {
        let upstream = spawn_upstream().await;
        let config = test_proxy_config();
        let engine = engine(config.clone());

        let followed = engine
            .forward(outbound(upstream.url("/redirect/2"), &config))
            .await
            .unwrap();
        assert_eq!(followed.status, 200);

        let mut direct = outbound(upstream.url("/redirect/2"), &config);
        direct.follow_redirects = false;
        let not_followed = engine.forward(direct).await.unwrap();
        assert_eq!(not_followed.status, 302);
    }

    #[tokio::test]
    async fn test_redirect_cap_is_transport_error() {
        let upstream = spawn_upstream().await;
        let mut config = test_proxy_config();
        config.max_redirects = 1;
        let engine = engine(config.clone());

        let result = engine
            .forward(outbound(upstream.url("/redirect/3"), &config))
            .await;
        assert!(matches!(result, Err(ProxyError::UpstreamTransport(_))));
    }

    #[tokio::test]
    async fn test_stream_relays_chunks_then_end() {
        let upstream = spawn_upstream().await;
        let config = test_proxy_config();
        let engine = engine(config.clone());

        let relay = engine
            .stream(outbound(upstream.url("/stream"), &config))
            .await
            .unwrap();
        assert!(engine.connections().contains(&relay.connection_id));

        let frames: Vec<StreamFrame> = relay.frames.collect().await;
        assert!(matches!(frames.first(), Some(StreamFrame::Headers { status: 200, .. })));
        assert_eq!(frames.last(), Some(&StreamFrame::End));

        let body: String = frames
            .iter()
            .filter_map(|frame| match frame {
                StreamFrame::Chunk { data } => Some(data.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(body, "alpha\nbeta\ngamma\n");
        assert!(engine.connections().is_empty());
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn test_stream_outcome_is_recorded_when_relay_ends() {
        let upstream = spawn_upstream().await;
        let config = test_proxy_config();
        let engine = engine(config.clone());

        let relay = engine
            .stream(outbound(upstream.url("/stream"), &config))
            .await
            .unwrap();
        assert_eq!(engine.metrics().snapshot().successful_requests, 0);

        let _frames: Vec<StreamFrame> = relay.frames.collect().await;
        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.successful_requests, 1);
        assert_eq!(snapshot.failed_requests, 0);
    }

    #[tokio::test]
    async fn test_stream_failing_mid_body_counts_as_failure() {
        let upstream = spawn_upstream().await;
        let config = test_proxy_config();
        let engine = engine(config.clone());

        let mut request = outbound(upstream.url("/stall"), &config);
        request.timeout = Duration::from_millis(200);
        let relay = engine.stream(request).await.unwrap();
        let frames: Vec<StreamFrame> = relay.frames.collect().await;

        assert!(matches!(frames.first(), Some(StreamFrame::Headers { status: 200, .. })));
        assert_eq!(frames[1], StreamFrame::chunk(b"partial\n"));
        assert!(matches!(frames.last(), Some(StreamFrame::Error { .. })));
        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.successful_requests, 0);
        assert_eq!(snapshot.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_stream_keeps_characters_split_across_chunks() {
        let upstream = spawn_upstream().await;
        let config = test_proxy_config();
        let engine = engine(config.clone());

        let relay = engine
            .stream(outbound(upstream.url("/split-utf8"), &config))
            .await
            .unwrap();
        let frames: Vec<StreamFrame> = relay.frames.collect().await;
        let body: String = frames
            .iter()
            .filter_map(|frame| match frame {
                StreamFrame::Chunk { data } => Some(data.as_str()),
                _ => None,
            })
            .collect();

        assert_eq!(body, "caf\u{e9}");
        assert_eq!(frames.last(), Some(&StreamFrame::End));
    }

    #[tokio::test]
    async fn test_stream_connection_failure_is_error_frame() {
        let config = test_proxy_config();
        let engine = engine(config.clone());

        let relay = engine
            .stream(outbound("http://127.0.0.1:1/".to_string(), &config))
            .await
            .unwrap();
        let frames: Vec<StreamFrame> = relay.frames.collect().await;

        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], StreamFrame::Error { .. }));
        assert!(engine.connections().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_header_name_is_rejected() {
        let config = test_proxy_config();
        let engine = engine(config.clone());
        let mut request = outbound("http://127.0.0.1:1/".to_string(), &config);
        request
            .headers
            .insert("bad header".to_string(), "value".to_string());

        assert!(matches!(
            engine.forward(request).await,
            Err(ProxyError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_cached_headers_round_trip_through_entry() {
        let headers: BTreeMap<String, String> =
            [("content-type".to_string(), "text/plain".to_string())].into();
        let config = test_proxy_config();
        let cache = CacheStore::from_config(&config);
        let request = outbound("https://example.com/a".to_string(), &config);
        let key = derive_cache_key(&request);
        cache.put(
            key.clone(),
            CacheEntry {
                key: key.clone(),
                status: 200,
                status_text: "OK".to_string(),
                headers: headers.clone(),
                body: bytes::Bytes::from_static(b"hi"),
                stored_at: Instant::now(),
            },
        );
        assert_eq!(cache.get(&key).unwrap().headers, headers);
    }
}
