//! HTTP surface of the bare proxy
//!
//! The `ProxyService` owns the [`ForwardingEngine`] and exposes it under
//! `/proxy`.
//!
//! ## Routes
//!
//! - `POST /proxy` buffered forward, JSON response
//! - `POST /proxy/stream` streamed forward, NDJSON frames
//! - `GET /proxy`, `/proxy/`, `/proxy/v2`, `/proxy/v2/` capability metadata
//! - `POST /proxy/cache/clear`, `GET /proxy/cache/stats` for service callers
//!
//! ```rust,ignore
//! let engine = Arc::new(ForwardingEngine::new(config, cache, metrics)?);
//! let router = ProxyService::new(engine, maintainer).into_router();
//! ```

use crate::identity::CallerIdentity;
use crate::proxy::error_response::ErrorResponseExt;
use crate::proxy::forwarding::ForwardingEngine;
use crate::proxy::headers::{content_types, CONTENT_TYPE};
use crate::proxy::types::{
    OutboundRequest, ProxyError, ProxyRequest, RequestId, PROXY_TIME_HEADER,
};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Header naming the streaming relay serving a response
pub const CONNECTION_ID_HEADER: &str = "x-connection-id";

/// Protocol versions advertised by `GET /proxy`
const ALL_VERSIONS: &[&str] = &["v1", "v2"];

/// Contact details advertised in capability metadata
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Maintainer {
    pub email: String,
    pub website: String,
}

/// Bare proxy endpoints backed by a shared forwarding engine
pub struct ProxyService {
    engine: Arc<ForwardingEngine>,
    maintainer: Maintainer,
}

impl ProxyService {
    pub fn new(engine: Arc<ForwardingEngine>, maintainer: Maintainer) -> Self {
        Self { engine, maintainer }
    }

    pub fn engine(&self) -> &Arc<ForwardingEngine> {
        &self.engine
    }

    /// Routes under `/proxy`, without the middleware stack
    pub fn into_router(self) -> Router {
        Router::new()
            .route("/proxy", get(info_handler).post(forward_handler))
            .route("/proxy/", get(info_handler))
            .route("/proxy/v2", get(info_v2_handler))
            .route("/proxy/v2/", get(info_v2_handler))
            .route("/proxy/stream", post(stream_handler))
            .route("/proxy/cache/clear", post(cache_clear_handler))
            .route("/proxy/cache/stats", get(cache_stats_handler))
            .with_state(Arc::new(self))
    }

    /// Capability metadata advertising `versions`
    pub fn info(&self, versions: &[&str]) -> serde_json::Value {
        let cache = self.engine.cache();
        json!({
            "versions": versions,
            "language": "Rust",
            "maintainer": self.maintainer,
            "project": {
                "name": env!("CARGO_PKG_NAME"),
                "description": env!("CARGO_PKG_DESCRIPTION"),
                "repository": env!("CARGO_PKG_REPOSITORY"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "metrics": self.engine.metrics().snapshot(),
            "cache": {
                "enabled": self.engine.config().cache_enabled,
                "size": cache.len(),
                "ttlSeconds": cache.ttl().as_secs(),
            },
            "activeStreams": self.engine.connections().len(),
        })
    }
}

fn parse_request(
    payload: Result<Json<ProxyRequest>, JsonRejection>,
    engine: &ForwardingEngine,
) -> Result<OutboundRequest, ProxyError> {
    let Json(request) =
        payload.map_err(|rejection| ProxyError::InvalidRequest(rejection.body_text()))?;
    OutboundRequest::from_wire(request, engine.config())
}

fn proxy_time(started: Instant) -> String {
    started.elapsed().as_millis().to_string()
}

/// `POST /proxy`
async fn forward_handler(
    State(proxy): State<Arc<ProxyService>>,
    request_id: RequestId,
    payload: Result<Json<ProxyRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let outcome = match parse_request(payload, &proxy.engine) {
        Ok(outbound) => {
            info!(
                request_id = %request_id,
                method = %outbound.method,
                url = %outbound.url,
                "Forwarding request"
            );
            proxy.engine.forward(outbound).await
        }
        Err(e) => Err(e),
    };

    let mut response = match outcome {
        Ok(forwarded) => Json(forwarded).into_response(),
        Err(e) => e.into_error_response(Some(&request_id.to_string())),
    };
    if let Ok(value) = proxy_time(started).parse() {
        response.headers_mut().insert(PROXY_TIME_HEADER, value);
    }
    response
}

/// `POST /proxy/stream`
async fn stream_handler(
    State(proxy): State<Arc<ProxyService>>,
    request_id: RequestId,
    payload: Result<Json<ProxyRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let outbound = match parse_request(payload, &proxy.engine) {
        Ok(outbound) => outbound,
        Err(e) => return e.into_error_response(Some(&request_id.to_string())),
    };

    info!(
        request_id = %request_id,
        method = %outbound.method,
        url = %outbound.url,
        "Opening streaming relay"
    );

    let relay = match proxy.engine.stream(outbound).await {
        Ok(relay) => relay,
        Err(e) => return e.into_error_response(Some(&request_id.to_string())),
    };

    let body = Body::from_stream(
        relay
            .frames
            .map(|frame| Ok::<_, Infallible>(frame.to_ndjson())),
    );

    (
        [
            (CONTENT_TYPE.as_str(), content_types::NDJSON.to_string()),
            (PROXY_TIME_HEADER, proxy_time(started)),
            (CONNECTION_ID_HEADER, relay.connection_id.to_string()),
        ],
        body,
    )
        .into_response()
}

async fn info_handler(State(proxy): State<Arc<ProxyService>>) -> Json<serde_json::Value> {
    Json(proxy.info(ALL_VERSIONS))
}

async fn info_v2_handler(State(proxy): State<Arc<ProxyService>>) -> Json<serde_json::Value> {
    Json(proxy.info(&["v2"]))
}

/// `POST /proxy/cache/clear`
async fn cache_clear_handler(
    State(proxy): State<Arc<ProxyService>>,
    identity: CallerIdentity,
    request_id: RequestId,
) -> Response {
    if !identity.service {
        warn!(request_id = %request_id, "Cache clear attempted without service credential");
        return ProxyError::Forbidden.into_error_response(Some(&request_id.to_string()));
    }

    let cleared = proxy.engine.cache().clear();
    info!(request_id = %request_id, cleared, "Response cache cleared");
    Json(json!({ "message": "Cache cleared", "cleared": cleared })).into_response()
}

/// `GET /proxy/cache/stats`
async fn cache_stats_handler(
    State(proxy): State<Arc<ProxyService>>,
    identity: CallerIdentity,
    request_id: RequestId,
) -> Response {
    if !identity.service {
        return ProxyError::Forbidden.into_error_response(Some(&request_id.to_string()));
    }

    Json(json!({
        "enabled": proxy.engine.config().cache_enabled,
        "stats": proxy.engine.cache().stats(),
    }))
    .into_response()
}

/// Error conversion for Axum responses using standardized format
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_response = self.to_error_response();
        error_response.into_response_with_status(status)
    }
}
