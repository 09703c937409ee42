//! Middleware implementations shared by every gateway route

use crate::identity::{CallerIdentity, IdentityResolver};
use crate::proxy::types::{RequestId, REQUEST_ID_HEADER};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Request ID middleware - ensures every request has a unique ID for tracing.
///
/// A caller-supplied UUID is kept; anything else is replaced by a fresh v7
/// UUID. The id is also stored in request extensions as a [`RequestId`].
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .map(RequestId::new)
        .unwrap_or_else(RequestId::generate);

    let header_value = HeaderValue::from_str(&request_id.to_string()).ok();
    if let Some(value) = &header_value {
        request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    }
    request.extensions_mut().insert(request_id);

    let mut response = next.run(request).await;

    if let Some(value) = header_value {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Handlers read the id stored by [`request_id_middleware`]; outside the
/// stack a fresh one is generated
impl<S: Send + Sync> FromRequestParts<S> for RequestId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestId>()
            .copied()
            .unwrap_or_else(RequestId::generate))
    }
}

/// Identity middleware - records who is calling for downstream handlers
pub async fn identity_middleware(
    State(resolver): State<Arc<dyn IdentityResolver>>,
    mut request: Request,
    next: Next,
) -> Response {
    let identity = CallerIdentity {
        user: resolver.resolve(request.headers()),
        service: resolver.is_service_caller(request.headers()),
    };
    debug!(
        user = ?identity.user,
        service = identity.service,
        "Caller identified"
    );

    request.extensions_mut().insert(identity);
    next.run(request).await
}

/// Logging middleware - logs request/response details with timing
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    info!(
        request_id = request_id,
        method = %method,
        path = %uri.path(),
        "Incoming request"
    );

    let response = next.run(request).await;
    let duration = start.elapsed();

    info!(
        request_id = request_id,
        method = %method,
        path = %uri.path(),
        status = response.status().as_u16(),
        duration_ms = duration.as_millis(),
        "Request completed"
    );

    response
}

/// Error handling wrapper - logs failed responses and guarantees the
/// correlation header is present on them
pub async fn error_handling_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let mut response = next.run(request).await;
    let status = response.status();
    if status.is_success() || status.is_redirection() || status.is_informational() {
        return response;
    }

    if status.is_server_error() {
        error!(request_id = request_id, status = status.as_u16(), "Request failed");
    } else {
        warn!(request_id = request_id, status = status.as_u16(), "Request rejected");
    }

    if !response.headers().contains_key(REQUEST_ID_HEADER) {
        if let Ok(header_value) = HeaderValue::from_str(&request_id) {
            response
                .headers_mut()
                .insert(REQUEST_ID_HEADER, header_value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TokenIdentityResolver;
    use axum::body::Body;
    use axum::http::{header, StatusCode};
    use axum::middleware::{from_fn, from_fn_with_state};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_request_id_generation() {
        let handler = tower::service_fn(|req: Request| async move {
            let request_id = req
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|h| h.to_str().ok())
                .unwrap_or("missing")
                .to_string();
            assert!(req.extensions().get::<RequestId>().is_some());

            Ok::<_, std::convert::Infallible>(
                Response::builder()
                    .status(StatusCode::OK)
                    .header("x-seen-id", request_id)
                    .body(Body::empty())
                    .unwrap(),
            )
        });

        let service = tower::ServiceBuilder::new()
            .layer(from_fn(request_id_middleware))
            .service(handler);

        let request = Request::builder()
            .method("GET")
            .uri("/test")
            .body(Body::empty())
            .unwrap();

        let response = service.oneshot(request).await.unwrap();
        let request_id = response.headers().get(REQUEST_ID_HEADER).unwrap();
        assert_eq!(response.headers().get("x-seen-id").unwrap(), request_id);

        let uuid = Uuid::parse_str(request_id.to_str().unwrap()).unwrap();
        assert_eq!(uuid.get_version_num(), 7);
    }

    #[tokio::test]
    async fn test_request_id_is_propagated_when_valid() {
        let handler = tower::service_fn(|_req: Request| async move {
            Ok::<_, std::convert::Infallible>(Response::new(Body::empty()))
        });
        let service = tower::ServiceBuilder::new()
            .layer(from_fn(request_id_middleware))
            .service(handler);

        let supplied = Uuid::now_v7().to_string();
        let request = Request::builder()
            .uri("/test")
            .header(REQUEST_ID_HEADER, &supplied)
            .body(Body::empty())
            .unwrap();
        let response = service.clone().oneshot(request).await.unwrap();
        assert_eq!(response.headers().get(REQUEST_ID_HEADER).unwrap(), supplied.as_str());

        let request = Request::builder()
            .uri("/test")
            .header(REQUEST_ID_HEADER, "not-a-uuid")
            .body(Body::empty())
            .unwrap();
        let response = service.oneshot(request).await.unwrap();
        assert_ne!(response.headers().get(REQUEST_ID_HEADER).unwrap(), "not-a-uuid");
    }

    #[tokio::test]
    async fn test_identity_middleware_inserts_caller() {
        let resolver: Arc<dyn IdentityResolver> = Arc::new(TokenIdentityResolver::new(
            [("tok".to_string(), "alice".to_string())],
            ["svc".to_string()],
        ));

        let handler = tower::service_fn(|req: Request| async move {
            let identity = req
                .extensions()
                .get::<CallerIdentity>()
                .cloned()
                .unwrap_or_default();
            let body = format!(
                "{}|{}",
                identity.user.map(|u| u.to_string()).unwrap_or_default(),
                identity.service
            );
            Ok::<_, std::convert::Infallible>(Response::new(Body::from(body)))
        });

        let service = tower::ServiceBuilder::new()
            .layer(from_fn_with_state(resolver, identity_middleware))
            .service(handler);

        let request = Request::builder()
            .uri("/ai/chat")
            .header(header::AUTHORIZATION, "Bearer tok")
            .header("x-api-key", "svc")
            .body(Body::empty())
            .unwrap();
        let response = service.clone().oneshot(request).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"alice|true");

        let anonymous = Request::builder().uri("/ai/chat").body(Body::empty()).unwrap();
        let response = service.oneshot(anonymous).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"|false");
    }

    #[tokio::test]
    async fn test_error_handling_adds_request_id() {
        let handler = tower::service_fn(|_req: Request| async move {
            Ok::<_, std::convert::Infallible>(
                Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body(Body::empty())
                    .unwrap(),
            )
        });
        let service = tower::ServiceBuilder::new()
            .layer(from_fn(error_handling_middleware))
            .service(handler);

        let request = Request::builder()
            .uri("/proxy")
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(Body::empty())
            .unwrap();
        let response = service.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get(REQUEST_ID_HEADER).unwrap(), "abc-123");
    }
}
