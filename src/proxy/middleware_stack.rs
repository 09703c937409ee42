//! Middleware stack builder for clean composition
//!
//! This module provides a builder pattern for composing the Tower middleware stack,
//! making it easier to maintain and test the middleware pipeline.

use crate::identity::{IdentityResolver, TokenIdentityResolver};
use crate::proxy::middleware::*;
use crate::proxy::types::DEFAULT_MAX_REQUEST_SIZE;
use axum::{
    middleware::{from_fn, from_fn_with_state},
    Router,
};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

/// Builder for composing the gateway middleware stack
pub struct MiddlewareStack {
    identity: Arc<dyn IdentityResolver>,
    body_limit: usize,
}

impl MiddlewareStack {
    /// Create a new middleware stack builder
    pub fn new(identity: Arc<dyn IdentityResolver>) -> Self {
        Self {
            identity,
            body_limit: DEFAULT_MAX_REQUEST_SIZE,
        }
    }

    /// Reject inbound bodies larger than `bytes` with 413
    pub fn with_body_limit(mut self, bytes: usize) -> Self {
        self.body_limit = bytes;
        self
    }

    /// Apply the complete middleware stack to a router
    ///
    /// The middleware are applied in the following order (outer to inner):
    /// 1. Request ID generation/propagation
    /// 2. Logging (with request ID)
    /// 3. Error handling
    /// 4. Identity resolution
    /// 5. Body size limit
    pub fn apply_to_router<S>(self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router
            // Apply middleware in reverse order (innermost first in the builder)
            .layer(RequestBodyLimitLayer::new(self.body_limit))
            .layer(from_fn_with_state(self.identity, identity_middleware))
            .layer(from_fn(error_handling_middleware))
            .layer(from_fn(logging_middleware))
            .layer(from_fn(request_id_middleware))
    }

    /// Create a stack that recognizes no credentials
    #[cfg(test)]
    pub fn minimal() -> Self {
        Self::new(Arc::new(TokenIdentityResolver::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CallerIdentity;
    use crate::proxy::headers::{paths, X_REQUEST_ID};
    use axum::{body::Body, http::StatusCode, response::IntoResponse};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_middleware_stack_builder() {
        async fn handler(identity: CallerIdentity) -> impl IntoResponse {
            match identity.user {
                Some(_) => StatusCode::OK,
                None => StatusCode::UNAUTHORIZED,
            }
        }

        let router = Router::new()
            .route("/test", axum::routing::get(handler))
            .with_state(());

        let resolver = TokenIdentityResolver::new(
            [("test-token".to_string(), "user-1".to_string())],
            Vec::new(),
        );
        let app = MiddlewareStack::new(Arc::new(resolver)).apply_to_router(router);

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/test")
                    .header("Authorization", "Bearer test-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(X_REQUEST_ID));

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(X_REQUEST_ID));
    }

    #[tokio::test]
    async fn test_middleware_stack_body_limit() {
        async fn handler(body: String) -> impl IntoResponse {
            body
        }

        let router = Router::new()
            .route(paths::HEALTH, axum::routing::post(handler))
            .with_state(());
        let app = MiddlewareStack::minimal()
            .with_body_limit(16)
            .apply_to_router(router);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(paths::HEALTH)
                    .body(Body::from("x".repeat(64)))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
