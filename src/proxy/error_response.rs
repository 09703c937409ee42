//! Unified error response handling for the gateway
//!
//! This module provides consistent error formatting across all middleware
//! and handlers, ensuring proper request ID correlation and standardized
//! error messages.

use crate::proxy::types::{ProxyError, REQUEST_ID_HEADER};
use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Standard error response format
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Unique error code for programmatic handling
    pub code: String,
    /// Short error summary
    pub error: String,
    /// Human-readable error message
    pub message: String,
    /// Request ID for correlation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Seconds the caller should wait before retrying
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(
        code: impl Into<String>,
        error: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            error: error.into(),
            message: message.into(),
            request_id: None,
            retry_after: None,
            error_type: None,
            details: None,
        }
    }

    /// Add request ID for correlation
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Convert to HTTP response with proper headers
    pub fn into_response_with_status(self, status: StatusCode) -> Response {
        let request_id = self.request_id.clone();
        let retry_after = self.retry_after;
        let mut response = (status, Json(self)).into_response();

        if let Some(id) = request_id {
            if let Ok(header_value) = HeaderValue::from_str(&id) {
                response
                    .headers_mut()
                    .insert(REQUEST_ID_HEADER, header_value);
            }
        }
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(seconds));
        }

        response
    }
}

/// Extension trait for consistent error formatting
pub trait ErrorResponseExt {
    /// Convert to standardized error response
    fn to_error_response(&self) -> ErrorResponse;

    /// Get the appropriate HTTP status code
    fn status_code(&self) -> StatusCode;

    /// Render with the request ID attached
    fn into_error_response(&self, request_id: Option<&str>) -> Response {
        let mut error = self.to_error_response();
        if let Some(id) = request_id {
            error = error.with_request_id(id);
        }
        error.into_response_with_status(self.status_code())
    }
}

impl ErrorResponseExt for ProxyError {
    fn to_error_response(&self) -> ErrorResponse {
        use ProxyError::*;

        let message = self.to_string();
        match self {
            MissingTarget => ErrorResponse::new("MISSING_TARGET", "Missing URL parameter", message),
            InvalidTarget(_) => ErrorResponse::new("INVALID_TARGET_URL", "Invalid URL", message),
            InvalidRequest(_) => ErrorResponse::new("INVALID_REQUEST", "Invalid request", message),
            UpstreamTimeout(duration) => {
                ErrorResponse::new("UPSTREAM_TIMEOUT", "Request timeout", message).with_details(
                    serde_json::json!({ "timeoutMs": duration.as_millis() as u64 }),
                )
            }
            UpstreamTransport(_) => {
                ErrorResponse::new("UPSTREAM_ERROR", "Upstream request failed", message)
            }
            Forbidden => ErrorResponse::new("FORBIDDEN", "Forbidden", message),
            Serialization(_) => {
                ErrorResponse::new("SERIALIZATION_ERROR", "Internal server error", message)
            }
            Internal(_) => ErrorResponse::new("INTERNAL_ERROR", "Internal server error", message),
        }
    }

    fn status_code(&self) -> StatusCode {
        use ProxyError::*;

        match self {
            MissingTarget | InvalidTarget(_) | InvalidRequest(_) => StatusCode::BAD_REQUEST,
            UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            Forbidden => StatusCode::FORBIDDEN,
            Serialization(_) | Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Create an error response for common HTTP errors
pub fn standard_error_response(status: StatusCode, request_id: Option<&str>) -> Response {
    let (code, message) = match status {
        StatusCode::BAD_REQUEST => ("BAD_REQUEST", "Invalid request"),
        StatusCode::UNAUTHORIZED => ("UNAUTHORIZED", "Authentication required"),
        StatusCode::FORBIDDEN => ("FORBIDDEN", "Access denied"),
        StatusCode::NOT_FOUND => ("NOT_FOUND", "Resource not found"),
        StatusCode::METHOD_NOT_ALLOWED => ("METHOD_NOT_ALLOWED", "Method not allowed"),
        StatusCode::PAYLOAD_TOO_LARGE => ("PAYLOAD_TOO_LARGE", "Request too large"),
        StatusCode::UNPROCESSABLE_ENTITY => ("UNPROCESSABLE_ENTITY", "Malformed request body"),
        StatusCode::UNSUPPORTED_MEDIA_TYPE => ("UNSUPPORTED_MEDIA_TYPE", "Expected JSON body"),
        StatusCode::INTERNAL_SERVER_ERROR => ("INTERNAL_ERROR", "Internal server error"),
        StatusCode::BAD_GATEWAY => ("BAD_GATEWAY", "Upstream service error"),
        StatusCode::SERVICE_UNAVAILABLE => {
            ("SERVICE_UNAVAILABLE", "Service temporarily unavailable")
        }
        StatusCode::GATEWAY_TIMEOUT => ("GATEWAY_TIMEOUT", "Upstream service timeout"),
        _ => ("ERROR", "An error occurred"),
    };
    let summary = status.canonical_reason().unwrap_or("Error");

    let mut error = ErrorResponse::new(code, summary, message);
    if let Some(id) = request_id {
        error = error.with_request_id(id);
    }

    error.into_response_with_status(status)
}

/// Helper to extract request ID from headers
pub fn extract_request_id(headers: &http::HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}
