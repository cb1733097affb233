//! Client-facing error envelope: `{error: {code, ...}}`, always carrying the
//! correlation identifier in both the body and the `X-Correlation-ID` header.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use engine_common::correlation::CorrelationId;
use serde_json::json;

pub enum ApiError {
    /// Malformed JSON or missing FEN.
    BadRequest(String),
    /// Queue breaker Open; retry after the given number of seconds.
    ServiceUnavailable { retry_after_seconds: u64, failure_count: u32 },
    /// Deadline exceeded while waiting for a result, or the engine reported an error.
    Timeout(String),
    /// Serialisation or other unexpected internal failure.
    Internal(String),
}

impl ApiError {
    pub fn into_response(self, correlation_id: &CorrelationId) -> Response {
        let mut response = match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"code": "BAD_REQUEST", "message": message}})),
            )
                .into_response(),
            ApiError::ServiceUnavailable { retry_after_seconds, failure_count } => {
                let mut response = (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({
                        "error": {
                            "code": "SERVICE_UNAVAILABLE",
                            "retry_after_seconds": retry_after_seconds,
                            "details": {
                                "circuit_breaker_state": "open",
                                "failure_count": failure_count,
                            }
                        }
                    })),
                )
                    .into_response();
                response.headers_mut().insert(
                    "retry-after",
                    HeaderValue::from_str(&retry_after_seconds.to_string())
                        .unwrap_or_else(|_| HeaderValue::from_static("30")),
                );
                response
            }
            ApiError::Timeout(message) => (
                StatusCode::REQUEST_TIMEOUT,
                Json(json!({"error": {"code": "TIMEOUT", "message": message}})),
            )
                .into_response(),
            ApiError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": {"code": "INTERNAL", "message": message}})),
            )
                .into_response(),
        };

        if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
            response.headers_mut().insert("x-correlation-id", value);
        }
        response
    }
}
