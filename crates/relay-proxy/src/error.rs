//! Client-facing error taxonomy.
//!
//! Errors surface only at the response boundary, rendered as
//! `{"error":{"message":..., "type":...}}` with a status code per kind.
//! Converter-internal errors never reach here; they are self-healed or
//! dropped inside the stream pipeline.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Request-level gateway error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("All endpoints are currently unavailable")]
    ServiceUnavailable,

    #[error("no handler matches this request")]
    NotFound,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    ProxyError(String),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("upstream timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("transformer error: {0}")]
    Transformer(String),
}

impl RelayError {
    /// The wire-level `type` discriminator for the error body.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::ServiceUnavailable => "service_unavailable",
            RelayError::NotFound => "not_found",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::ProxyError(_) => "proxy_error",
            RelayError::UpstreamError(_) => "upstream_error",
            RelayError::Timeout => "timeout_error",
            RelayError::Internal(_) => "internal_error",
            RelayError::Transformer(_) => "transformer_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::NotFound => StatusCode::NOT_FOUND,
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            // Configuration problems render the pool member unserviceable,
            // not the whole gateway; 503 lets the client retry elsewhere.
            RelayError::ProxyError(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            RelayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Transformer(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The JSON body sent to the client.
    pub fn body(&self) -> serde_json::Value {
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
            }
        })
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
