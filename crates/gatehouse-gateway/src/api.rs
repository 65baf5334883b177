//! HTTP API Error Mapping
//!
//! User-visible responses encode only the errors a client can act on:
//! unknown topic, oversized message, backend not open, bad consumer group,
//! and throttling. Everything else collapses to a plain 500 - internal
//! failures are logged where they happen, not leaked to callers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    UnknownTopic(String),
    MessageTooLarge,
    EmptyMessage,
    NotOpen,
    InvalidGroup(String),
    Throttled,
    Internal,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::UnknownTopic(_) => StatusCode::NOT_FOUND,
            ApiError::MessageTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::EmptyMessage => StatusCode::BAD_REQUEST,
            ApiError::NotOpen => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InvalidGroup(_) => StatusCode::FORBIDDEN,
            ApiError::Throttled => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::UnknownTopic(topic) => format!("unknown topic: {topic}"),
            ApiError::MessageTooLarge => "message too large".into(),
            ApiError::EmptyMessage => "empty message".into(),
            ApiError::NotOpen => "backend not open".into(),
            ApiError::InvalidGroup(group) => format!("invalid group: {group}"),
            ApiError::Throttled => "too many requests".into(),
            ApiError::Internal => "internal error".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.message() }))).into_response()
    }
}
