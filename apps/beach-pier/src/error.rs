use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

/// JSON error surfaced to HTTP callers as `{ "error": "<message>" }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiError {
    status: StatusCode,
    message: &'static str,
}

impl ApiError {
    pub const fn new(status: StatusCode, message: &'static str) -> Self {
        Self { status, message }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &'static str {
        self.message
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Invalid configuration detected at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid listen address {value:?}: {source}")]
    ListenAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid upstream url {value:?}: {reason}")]
    UpstreamUrl { value: String, reason: String },
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
}
