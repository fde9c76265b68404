//! Error types for the shim.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use thiserror::Error;

use crate::translate::openai_types::ErrorResponse;

/// A non-success reply from the native handler, kept byte-for-byte so it can
/// be re-emitted to the caller unchanged.
#[derive(Debug, Clone)]
pub struct NativeFailure {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl NativeFailure {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: None,
            body: body.into(),
        }
    }

    /// Failure with a JSON body, the shape the native server uses for its errors.
    pub fn json(status: StatusCode, body: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: Some("application/json".to_string()),
            body: Bytes::from(body.to_string()),
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ShimError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{message}")]
    MalformedRequest { message: String },

    #[error("Malformed content: {message}")]
    MalformedContent { message: String },

    #[error("Native handler returned status {}", .0.status)]
    Downstream(NativeFailure),

    #[error("Native stream failed: {message}")]
    Stream { message: String },

    #[error("Native runtime unreachable: {message}")]
    Unreachable { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ShimError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn malformed_request(msg: impl Into<String>) -> Self {
        Self::MalformedRequest {
            message: msg.into(),
        }
    }

    pub fn malformed_content(msg: impl Into<String>) -> Self {
        Self::MalformedContent {
            message: msg.into(),
        }
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream {
            message: msg.into(),
        }
    }

    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable {
            message: msg.into(),
        }
    }

    /// Whether the error was caused by the caller's input (never forwarded downstream).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedRequest { .. } | Self::MalformedContent { .. }
        )
    }
}

impl IntoResponse for ShimError {
    fn into_response(self) -> Response {
        match self {
            Self::Downstream(failure) => {
                let content_type = failure
                    .content_type
                    .unwrap_or_else(|| "application/json".to_string());
                (
                    failure.status,
                    [(header::CONTENT_TYPE, content_type)],
                    failure.body,
                )
                    .into_response()
            }
            err if err.is_client_error() => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::invalid_request(err.to_string())),
            )
                .into_response(),
            err => (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse::api_error(err.to_string())),
            )
                .into_response(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ShimError>;
