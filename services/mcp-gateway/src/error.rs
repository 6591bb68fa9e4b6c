//! Proxy-path errors and their JSON responses
//!
//! Bootstrap (OAuth callback) failures are shown to the operator as plain
//! text by the handlers themselves and never go through this type.

use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unauthorized: Invalid or missing API key")]
    Unauthorized,

    #[error("OAuth not configured")]
    NotConfigured,

    #[error("upstream request failed: {0}")]
    UpstreamForwarding(String),

    #[error("token store unavailable: {0}")]
    Store(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Error::UpstreamForwarding(_) | Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn body(&self) -> serde_json::Value {
        match self {
            Error::Unauthorized => serde_json::json!({ "error": self.to_string() }),
            Error::NotConfigured => serde_json::json!({
                "error": self.to_string(),
                "message": "Visit /oauth/start to configure OAuth tokens",
            }),
            Error::UpstreamForwarding(message) | Error::Store(message) => serde_json::json!({
                "error": "Internal server error",
                "message": message,
            }),
            Error::InvalidRequest(message) => serde_json::json!({
                "error": "Invalid request",
                "message": message,
            }),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(CONTENT_TYPE, "application/json")],
            self.body().to_string(),
        )
            .into_response()
    }
}
