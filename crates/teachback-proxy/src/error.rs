//! Proxy error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::protocol::ErrorBody;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Gemini API key not configured. Please set GEMINI_API_KEY environment variable.")]
    NotConfigured,

    /// A provider call behind `/api/gemini/teach` failed.
    #[error("Failed to generate teaching content")]
    Teach(String),

    /// A provider call behind `/api/gemini/chat` failed.
    #[error("Failed to get response")]
    Chat(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    fn details(&self) -> Option<String> {
        match self {
            Self::Teach(d) | Self::Chat(d) => Some(d.clone()),
            _ => None,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            details: self.details(),
        };
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}
