//! Crate-wide error taxonomy and its HTTP mapping.
//!
//! Every fallible core operation returns [`Error`]; the REST layer converts it
//! into the `{error: "error", message}` envelope with the matching status
//! code. Backend (search engine) bodies are never echoed to clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing/malformed query parameter, bad time range, undecodable cursor.
    #[error("{0}")]
    InvalidInput(String),

    /// Trace with no spans, unknown monitor/run id.
    #[error("{0}")]
    NotFound(String),

    /// Rerun of a non-terminal run, start of a completed monitor, and similar
    /// state conflicts.
    #[error("{0}")]
    Conflict(String),

    /// Search backend or database transport failure.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Non-2xx response from the search backend.
    #[error("search backend returned status {status}")]
    Backend { status: u16, message: String },

    /// Parse failures and logic bugs.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Backend { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to API clients. Backend response bodies stay in
    /// the logs only.
    fn public_message(&self) -> String {
        match self {
            Self::Backend { status, .. } => {
                format!("search backend returned status {status}")
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(err = %self, "request failed");
        }
        let body = Json(json!({
            "error": "error",
            "message": self.public_message(),
        }));
        (status, body).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::BackendUnavailable(format!("database: {e}"))
            }
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Internal(format!("database: {other}")),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_body_is_not_exposed() {
        let err = Error::Backend {
            status: 502,
            message: "secret internal detail".to_string(),
        };
        assert!(!err.public_message().contains("secret"));
        assert!(err.public_message().contains("502"));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            Error::invalid_input("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(Error::conflict("x").status_code(), StatusCode::CONFLICT);
        assert_eq!(
            Error::BackendUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
