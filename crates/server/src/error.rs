//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use guard::GuardError;
use thiserror::Error;

use crate::views;

/// Errors surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum AppError {
    /// A required query or form parameter is absent.
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),

    /// Malformed request body.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing, outside the root or reserved. Deliberately one variant.
    #[error("file not found or access denied")]
    NotFound,

    /// The file exists but cannot be read.
    #[error("file is not readable")]
    Unreadable,

    /// Setup completed earlier but the credential is gone or unreadable.
    #[error("credential store unavailable")]
    ConfigMissing,

    /// Error from the security layer.
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// Unexpected failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("blocking task failed: {err}"))
    }
}

impl AppError {
    /// Status code sent to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MissingParameter(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unreadable => StatusCode::FORBIDDEN,
            AppError::ConfigMissing | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Guard(e) => StatusCode::from_u16(e.public_status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Message shown to the client. Never includes filesystem details.
    pub fn public_message(&self) -> String {
        match self.status() {
            StatusCode::NOT_FOUND => "File not found or access denied.".to_string(),
            StatusCode::FORBIDDEN => "File is not readable.".to_string(),
            StatusCode::BAD_REQUEST => self.to_string(),
            _ => match self {
                AppError::ConfigMissing | AppError::Guard(GuardError::Configuration(_)) => {
                    "Server configuration error. Contact the administrator.".to_string()
                }
                _ => "Internal server error.".to_string(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        let body = views::error_page(status, &self.public_message());
        (status, Html(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::MissingParameter("download").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::Unreadable.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::ConfigMissing.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_guard_authorization_looks_like_not_found() {
        let denied = AppError::Guard(GuardError::Authorization("reserved".into()));
        assert_eq!(denied.status(), StatusCode::NOT_FOUND);
        assert_eq!(denied.public_message(), AppError::NotFound.public_message());
    }

    #[test]
    fn test_internal_details_not_exposed() {
        let err = AppError::Internal("/var/lib/fileward/credential.json".into());
        assert!(!err.public_message().contains("credential"));

        let err = AppError::Guard(GuardError::Configuration("credential missing".into()));
        assert!(err.public_message().contains("configuration"));
        assert!(!err.public_message().contains("credential"));
    }
}
