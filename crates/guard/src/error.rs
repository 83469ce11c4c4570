//! Error types for the guard crate.

use thiserror::Error;

/// Top-level error taxonomy for security decisions.
///
/// Component-level errors (`ResolveError`, `SetupError`, ...) convert into
/// one of these categories so the HTTP layer can pick a status code without
/// knowing which component failed.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Bad or missing input.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Traversal, protected resource, CSRF failure or lockout.
    #[error("access denied: {0}")]
    Authorization(String),

    /// Resolution failure or absent file.
    #[error("not found: {0}")]
    NotFound(String),

    /// Credential store missing or corrupt after setup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GuardError {
    /// HTTP status code for this error category.
    pub fn status_code(&self) -> u16 {
        match self {
            GuardError::Validation(_) => 400,
            GuardError::Authorization(_) => 403,
            GuardError::NotFound(_) => 404,
            GuardError::Configuration(_) => 500,
            GuardError::Io(_) => 500,
        }
    }

    /// Status code as seen by clients.
    ///
    /// Authorization failures on resources are reported exactly like missing
    /// resources so a client cannot probe for existence.
    pub fn public_status_code(&self) -> u16 {
        match self {
            GuardError::Authorization(_) | GuardError::NotFound(_) => 404,
            other => other.status_code(),
        }
    }

    /// Stable identifier for logs and audit records.
    pub fn error_code(&self) -> &'static str {
        match self {
            GuardError::Validation(_) => "validation_error",
            GuardError::Authorization(_) => "authorization_error",
            GuardError::NotFound(_) => "not_found",
            GuardError::Configuration(_) => "configuration_error",
            GuardError::Io(_) => "io_error",
        }
    }
}

/// Result type alias for guard operations.
pub type Result<T> = std::result::Result<T, GuardError>;
