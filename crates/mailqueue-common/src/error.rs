//! Error types for mailqueue

use thiserror::Error;

/// Main error type for mailqueue
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for mailqueue
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Smtp(_) => "SMTP_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::InvalidMessage(_) => "INVALID_MESSAGE",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the error is the caller's fault rather than an infrastructure failure
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::InvalidMessage(_) | Error::NotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::InvalidMessage("x".into()).code(), "INVALID_MESSAGE");
        assert_eq!(Error::Storage("locked".into()).code(), "STORAGE_ERROR");
        assert_eq!(
            Error::Other(anyhow::anyhow!("boom")).code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_client_errors() {
        assert!(Error::NotFound("id".into()).is_client_error());
        assert!(Error::InvalidMessage("empty".into()).is_client_error());
        assert!(!Error::Database("down".into()).is_client_error());
    }
}
