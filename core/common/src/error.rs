//! Common error types for eQMS storage.

use thiserror::Error;

/// Top-level error type for storage, audit and settings operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage backend reported a failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Stored content does not match its recorded checksum.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// The provider does not offer the requested capability.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Provider or settings configuration is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Remote service could not be reached or returned an error.
    #[error("Network error: {0}")]
    Network(String),

    /// Credentials were rejected.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Credentials were accepted but access was denied.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl Error {
    /// HTTP status code a web layer should answer with for this error.
    ///
    /// Validation failures are 400, authentication 401, authorization 403,
    /// missing resources 404, conflicts 409. Everything coming from the
    /// backend itself is passed through as 500.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidInput(_) | Error::Unsupported(_) | Error::Integrity(_) => 400,
            Error::Authentication(_) => 401,
            Error::NotPermitted(_) | Error::PermissionDenied(_) => 403,
            Error::NotFound(_) => 404,
            Error::AlreadyExists(_) => 409,
            Error::Storage(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Configuration(_)
            | Error::Network(_) => 500,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::InvalidInput("x".into()).status_code(), 400);
        assert_eq!(Error::Authentication("x".into()).status_code(), 401);
        assert_eq!(Error::NotPermitted("x".into()).status_code(), 403);
        assert_eq!(Error::PermissionDenied("x".into()).status_code(), 403);
        assert_eq!(Error::NotFound("x".into()).status_code(), 404);
        assert_eq!(Error::AlreadyExists("x".into()).status_code(), 409);
        assert_eq!(Error::Network("x".into()).status_code(), 500);

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(Error::from(io).status_code(), 500);
    }

    #[test]
    fn test_serde_json_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(Error::from(err), Error::Serialization(_)));
    }
}
