//! Error types for MailPulse

use std::time::Duration;
use thiserror::Error;

/// Main error type for MailPulse
#[derive(Error, Debug)]
pub enum Error {
    /// Network blip, dropped connection, push-wait failure or 5xx from a provider
    #[error("Transient protocol error: {0}")]
    TransientProtocol(String),

    /// Provider asked us to slow down
    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    /// Token or credential rejected by the provider
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Provider no longer recognises the stored sync cursor
    #[error("Sync anchor invalid: {0}")]
    AnchorInvalid(String),

    /// Account configuration is incomplete (missing host, credentials, ...)
    #[error("Account configuration error: {0}")]
    Configuration(String),

    /// Writing a batch to the shared bus failed
    #[error("Publisher write error: {0}")]
    PublisherWrite(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for MailPulse
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error comes from the provider, the network or account
    /// data. Watchers retry every failed cycle, but the others point at our
    /// own plumbing and are logged as errors.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientProtocol(_)
                | Error::RateLimited { .. }
                | Error::AuthExpired(_)
                | Error::AnchorInvalid(_)
                | Error::Configuration(_)
                | Error::Io(_)
        )
    }

    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::TransientProtocol(_) => 502,
            Error::RateLimited { .. } => 429,
            Error::AuthExpired(_) => 401,
            Error::AnchorInvalid(_) => 409,
            Error::Configuration(_) => 422,
            Error::PublisherWrite(_) => 500,
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::NotFound(_) => 404,
            Error::InvalidInput(_) => 400,
            Error::Serialization(_) => 500,
            Error::Io(_) => 500,
            Error::Internal(_) => 500,
            Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::TransientProtocol(_) => "transient_protocol",
            Error::RateLimited { .. } => "rate_limited",
            Error::AuthExpired(_) => "auth_expired",
            Error::AnchorInvalid(_) => "anchor_invalid",
            Error::Configuration(_) => "account_configuration",
            Error::PublisherWrite(_) => "publisher_write",
            Error::Config(_) => "config_error",
            Error::Database(_) => "database_error",
            Error::NotFound(_) => "not_found",
            Error::InvalidInput(_) => "invalid_input",
            Error::Serialization(_) => "serialization_error",
            Error::Io(_) => "io_error",
            Error::Internal(_) => "internal_error",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sync_errors_are_retryable() {
        assert!(Error::TransientProtocol("reset".into()).is_retryable());
        assert!(Error::RateLimited { retry_after: None }.is_retryable());
        assert!(Error::Configuration("no host".into()).is_retryable());
        assert!(!Error::PublisherWrite("rollback".into()).is_retryable());
        assert!(!Error::NotFound("account 7".into()).is_retryable());
    }

    #[test]
    fn test_codes() {
        assert_eq!(Error::NotFound("x".into()).code(), "not_found");
        assert_eq!(Error::NotFound("x".into()).status_code(), 404);
        assert_eq!(Error::AuthExpired("x".into()).code(), "auth_expired");
    }
}
