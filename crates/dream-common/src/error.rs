//! Error types and result handling for the Dreamscape Gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Dreamscape Gateway operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Response parsing error: {0}")]
    ResponseParsing(String),

    #[error("Provider method missing: {0}")]
    ProviderMethod(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Provider error (status {status}): {message}")]
    Provider { status: u16, message: String },

    #[error("Circuit open for provider '{0}'")]
    CircuitOpen(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),

    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// Check if the error is retryable before classification
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ResponseParsing(_)
                | Error::Network(_)
                | Error::Timeout(_)
                | Error::RateLimit { .. }
                | Error::Provider { .. }
                | Error::CircuitOpen(_)
                | Error::Serialization(_)
                | Error::Unknown(_)
        )
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            Error::ResponseParsing(_) => "response_parsing",
            Error::ProviderMethod(_) => "provider_method",
            Error::Network(_) => "network",
            Error::Timeout(_) => "timeout",
            Error::RateLimit { .. } => "rate_limit",
            Error::Authentication(_) => "authentication",
            Error::Provider { .. } => "provider_error",
            Error::CircuitOpen(_) => "provider_error",
            Error::Configuration(_) => "configuration",
            Error::Validation(_) => "validation",
            Error::Serialization(_) => "response_parsing",
            Error::Generic(_) => "unknown",
            Error::Unknown(_) => "unknown",
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Provider { status, .. } => Some(*status),
            Error::RateLimit { .. } => Some(429),
            Error::Authentication(_) => Some(401),
            Error::Validation(_) => Some(400),
            _ => None,
        }
    }
}
