//! Delivery error types.

use thiserror::Error;

/// Why a delivery attempt failed.
///
/// Errors are routed into the retry chain; they never reach the queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The device is offline or the host could not be reached
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The attempt exceeded the transport timeout
    #[error("Request timed out")]
    Timeout,

    /// The endpoint answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Any other transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The endpoint URL is malformed
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The request body could not be encoded
    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl DeliveryError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, DeliveryError::Connectivity(_))
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Connectivity(_) | DeliveryError::Timeout | DeliveryError::Transport(_) => {
                true
            }
            DeliveryError::Status { status, .. } => *status == 429 || *status >= 500,
            DeliveryError::InvalidEndpoint(_) | DeliveryError::Encoding(_) => false,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeliveryError::Timeout
        } else if err.is_connect() {
            DeliveryError::Connectivity(err.to_string())
        } else if err.is_builder() {
            DeliveryError::InvalidEndpoint(err.to_string())
        } else {
            DeliveryError::Transport(err.to_string())
        }
    }
}

impl From<url::ParseError> for DeliveryError {
    fn from(err: url::ParseError) -> Self {
        DeliveryError::InvalidEndpoint(err.to_string())
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Encoding(err.to_string())
    }
}

/// Result type alias using DeliveryError.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DeliveryError::Timeout.is_retryable());
        assert!(DeliveryError::Connectivity("offline".into()).is_retryable());
        assert!(DeliveryError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(DeliveryError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(!DeliveryError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!DeliveryError::InvalidEndpoint("x".into()).is_retryable());
    }
}
