//! Error types for txpipe

use thiserror::Error;

/// Node error message fragments that mean the submitted nonce was already used
const NONCE_TOO_LOW_MARKERS: &[&str] = &["nonce too low", "nonce is too low", "oldnonce", "old nonce"];

/// Node error message fragment returned when a filter id is no longer known
const FILTER_NOT_FOUND_MARKER: &str = "filter not found";

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum PipeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("RPC error calling {method}: {message}")]
    Rpc { method: &'static str, message: String },

    #[error("Nonce error for account {account}: {message}")]
    Nonce { account: String, message: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Invalid log query: {0}")]
    InvalidQuery(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipeError {
    /// Build an RPC error from any displayable transport error
    pub fn rpc(method: &'static str, err: impl std::fmt::Display) -> Self {
        PipeError::Rpc {
            method,
            message: err.to_string(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipeError::Rpc { .. } | PipeError::Timeout { .. })
    }

    /// The node rejected a transaction because its nonce was already used
    pub fn is_nonce_too_low(&self) -> bool {
        match self {
            PipeError::Rpc { message, .. } => {
                let message = message.to_lowercase();
                NONCE_TOO_LOW_MARKERS
                    .iter()
                    .any(|marker| message.contains(marker))
            }
            _ => false,
        }
    }

    /// The node no longer knows the filter id (expired or node restarted)
    pub fn is_filter_not_found(&self) -> bool {
        match self {
            PipeError::Rpc { message, .. } => {
                message.to_lowercase().contains(FILTER_NOT_FOUND_MARKER)
            }
            _ => false,
        }
    }
}

/// Result type for pipeline operations
pub type PipeResult<T> = Result<T, PipeError>;
