//! Error types for outbox dispatch operations.
//!
//! Defines all error conditions that can occur while publishing events,
//! including network failures, bus rejections, and storage errors. All
//! publish failures are handled the same way by the dispatcher: the error
//! text is recorded on the row and the event retries after backoff, so
//! there is no retryable/permanent split here.

use bote_core::CoreError;
use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error types for outbox dispatch operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Network-level connectivity failure reaching the bus.
    #[error("network error: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// Publish request timed out.
    #[error("publish timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Bus acknowledged the request but refused the message.
    #[error("publish rejected: HTTP {status_code}")]
    Rejected {
        /// HTTP status code returned by the bus
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Message could not be encoded for the bus.
    #[error("message encoding failed: {message}")]
    Serialization {
        /// Encoding error message
        message: String,
    },

    /// Invalid dispatcher or bus configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Outbox storage operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] CoreError),
}

impl DispatchError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a rejection error from a bus response.
    pub fn rejected(status_code: u16, body: impl Into<String>) -> Self {
        Self::Rejected { status_code, body: body.into() }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }
}
