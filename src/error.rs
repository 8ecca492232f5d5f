//! Error kinds shared across the aggregator.
//!
//! Only `ConfigInvalid` is ever fatal, and only at startup. Every other kind
//! is caught by the task that produced it, counted, and logged.

use thiserror::Error;

/// Errors produced by the aggregator's core tasks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Transient transport error: {0}")]
    TransportTransient(String),

    #[error("Permanent transport error: {0}")]
    TransportPermanent(String),

    #[error("Malformed payload: {0}")]
    PayloadMalformed(String),

    #[error("Queue full: {0}")]
    QueueFull(&'static str),

    #[error("Persistence I/O error: {0}")]
    PersistenceIo(String),
}

impl Error {
    /// Whether a submission that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransportTransient(_))
    }
}

/// Result type for aggregator operations.
pub type Result<T> = std::result::Result<T, Error>;
