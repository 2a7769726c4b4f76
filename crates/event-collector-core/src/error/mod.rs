//! Error types shared across the collector.
//!
//! Every fallible operation in the pipeline returns a variant of
//! [`CollectorError`]. Transient infrastructure failures (broker, store,
//! cache) are retried or degraded by the caller; decode and validation
//! failures are terminal for the message that produced them and carry their
//! own error types in the `events` module.

use thiserror::Error;

/// Result type for collector operations
pub type CollectorResult<T> = Result<T, CollectorError>;

/// Error taxonomy for the collector pipeline
#[derive(Debug, Error, Clone)]
pub enum CollectorError {
    #[error("Broker error: {message}")]
    BrokerError { message: String },

    #[error("Database error: {message}")]
    DatabaseError { message: String },

    #[error("Cache error: {message}")]
    CacheError { message: String },

    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Dead letter store error: {message}")]
    DeadLetterError { message: String },

    #[error("Shutdown in progress: {message}")]
    ShuttingDown { message: String },
}

impl CollectorError {
    pub fn broker(message: impl Into<String>) -> Self {
        CollectorError::BrokerError {
            message: message.into(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        CollectorError::DatabaseError {
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        CollectorError::CacheError {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        CollectorError::ConfigurationError {
            message: message.into(),
        }
    }

    /// Transient errors are eligible for local retry with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollectorError::BrokerError { .. }
                | CollectorError::DatabaseError { .. }
                | CollectorError::CacheError { .. }
        )
    }
}

impl From<serde_json::Error> for CollectorError {
    fn from(error: serde_json::Error) -> Self {
        CollectorError::SerializationError {
            message: error.to_string(),
        }
    }
}
