//! Error types for cluster module

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Hub is shutting down")]
    ShuttingDown,

    #[error("Connection limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Broker already has an active subscription")]
    AlreadySubscribed,

    #[error("Closed: {0}")]
    Closed(String),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::Redis(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
