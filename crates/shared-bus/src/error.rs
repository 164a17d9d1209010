//! Broker-layer errors.

use thiserror::Error;

/// Errors from channel and key/value operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Broker connection failed or dropped.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// A stored value was not valid JSON.
    #[error("invalid stored value under {key}: {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The background pub/sub task is gone.
    #[error("subscription task unavailable")]
    SubscriptionClosed,
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Connection(err.to_string())
    }
}
