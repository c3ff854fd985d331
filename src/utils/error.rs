//! The `error` module defines the error types used within `relaybus`.
//!
//! Admission failures (`QueueFull`, `CapacityExceeded`, `TopicNotFound`) are
//! returned synchronously to the caller. Expiry and dead-lettering are not
//! errors; they surface as events.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("topic '{0}' not found")]
    TopicNotFound(String),

    #[error("topic '{0}' already exists")]
    TopicAlreadyExists(String),

    #[error("topic '{0}' is inactive")]
    TopicInactive(String),

    #[error("invalid topic name '{0}'")]
    InvalidTopicName(String),

    #[error("subscription '{0}' not found")]
    SubscriptionNotFound(String),

    #[error("no handler registered for subscriber '{0}'")]
    SubscriberNotRegistered(String),

    #[error("'{name}' is full (capacity {capacity})")]
    QueueFull { name: String, capacity: usize },

    #[error("{resource} limit of {limit} reached")]
    CapacityExceeded { resource: &'static str, limit: usize },

    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    #[error("message '{0}' not found")]
    MessageNotFound(String),

    /// Informational only: carried by expiry events, never returned.
    #[error("message '{0}' expired before delivery")]
    MessageExpired(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

/// Failure reported by a subscriber handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("handler failed: {message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<sled::Error> for BrokerError {
    fn from(e: sled::Error) -> Self {
        BrokerError::Persistence(e.to_string())
    }
}
