//! Message definitions shared by the push and pull paths.
//!
//! A `Message` is immutable once created except for its attempt counter,
//! which only ever grows. Monotonic instants drive TTL and scheduling;
//! `timestamp` is the wall-clock publish time in Unix milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

pub type MessageId = String;

/// Opaque message body. Only subscription filters look inside it.
pub type Payload = serde_json::Value;

#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    /// Topic name on the push path, queue name on the pull path.
    pub destination: String,
    pub payload: Payload,
    pub priority: i32,
    pub created_at: Instant,
    pub timestamp: i64,
    pub ttl: Option<Duration>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub delay_until: Option<Instant>,
}

impl Message {
    pub fn new(destination: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            destination: destination.into(),
            payload,
            priority: 0,
            created_at: Instant::now(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            ttl: None,
            attempts: 0,
            max_attempts: 1,
            delay_until: None,
        }
    }

    /// True once more than `ttl` has elapsed since creation.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(self.created_at) > ttl,
            None => false,
        }
    }

    /// True when the message may be handed out at `now`.
    pub fn is_ready(&self, now: Instant) -> bool {
        self.delay_until.is_none_or(|at| at <= now)
    }

    pub fn record(&self) -> MessageRecord {
        MessageRecord {
            id: self.id.clone(),
            destination: self.destination.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
            timestamp: self.timestamp,
            ttl_ms: self.ttl.map(|d| d.as_millis() as u64),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
        }
    }
}

/// Serializable view of a message, used wherever a message leaves the
/// process (dead-letter store, transport frames).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub destination: String,
    pub payload: Payload,
    pub priority: i32,
    pub timestamp: i64,
    pub ttl_ms: Option<u64>,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// Options for `Broker::publish`.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub priority: i32,
    /// Falls back to the broker's default TTL when unset.
    pub ttl: Option<Duration>,
}

impl PublishOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Options for `Broker::enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: i32,
    pub ttl: Option<Duration>,
    /// Hold the entry back until this much time has passed.
    pub delay: Option<Duration>,
    /// Overrides the queue's retry budget for this entry.
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// One entry of `Broker::publish_batch`.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub topic: String,
    pub payload: Payload,
    pub options: PublishOptions,
}

impl BatchEntry {
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            payload,
            options: PublishOptions::default(),
        }
    }
}
