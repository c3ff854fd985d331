//! The `persistence` module provides the optional dead-letter sink.
//!
//! The broker itself is memory-only. When a sink is configured, every failed
//! push delivery and every dead-lettered queue entry is handed to it as a
//! `DeadLetterRecord`; sink failures are logged and never reach producers.

pub mod sled_store;

use serde::{Deserialize, Serialize};

use crate::broker::message::MessageRecord;
use crate::utils::error::Result;

pub use sled_store::SledDeadLetterStore;

/// Where a dead letter came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadLetterSource {
    /// A subscriber handler failed on the push path.
    Handler { subscription_id: String },
    /// A queue entry exhausted its retry budget.
    Queue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub message: MessageRecord,
    pub error: String,
    pub source: DeadLetterSource,
    /// Unix milliseconds when the record was produced.
    pub recorded_at: i64,
}

impl DeadLetterRecord {
    pub fn new(message: MessageRecord, error: impl Into<String>, source: DeadLetterSource) -> Self {
        Self {
            message,
            error: error.into(),
            source,
            recorded_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Receives `(message, error)` pairs for failed deliveries.
pub trait DeadLetterSink: Send + Sync {
    fn store(&self, record: &DeadLetterRecord) -> Result<()>;
}

#[cfg(test)]
mod tests;
