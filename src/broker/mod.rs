//! relaybus broker
//!
//! - `directory`: topics, hierarchy and subscriptions
//! - `dispatch`: push-path fan-out to subscriber handlers
//! - `queue`: pull-path reliable queues with leases, retries and dead letters
//! - `engine`: the `Broker` facade tying them together
//! - `events` / `metrics`: observability shared by both paths

pub mod directory;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod topic;

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::broker::events::EventBus;
use crate::broker::metrics::MetricsRecorder;
use crate::persistence::{DeadLetterRecord, DeadLetterSink};

pub use dispatch::{MessageHandler, handler_fn};
pub use engine::Broker;

/// Observability and dead-letter plumbing shared by dispatch workers and queues.
#[derive(Clone)]
pub(crate) struct BrokerContext {
    pub(crate) events: EventBus,
    pub(crate) metrics: Arc<MetricsRecorder>,
    pub(crate) sink: Option<Arc<dyn DeadLetterSink>>,
}

impl BrokerContext {
    /// Hand a record to the sink, if one is configured. Failures are logged only.
    pub(crate) fn forward_dead_letter(&self, record: &DeadLetterRecord) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Err(e) = sink.store(record) {
            warn!(message_id = %record.message.id, error = %e, "dead-letter sink rejected record");
        }
    }
}

impl fmt::Debug for BrokerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerContext")
            .field("events", &self.events)
            .field("metrics", &self.metrics)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
