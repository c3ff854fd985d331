//! Broker lifecycle events.
//!
//! Every observable transition is published as a `BrokerEvent` on a
//! broadcast channel. Listeners are fire-and-forget: sending with no
//! receivers is not an error, and a slow receiver only lags itself.

use tokio::sync::broadcast;

use crate::broker::message::MessageId;
use crate::broker::topic::{SubscriberId, SubscriptionId};

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    TopicCreated {
        topic: String,
    },
    TopicDeleted {
        topic: String,
    },
    Subscribed {
        subscription_id: SubscriptionId,
        topic: String,
        subscriber_id: SubscriberId,
    },
    Unsubscribed {
        subscription_id: SubscriptionId,
        topic: String,
        subscriber_id: SubscriberId,
    },
    Published {
        message_id: MessageId,
        topic: String,
        subscriber_count: usize,
    },
    Dispatched {
        message_id: MessageId,
        subscription_id: SubscriptionId,
    },
    HandlerFailed {
        message_id: MessageId,
        subscription_id: SubscriptionId,
        error: String,
    },
    /// A message was dropped because its TTL elapsed before delivery.
    Expired {
        message_id: MessageId,
        destination: String,
        reason: String,
    },
    DeadLetter {
        message_id: MessageId,
        destination: String,
        error: String,
    },
    /// The dead-letter area of a queue overflowed and dropped its oldest entry.
    DeadLetterEvicted {
        message_id: MessageId,
        queue: String,
    },
    Enqueued {
        message_id: MessageId,
        queue: String,
        priority: i32,
    },
    Dequeued {
        message_id: MessageId,
        queue: String,
        attempts: u32,
    },
    Acknowledged {
        message_id: MessageId,
        queue: String,
    },
    Rejected {
        message_id: MessageId,
        queue: String,
        attempts: u32,
        error: Option<String>,
    },
    /// A lease timed out and the entry went back to pending.
    Returned {
        message_id: MessageId,
        queue: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: BrokerEvent) {
        // no receivers is fine
        let _ = self.sender.send(event);
    }
}
