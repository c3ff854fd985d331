use serde::{Deserialize, Serialize};

use crate::broker::metrics::BrokerMetrics;

/// Requests a remote client may send. Payloads travel as encoded text and are
/// decoded by the gateway's `Serializer`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "create_topic")]
    CreateTopic {
        topic: String,
        #[serde(default)]
        max_concurrency: Option<usize>,
    },
    #[serde(rename = "delete_topic")]
    DeleteTopic { topic: String },
    #[serde(rename = "subscribe")]
    Subscribe { topic: String },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { subscription_id: String },
    #[serde(rename = "publish")]
    Publish {
        topic: String,
        payload: String,
        #[serde(default)]
        priority: i32,
        #[serde(default)]
        ttl_ms: Option<u64>,
    },
    #[serde(rename = "enqueue")]
    Enqueue {
        queue: String,
        payload: String,
        #[serde(default)]
        priority: i32,
        #[serde(default)]
        ttl_ms: Option<u64>,
        #[serde(default)]
        delay_ms: Option<u64>,
        #[serde(default)]
        max_attempts: Option<u32>,
    },
    #[serde(rename = "dequeue")]
    Dequeue { queue: String },
    #[serde(rename = "ack")]
    Ack { queue: String, message_id: String },
    #[serde(rename = "reject")]
    Reject {
        queue: String,
        message_id: String,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "metrics")]
    Metrics,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "ok")]
    Ok {},
    #[serde(rename = "subscribed")]
    Subscribed { subscription_id: String },
    #[serde(rename = "accepted")]
    Accepted { message_id: String },
    #[serde(rename = "lease")]
    Lease {
        message_id: String,
        payload: String,
        priority: i32,
        attempts: u32,
    },
    #[serde(rename = "empty")]
    Empty {},
    /// Outcome of an ack or reject; `false` means no live lease matched.
    #[serde(rename = "settled")]
    Settled { applied: bool },
    /// A push-path delivery.
    #[serde(rename = "message")]
    Message {
        topic: String,
        message_id: String,
        payload: String,
        timestamp: i64,
    },
    #[serde(rename = "metrics")]
    Metrics { metrics: BrokerMetrics },
    #[serde(rename = "error")]
    Error { message: String },
}
