//! The `transport` module is the ingress adapter between remote clients and
//! the broker.
//!
//! It does not listen on any socket. A connection layer hands each text frame
//! to `Gateway::handle_message`, which decodes the `ClientMessage`, consults
//! the `Authorizer` before touching the broker, performs the operation and
//! answers with a `ServerMessage`. Payloads are decoded and encoded with the
//! gateway's `Serializer` at this boundary only.

pub mod codec;
pub mod message;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::broker::message::{EnqueueOptions, PublishOptions};
use crate::broker::topic::TopicOptions;
use crate::client::Client;
use crate::transport::codec::{JsonSerializer, Serializer};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::{BrokerError, Result};

/// Broker operation a request wants to perform, as seen by the authorizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation<'a> {
    CreateTopic(&'a str),
    DeleteTopic(&'a str),
    Subscribe(&'a str),
    Unsubscribe(&'a str),
    Publish(&'a str),
    Enqueue(&'a str),
    Dequeue(&'a str),
    Acknowledge(&'a str),
    Reject(&'a str),
    Metrics,
}

impl ClientMessage {
    pub fn operation(&self) -> Operation<'_> {
        match self {
            ClientMessage::CreateTopic { topic, .. } => Operation::CreateTopic(topic),
            ClientMessage::DeleteTopic { topic } => Operation::DeleteTopic(topic),
            ClientMessage::Subscribe { topic } => Operation::Subscribe(topic),
            ClientMessage::Unsubscribe { subscription_id } => Operation::Unsubscribe(subscription_id),
            ClientMessage::Publish { topic, .. } => Operation::Publish(topic),
            ClientMessage::Enqueue { queue, .. } => Operation::Enqueue(queue),
            ClientMessage::Dequeue { queue } => Operation::Dequeue(queue),
            ClientMessage::Ack { queue, .. } => Operation::Acknowledge(queue),
            ClientMessage::Reject { queue, .. } => Operation::Reject(queue),
            ClientMessage::Metrics => Operation::Metrics,
        }
    }
}

/// Caller-side gate consulted before every broker operation.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, client_id: &str, operation: &Operation<'_>) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _client_id: &str, _operation: &Operation<'_>) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct Gateway {
    broker: Broker,
    authorizer: Arc<dyn Authorizer>,
    serializer: Arc<dyn Serializer>,
}

impl Gateway {
    pub fn new(broker: Broker) -> Self {
        Self {
            broker,
            authorizer: Arc::new(AllowAll),
            serializer: Arc::new(JsonSerializer::default()),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Register a new connection; deliveries for its subscriptions go to `sender`.
    pub fn connect(&self, sender: UnboundedSender<ServerMessage>) -> Client {
        let client = Client::with_serializer(sender, Arc::clone(&self.serializer));
        self.broker
            .register_subscriber(client.id.clone(), Arc::new(client.clone()));
        debug!(client_id = %client.id, "client connected");
        client
    }

    /// Forget a connection and every subscription it held.
    pub fn disconnect(&self, client_id: &str) -> usize {
        let removed = self.broker.remove_subscriber(client_id);
        debug!(client_id, subscriptions = removed, "client disconnected");
        removed
    }

    /// Decode one text frame, run it against the broker and build the reply.
    pub async fn handle_message(&self, client_id: &str, text: &str) -> ServerMessage {
        let request = match serde_json::from_str::<ClientMessage>(text) {
            Ok(request) => request,
            Err(e) => {
                warn!(client_id, error = %e, "invalid client message");
                return ServerMessage::Error {
                    message: format!("invalid message: {e}"),
                };
            }
        };

        if !self.authorizer.authorize(client_id, &request.operation()) {
            warn!(client_id, operation = ?request.operation(), "request denied");
            return ServerMessage::Error {
                message: BrokerError::Unauthorized(client_id.to_string()).to_string(),
            };
        }

        match self.apply(client_id, request).await {
            Ok(reply) => reply,
            Err(e) => ServerMessage::Error {
                message: e.to_string(),
            },
        }
    }

    fn decode(&self, payload: &str) -> Result<crate::broker::message::Payload> {
        self.serializer.deserialize(payload.as_bytes())
    }

    async fn apply(&self, client_id: &str, request: ClientMessage) -> Result<ServerMessage> {
        let broker = &self.broker;
        let reply = match request {
            ClientMessage::CreateTopic {
                topic,
                max_concurrency,
            } => {
                let options = TopicOptions {
                    max_concurrency,
                    ..TopicOptions::default()
                };
                broker.create_topic(&topic, options)?;
                ServerMessage::Ok {}
            }
            ClientMessage::DeleteTopic { topic } => {
                broker.delete_topic(&topic)?;
                ServerMessage::Ok {}
            }
            ClientMessage::Subscribe { topic } => {
                let subscription_id = broker.subscribe(&topic, client_id, None)?;
                ServerMessage::Subscribed { subscription_id }
            }
            ClientMessage::Unsubscribe { subscription_id } => {
                broker.unsubscribe(&subscription_id);
                ServerMessage::Ok {}
            }
            ClientMessage::Publish {
                topic,
                payload,
                priority,
                ttl_ms,
            } => {
                let options = PublishOptions {
                    priority,
                    ttl: ttl_ms.map(Duration::from_millis),
                };
                let message_id = broker.publish(&topic, self.decode(&payload)?, options).await?;
                ServerMessage::Accepted { message_id }
            }
            ClientMessage::Enqueue {
                queue,
                payload,
                priority,
                ttl_ms,
                delay_ms,
                max_attempts,
            } => {
                let options = EnqueueOptions {
                    priority,
                    ttl: ttl_ms.map(Duration::from_millis),
                    delay: delay_ms.map(Duration::from_millis),
                    max_attempts,
                };
                let message_id = broker.enqueue(&queue, self.decode(&payload)?, options)?;
                ServerMessage::Accepted { message_id }
            }
            ClientMessage::Dequeue { queue } => match broker.dequeue(&queue) {
                Some(entry) => {
                    let bytes = self.serializer.serialize(&entry.message.payload)?;
                    ServerMessage::Lease {
                        message_id: entry.message.id,
                        payload: String::from_utf8_lossy(&bytes).into_owned(),
                        priority: entry.message.priority,
                        attempts: entry.message.attempts,
                    }
                }
                None => ServerMessage::Empty {},
            },
            ClientMessage::Ack { queue, message_id } => ServerMessage::Settled {
                applied: broker.acknowledge(&queue, &message_id),
            },
            ClientMessage::Reject {
                queue,
                message_id,
                error,
            } => ServerMessage::Settled {
                applied: broker.reject(&queue, &message_id, error),
            },
            ClientMessage::Metrics => ServerMessage::Metrics {
                metrics: broker.get_metrics(),
            },
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests;
