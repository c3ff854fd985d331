use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::broker::dispatch::MessageHandler;
use crate::broker::message::Message;
use crate::transport::codec::{JsonSerializer, Serializer};
use crate::transport::message::ServerMessage;
use crate::utils::error::HandlerError;

/// A remote subscriber reachable through an outbound frame channel.
///
/// Registered with the broker as a `MessageHandler`: every delivery is encoded
/// and pushed onto `sender` as a `ServerMessage::Message` frame.
#[derive(Clone)]
pub struct Client {
    /// Unique identifier, also used as the subscriber id.
    pub id: String,

    /// Channel towards the connection's writer.
    pub sender: UnboundedSender<ServerMessage>,

    serializer: Arc<dyn Serializer>,
}

impl Client {
    pub fn new(sender: UnboundedSender<ServerMessage>) -> Self {
        Self::with_serializer(sender, Arc::new(JsonSerializer::default()))
    }

    pub fn with_serializer(
        sender: UnboundedSender<ServerMessage>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        Self {
            id: format!("client-{}", Uuid::new_v4()),
            sender,
            serializer,
        }
    }
}

#[async_trait]
impl MessageHandler for Client {
    async fn handle(&self, message: Arc<Message>) -> Result<(), HandlerError> {
        let bytes = self
            .serializer
            .serialize(&message.payload)
            .map_err(|e| HandlerError::new(e.to_string()))?;

        self.sender
            .send(ServerMessage::Message {
                topic: message.destination.clone(),
                message_id: message.id.clone(),
                payload: String::from_utf8_lossy(&bytes).into_owned(),
                timestamp: message.timestamp,
            })
            .map_err(|_| HandlerError::new(format!("{} disconnected", self.id)))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("id", &self.id).finish()
    }
}
