use super::pubsub_client::Client;
use crate::broker::dispatch::MessageHandler;
use crate::broker::message::Message;
use crate::transport::message::ServerMessage;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

#[test]
fn test_client_new() {
    let (tx, _) = mpsc::unbounded_channel::<ServerMessage>();
    let client = Client::new(tx);
    assert!(client.id.starts_with("client-"));
}

#[tokio::test]
async fn test_client_forwards_delivery_frame() {
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let client = Client::new(tx);

    let message = Arc::new(Message::new("chat", json!({ "text": "hi" })));
    client.handle(Arc::clone(&message)).await.unwrap();

    match rx.try_recv().unwrap() {
        ServerMessage::Message {
            topic,
            message_id,
            payload,
            ..
        } => {
            assert_eq!(topic, "chat");
            assert_eq!(message_id, message.id);
            assert_eq!(payload, r#"{"text":"hi"}"#);
        }
        other => panic!("Expected a message frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_client_with_closed_channel_fails() {
    let (tx, rx) = mpsc::unbounded_channel::<ServerMessage>();
    let client = Client::new(tx);
    drop(rx);

    let err = client
        .handle(Arc::new(Message::new("chat", json!("x"))))
        .await
        .unwrap_err();
    assert!(err.message.contains("disconnected"));
}
