use super::codec::{JsonSerializer, Serializer};
use super::message::ServerMessage;
use super::{Authorizer, Gateway, Operation};
use crate::broker::Broker;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

struct DenyPublish;

impl Authorizer for DenyPublish {
    fn authorize(&self, _client_id: &str, operation: &Operation<'_>) -> bool {
        !matches!(operation, Operation::Publish(_))
    }
}

#[tokio::test]
async fn test_handle_subscribe() {
    let gateway = Gateway::new(Broker::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    let client = gateway.connect(tx);

    let create = json!({ "type": "create_topic", "topic": "test_topic" }).to_string();
    assert!(matches!(
        gateway.handle_message(&client.id, &create).await,
        ServerMessage::Ok {}
    ));

    let msg = json!({ "type": "subscribe", "topic": "test_topic" }).to_string();
    let reply = gateway.handle_message(&client.id, &msg).await;

    let ServerMessage::Subscribed { subscription_id } = reply else {
        panic!("Expected Subscribed, got {reply:?}");
    };
    let subscription = gateway.broker().get_subscription(&subscription_id).unwrap();
    assert_eq!(subscription.subscriber_id, client.id);
}

#[tokio::test]
async fn test_handle_subscribe_unknown_topic_is_error() {
    let gateway = Gateway::new(Broker::default());
    let msg = json!({ "type": "subscribe", "topic": "missing" }).to_string();

    match gateway.handle_message("c1", &msg).await {
        ServerMessage::Error { message } => assert_eq!(message, "topic 'missing' not found"),
        other => panic!("Expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handle_publish_delivers_to_connected_client() {
    let gateway = Gateway::new(Broker::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = gateway.connect(tx);

    gateway
        .broker()
        .create_topic("test_topic", Default::default())
        .unwrap();
    gateway
        .broker()
        .subscribe("test_topic", client.id.clone(), None)
        .unwrap();

    let msg = json!({
        "type": "publish",
        "topic": "test_topic",
        "payload": "{\"temp\":25}"
    })
    .to_string();
    let reply = gateway.handle_message("publisher", &msg).await;
    assert!(matches!(reply, ServerMessage::Accepted { .. }));

    gateway.broker().flush_topic("test_topic").await;

    match rx.try_recv().unwrap() {
        ServerMessage::Message { topic, payload, .. } => {
            assert_eq!(topic, "test_topic");
            assert_eq!(payload, r#"{"temp":25}"#);
        }
        other => panic!("Expected a message frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_denied_request_never_reaches_broker() {
    let gateway = Gateway::new(Broker::default()).with_authorizer(Arc::new(DenyPublish));

    let msg = json!({ "type": "publish", "topic": "orders", "payload": "1" }).to_string();
    match gateway.handle_message("c1", &msg).await {
        ServerMessage::Error { message } => assert!(message.starts_with("unauthorized")),
        other => panic!("Expected Error, got {other:?}"),
    }
    // auto-create would have made the topic had the publish gone through
    assert!(gateway.broker().get_topic("orders").is_none());
}

#[tokio::test]
async fn test_queue_round_trip_over_frames() {
    let gateway = Gateway::new(Broker::default());

    let enqueue = json!({ "type": "enqueue", "queue": "jobs", "payload": "{\"n\":1}", "priority": 3 })
        .to_string();
    let ServerMessage::Accepted { message_id } = gateway.handle_message("c1", &enqueue).await
    else {
        panic!("Expected Accepted");
    };

    let dequeue = json!({ "type": "dequeue", "queue": "jobs" }).to_string();
    match gateway.handle_message("c1", &dequeue).await {
        ServerMessage::Lease {
            message_id: leased,
            payload,
            priority,
            attempts,
        } => {
            assert_eq!(leased, message_id);
            assert_eq!(payload, r#"{"n":1}"#);
            assert_eq!(priority, 3);
            assert_eq!(attempts, 0);
        }
        other => panic!("Expected Lease, got {other:?}"),
    }

    let ack = json!({ "type": "ack", "queue": "jobs", "message_id": message_id }).to_string();
    assert!(matches!(
        gateway.handle_message("c1", &ack).await,
        ServerMessage::Settled { applied: true }
    ));
    assert!(matches!(
        gateway.handle_message("c1", &ack).await,
        ServerMessage::Settled { applied: false }
    ));
    assert!(matches!(
        gateway.handle_message("c1", &dequeue).await,
        ServerMessage::Empty {}
    ));
}

#[tokio::test]
async fn test_invalid_frame_is_reported() {
    let gateway = Gateway::new(Broker::default());
    match gateway.handle_message("c1", "not json").await {
        ServerMessage::Error { message } => assert!(message.starts_with("invalid message")),
        other => panic!("Expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_removes_subscriptions() {
    let gateway = Gateway::new(Broker::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    let client = gateway.connect(tx);
    gateway.broker().create_topic("a", Default::default()).unwrap();
    gateway.broker().create_topic("b", Default::default()).unwrap();
    gateway.broker().subscribe("a", client.id.clone(), None).unwrap();
    gateway.broker().subscribe("b", client.id.clone(), None).unwrap();

    assert_eq!(gateway.disconnect(&client.id), 2);
    assert!(gateway.broker().resolve("a").is_empty());
    assert!(!gateway.broker().has_subscriber(&client.id));
}

#[test]
fn test_json_serializer_wraps_plain_text() {
    let lenient = JsonSerializer::default();
    assert_eq!(lenient.deserialize(b"hello").unwrap(), json!("hello"));
    assert_eq!(lenient.deserialize(b"{\"a\":1}").unwrap(), json!({ "a": 1 }));

    let strict = JsonSerializer { strict: true };
    assert!(strict.deserialize(b"hello").is_err());
    assert_eq!(strict.serialize(&json!([1, 2])).unwrap(), b"[1,2]".to_vec());
}
