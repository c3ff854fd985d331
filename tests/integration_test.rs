use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use relaybus::broker::handler_fn;
use relaybus::broker::message::{EnqueueOptions, PublishOptions};
use relaybus::broker::queue::{EntryState, QueueOptions};
use relaybus::broker::topic::TopicOptions;
use relaybus::config::Settings;
use relaybus::persistence::{DeadLetterSource, SledDeadLetterStore};
use relaybus::transport::Gateway;
use relaybus::transport::message::ServerMessage;
use relaybus::{Broker, HandlerError};
use serde_json::json;
use tokio::sync::mpsc;

#[tokio::test]
async fn integration_pubsub_end_to_end() {
    let gateway = Gateway::new(Broker::default());

    let (tx_a, _rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let client_a = gateway.connect(tx_a);
    let client_b = gateway.connect(tx_b);

    let create = json!({ "type": "create_topic", "topic": "test" }).to_string();
    gateway.handle_message(&client_a.id, &create).await;

    let sub_msg = json!({ "type": "subscribe", "topic": "test" }).to_string();
    let reply = gateway.handle_message(&client_b.id, &sub_msg).await;
    assert!(matches!(reply, ServerMessage::Subscribed { .. }));

    let pub_msg = json!({
        "type": "publish",
        "topic": "test",
        "payload": "hello world"
    })
    .to_string();
    let reply = gateway.handle_message(&client_a.id, &pub_msg).await;
    let ServerMessage::Accepted { message_id } = reply else {
        panic!("publish was not accepted: {reply:?}");
    };

    let frame = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
        .await
        .expect("client B should receive the message")
        .expect("channel open");

    match frame {
        ServerMessage::Message {
            topic,
            message_id: delivered,
            payload,
            ..
        } => {
            assert_eq!(topic, "test");
            assert_eq!(delivered, message_id);
            assert_eq!(payload, r#""hello world""#);
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    assert_eq!(gateway.disconnect(&client_b.id), 1);
    let ServerMessage::Metrics { metrics } = gateway
        .handle_message(&client_a.id, r#"{"type":"metrics"}"#)
        .await
    else {
        panic!("expected metrics");
    };
    assert_eq!(metrics.topics["test"].subscriber_count, 0);
    assert_eq!(metrics.published, 1);
}

#[tokio::test]
async fn integration_worker_pool_drains_queue() {
    let broker = Broker::default();
    for n in 0..20 {
        broker
            .enqueue("emails", json!({ "n": n }), EnqueueOptions::default())
            .unwrap();
    }

    let processed = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let broker = broker.clone();
            let processed = Arc::clone(&processed);
            tokio::spawn(async move {
                while let Some(entry) = broker.dequeue("emails") {
                    tokio::task::yield_now().await;
                    assert!(broker.acknowledge("emails", entry.id()));
                    processed.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(processed.load(Ordering::SeqCst), 20);
    let metrics = broker.get_metrics();
    assert_eq!(metrics.acknowledged, 20);
    assert_eq!(metrics.queues["emails"].pending, 0);
    assert_eq!(metrics.queues["emails"].leased, 0);
}

#[tokio::test]
async fn integration_dead_letters_reach_sled_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.persistence.dead_letter_path = Some(dir.path().join("dlq").to_string_lossy().into_owned());

    let store = Arc::new(
        SledDeadLetterStore::from_settings(&settings.persistence)
            .unwrap()
            .expect("dead-letter path is set"),
    );
    let broker = Broker::with_dead_letter_sink(settings, store.clone());
    broker.register_subscriber(
        "flaky",
        handler_fn(|_message| async move { Err(HandlerError::new("downstream unavailable")) }),
    );
    broker.create_topic("payments", TopicOptions::default()).unwrap();
    broker.subscribe("payments", "flaky", None).unwrap();
    broker
        .publish("payments", json!({ "amount": 10 }), PublishOptions::default())
        .await
        .unwrap();
    broker.flush_topic("payments").await;

    broker.create_queue(
        "invoices",
        Some(QueueOptions {
            max_attempts: 1,
            ..QueueOptions::default()
        }),
    );
    let id = broker
        .enqueue("invoices", json!("inv-1"), EnqueueOptions::default())
        .unwrap();
    broker.dequeue("invoices").unwrap();
    broker.reject("invoices", &id, Some("bad address".to_string()));
    assert_eq!(
        broker.get_entry("invoices", &id).unwrap().state,
        EntryState::DeadLettered
    );

    let payments = store.load("payments").unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].error, "downstream unavailable");
    assert!(matches!(payments[0].source, DeadLetterSource::Handler { .. }));

    let invoices = store.load("invoices").unwrap();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].message.id, id);
    assert_eq!(invoices[0].error, "bad address");
}
