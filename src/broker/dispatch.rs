//! Dispatch engine (push path)
//!
//! Each topic with subscribers gets a dispatch worker: a spawned task fed by
//! a bounded command channel. The worker takes one message at a time and fans
//! it out to the subscriptions resolved at publish time:
//!
//! 1. Subscriptions are visited in registration order; filters are applied first.
//! 2. Invocations are driven by the worker itself through a `FuturesUnordered`,
//!    so they start in registration order. Once `max_concurrency` of them are
//!    in flight, the next one waits for a slot.
//! 3. The TTL is checked once a slot is free, right before the call.
//! 4. All invocations for a message finish before the next message starts,
//!    so a later publish never overtakes an earlier one on the same topic.
//!
//! Handler failures and filter panics are isolated to their own subscription.
//!
//! Admission happens in the broker facade through `try_reserve` on the
//! worker's channel: a full backlog is reported to the publisher immediately.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::broker::BrokerContext;
use crate::broker::events::BrokerEvent;
use crate::broker::message::Message;
use crate::broker::metrics::MetricsRecorder;
use crate::broker::topic::{SubscriberId, Subscription};
use crate::persistence::{DeadLetterRecord, DeadLetterSource};
use crate::utils::error::{BrokerError, HandlerError};

/// Callback invoked for every message delivered to a subscriber.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Arc<Message>) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Arc<Message>) -> Result<(), HandlerError> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a `MessageHandler`.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

type HandlerRegistry = Arc<RwLock<HashMap<SubscriberId, Arc<dyn MessageHandler>>>>;

#[derive(Debug)]
pub(crate) enum DispatchCommand {
    Deliver {
        message: Arc<Message>,
        subscriptions: Vec<Subscription>,
    },
    /// Answered once every earlier command on the topic has completed.
    Flush(oneshot::Sender<()>),
}

pub(crate) struct Dispatcher {
    workers: Mutex<HashMap<String, mpsc::Sender<DispatchCommand>>>,
    handlers: HandlerRegistry,
    backlog: usize,
    ctx: BrokerContext,
}

impl Dispatcher {
    pub(crate) fn new(backlog: usize, ctx: BrokerContext) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            backlog: backlog.max(1),
            ctx,
        }
    }

    pub(crate) fn backlog(&self) -> usize {
        self.backlog
    }

    pub(crate) fn register_handler(
        &self,
        subscriber_id: SubscriberId,
        handler: Arc<dyn MessageHandler>,
    ) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscriber_id, handler)
            .is_some()
    }

    pub(crate) fn remove_handler(&self, subscriber_id: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subscriber_id)
            .is_some()
    }

    pub(crate) fn has_handler(&self, subscriber_id: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(subscriber_id)
    }

    /// Command channel of the worker for `topic`, spawning the worker if needed.
    pub(crate) fn sender_for(
        &self,
        topic: &str,
        max_concurrency: usize,
    ) -> mpsc::Sender<DispatchCommand> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = workers.get(topic).filter(|s| !s.is_closed()) {
            return sender.clone();
        }

        let (tx, rx) = mpsc::channel(self.backlog);
        let worker = TopicWorker {
            topic: topic.to_string(),
            max_concurrency: max_concurrency.max(1),
            handlers: Arc::clone(&self.handlers),
            ctx: self.ctx.clone(),
        };
        tokio::spawn(worker.run(rx));
        debug!(topic, max_concurrency, "dispatch worker started");

        workers.insert(topic.to_string(), tx.clone());
        tx
    }

    /// Stop accepting work for `topic`; the worker drains what it already has.
    pub(crate) fn close_topic(&self, topic: &str) {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
    }

    /// Wait until every message admitted to `topic` so far has been dispatched.
    pub(crate) async fn flush(&self, topic: &str) {
        let sender = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned();
        let Some(sender) = sender else {
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        if sender.send(DispatchCommand::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

struct TopicWorker {
    topic: String,
    max_concurrency: usize,
    handlers: HandlerRegistry,
    ctx: BrokerContext,
}

impl TopicWorker {
    async fn run(self, mut rx: mpsc::Receiver<DispatchCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                DispatchCommand::Deliver {
                    message,
                    subscriptions,
                } => self.deliver(message, subscriptions).await,
                DispatchCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!(topic = %self.topic, "dispatch worker stopped");
    }

    async fn deliver(&self, message: Arc<Message>, subscriptions: Vec<Subscription>) {
        let mut in_flight: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();

        for subscription in subscriptions {
            match panic::catch_unwind(AssertUnwindSafe(|| subscription.accepts(&message))) {
                Ok(true) => {}
                Ok(false) => {
                    trace!(subscription_id = %subscription.id, message_id = %message.id, "filtered out");
                    continue;
                }
                Err(_) => {
                    report_failure(&self.ctx, &message, &subscription, "filter panicked".to_string());
                    continue;
                }
            }

            while in_flight.len() >= self.max_concurrency {
                in_flight.next().await;
            }

            if message.is_expired(Instant::now()) {
                self.expire(&message);
                continue;
            }

            let handler = self
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&subscription.subscriber_id)
                .cloned();
            let Some(handler) = handler else {
                let error = BrokerError::SubscriberNotRegistered(subscription.subscriber_id.clone());
                warn!(subscription_id = %subscription.id, %error, "skipping delivery");
                report_failure(&self.ctx, &message, &subscription, error.to_string());
                continue;
            };

            MetricsRecorder::incr(&self.ctx.metrics.handler_invocations);
            let message = Arc::clone(&message);
            let ctx = self.ctx.clone();
            // Polled by this worker, so invocations start in registration order.
            in_flight.push(async move {
                let outcome = AssertUnwindSafe(handler.handle(Arc::clone(&message)))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(HandlerError::new("handler panicked")));

                match outcome {
                    Ok(()) => {
                        ctx.metrics
                            .record_dispatch_latency(message.created_at.elapsed());
                        MetricsRecorder::incr(&ctx.metrics.dispatched);
                        ctx.events.emit(BrokerEvent::Dispatched {
                            message_id: message.id.clone(),
                            subscription_id: subscription.id.clone(),
                        });
                    }
                    Err(e) => report_failure(&ctx, &message, &subscription, e.message),
                }
            }
            .boxed());
        }

        while in_flight.next().await.is_some() {}
    }

    fn expire(&self, message: &Message) {
        debug!(topic = %self.topic, message_id = %message.id, "ttl elapsed before delivery");
        MetricsRecorder::incr(&self.ctx.metrics.expired);
        self.ctx.events.emit(BrokerEvent::Expired {
            message_id: message.id.clone(),
            destination: self.topic.clone(),
            reason: BrokerError::MessageExpired(message.id.clone()).to_string(),
        });
    }
}

fn report_failure(ctx: &BrokerContext, message: &Message, subscription: &Subscription, error: String) {
    warn!(
        message_id = %message.id,
        subscription_id = %subscription.id,
        %error,
        "delivery failed"
    );
    MetricsRecorder::incr(&ctx.metrics.handler_failures);
    ctx.events.emit(BrokerEvent::HandlerFailed {
        message_id: message.id.clone(),
        subscription_id: subscription.id.clone(),
        error: error.clone(),
    });
    ctx.events.emit(BrokerEvent::DeadLetter {
        message_id: message.id.clone(),
        destination: message.destination.clone(),
        error: error.clone(),
    });
    ctx.forward_dead_letter(&DeadLetterRecord::new(
        message.record(),
        error,
        DeadLetterSource::Handler {
            subscription_id: subscription.id.clone(),
        },
    ));
}
