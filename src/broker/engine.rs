//! Broker engine
//!
//! `Broker` is a cheap, cloneable handle over one broker instance. It owns
//! the topic directory, the dispatch workers and every named queue; there is
//! no process-wide state, so independent brokers can coexist.
//!
//! Locking:
//! - the directory sits behind one `RwLock`; publish admission holds its
//!   write side for the whole decision, so admission order equals dispatch
//!   order and a batch is admitted all-or-nothing
//! - each queue has its own `Mutex`; queues never lock each other
//! - no broker lock is ever held across an `.await` or a handler call

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::BrokerContext;
use crate::broker::directory::Directory;
use crate::broker::dispatch::{DispatchCommand, Dispatcher, MessageHandler};
use crate::broker::events::{BrokerEvent, EventBus};
use crate::broker::message::{BatchEntry, EnqueueOptions, Message, MessageId, Payload, PublishOptions};
use crate::broker::metrics::{BrokerMetrics, MetricsRecorder, TopicMetrics};
use crate::broker::queue::{QueueEntry, QueueOptions, ReliableQueue};
use crate::broker::topic::{
    SubscriberId, Subscription, SubscriptionFilter, SubscriptionId, Topic, TopicOptions,
    is_valid_name,
};
use crate::config::Settings;
use crate::persistence::{DeadLetterSink, SledDeadLetterStore};
use crate::utils::error::{BrokerError, Result};

type SharedQueue = Arc<Mutex<ReliableQueue>>;

struct BrokerInner {
    settings: Settings,
    directory: RwLock<Directory>,
    dispatcher: Dispatcher,
    queues: Mutex<HashMap<String, SharedQueue>>,
    ctx: BrokerContext,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("topics", &self.directory().topic_count())
            .field("queues", &self.queues().len())
            .finish()
    }
}

impl Broker {
    pub fn new(settings: Settings) -> Self {
        Self::build(settings, None)
    }

    pub fn with_dead_letter_sink(settings: Settings, sink: Arc<dyn DeadLetterSink>) -> Self {
        Self::build(settings, Some(sink))
    }

    /// Build a broker, opening the sled dead-letter store when the settings name one.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let sink = SledDeadLetterStore::from_settings(&settings.persistence)?
            .map(|store| Arc::new(store) as Arc<dyn DeadLetterSink>);
        Ok(Self::build(settings, sink))
    }

    fn build(settings: Settings, sink: Option<Arc<dyn DeadLetterSink>>) -> Self {
        let ctx = BrokerContext {
            events: EventBus::new(settings.broker.event_capacity),
            metrics: Arc::new(MetricsRecorder::default()),
            sink,
        };
        Self {
            inner: Arc::new(BrokerInner {
                directory: RwLock::new(Directory::new(&settings.broker)),
                dispatcher: Dispatcher::new(settings.broker.dispatch_backlog, ctx.clone()),
                queues: Mutex::new(HashMap::new()),
                ctx,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// A new receiver for every event emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.ctx.events.subscribe()
    }

    fn emit(&self, event: BrokerEvent) {
        self.inner.ctx.events.emit(event);
    }

    fn directory(&self) -> std::sync::RwLockReadGuard<'_, Directory> {
        self.inner
            .directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn directory_mut(&self) -> std::sync::RwLockWriteGuard<'_, Directory> {
        self.inner
            .directory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, HashMap<String, SharedQueue>> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ----- topics & subscriptions -----

    pub fn create_topic(&self, name: &str, options: TopicOptions) -> Result<Topic> {
        let topic = self.directory_mut().create_topic(name, options)?.clone();
        info!(topic = name, "topic created");
        self.emit(BrokerEvent::TopicCreated {
            topic: name.to_string(),
        });
        Ok(topic)
    }

    /// Delete a topic, unsubscribing every subscription on it first.
    pub fn delete_topic(&self, name: &str) -> Result<()> {
        let removed = self.directory_mut().delete_topic(name)?;
        for subscription in removed {
            self.emit_unsubscribed(subscription);
        }
        self.inner.dispatcher.close_topic(name);

        info!(topic = name, "topic deleted");
        self.emit(BrokerEvent::TopicDeleted {
            topic: name.to_string(),
        });
        Ok(())
    }

    pub fn get_topic(&self, name: &str) -> Option<Topic> {
        self.directory().get_topic(name).cloned()
    }

    pub fn list_topics(&self) -> Vec<String> {
        self.directory().list_topics()
    }

    pub fn set_topic_active(&self, name: &str, active: bool) -> Result<()> {
        self.directory_mut().set_topic_active(name, active)
    }

    pub fn get_child_topics(&self, parent: &str) -> Vec<String> {
        self.directory().get_child_topics(parent)
    }

    pub fn get_topic_hierarchy(&self, topic: &str) -> Result<Vec<String>> {
        self.directory().get_topic_hierarchy(topic)
    }

    /// Install the handler invoked for every delivery to `subscriber_id`.
    pub fn register_subscriber(
        &self,
        subscriber_id: impl Into<SubscriberId>,
        handler: Arc<dyn MessageHandler>,
    ) {
        let subscriber_id = subscriber_id.into();
        if self
            .inner
            .dispatcher
            .register_handler(subscriber_id.clone(), handler)
        {
            debug!(subscriber_id = %subscriber_id, "handler replaced");
        }
    }

    /// Drop a subscriber's handler and all of its subscriptions.
    ///
    /// Returns the number of subscriptions removed.
    pub fn remove_subscriber(&self, subscriber_id: &str) -> usize {
        self.inner.dispatcher.remove_handler(subscriber_id);

        let removed: Vec<Subscription> = {
            let mut directory = self.directory_mut();
            directory
                .subscriptions_for(subscriber_id)
                .iter()
                .filter_map(|s| directory.unsubscribe(&s.id))
                .collect()
        };
        let count = removed.len();
        for subscription in removed {
            self.emit_unsubscribed(subscription);
        }
        info!(subscriber_id, subscriptions = count, "subscriber removed");
        count
    }

    pub fn has_subscriber(&self, subscriber_id: &str) -> bool {
        self.inner.dispatcher.has_handler(subscriber_id)
    }

    pub fn subscribe(
        &self,
        topic: &str,
        subscriber_id: impl Into<SubscriberId>,
        filter: Option<SubscriptionFilter>,
    ) -> Result<SubscriptionId> {
        let subscriber_id = subscriber_id.into();
        let id = self
            .directory_mut()
            .subscribe(topic, subscriber_id.clone(), filter)?;

        debug!(topic, subscriber_id = %subscriber_id, subscription_id = %id, "subscribed");
        self.emit(BrokerEvent::Subscribed {
            subscription_id: id.clone(),
            topic: topic.to_string(),
            subscriber_id,
        });
        Ok(id)
    }

    /// Remove a subscription. A second call for the same id is a silent no-op.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let removed = self.directory_mut().unsubscribe(subscription_id);
        match removed {
            Some(subscription) => {
                self.emit_unsubscribed(subscription);
                true
            }
            None => false,
        }
    }

    fn emit_unsubscribed(&self, subscription: Subscription) {
        debug!(subscription_id = %subscription.id, topic = %subscription.topic, "unsubscribed");
        self.emit(BrokerEvent::Unsubscribed {
            subscription_id: subscription.id,
            topic: subscription.topic,
            subscriber_id: subscription.subscriber_id,
        });
    }

    pub fn set_subscription_active(&self, subscription_id: &str, active: bool) -> Result<()> {
        self.directory_mut()
            .set_subscription_active(subscription_id, active)
    }

    pub fn get_subscription(&self, subscription_id: &str) -> Option<Subscription> {
        self.directory().get_subscription(subscription_id).cloned()
    }

    pub fn subscriptions_for(&self, subscriber_id: &str) -> Vec<Subscription> {
        self.directory().subscriptions_for(subscriber_id)
    }

    /// Active subscriptions on `topic`, in registration order.
    pub fn resolve(&self, topic: &str) -> Vec<Subscription> {
        self.directory().resolve(topic)
    }

    // ----- push path -----

    /// Publish one message.
    ///
    /// The returned id means the message was admitted; delivery to handlers
    /// happens on the topic's dispatch worker. A topic without subscribers
    /// accepts and discards the message.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Payload,
        options: PublishOptions,
    ) -> Result<MessageId> {
        let mut ids = self
            .publish_batch(vec![BatchEntry {
                topic: topic.to_string(),
                payload,
                options,
            }])
            .await?;
        ids.pop()
            .ok_or_else(|| BrokerError::MessageNotFound(topic.to_string()))
    }

    /// Publish several messages under one admission decision: either every
    /// entry is admitted or none is.
    pub async fn publish_batch(&self, entries: Vec<BatchEntry>) -> Result<Vec<MessageId>> {
        let settings = &self.inner.settings.broker;
        let dispatcher = &self.inner.dispatcher;
        let mut directory = self.directory_mut();
        let separator = directory.separator();

        let mut new_topics: Vec<&str> = Vec::new();
        for entry in &entries {
            match directory.get_topic(&entry.topic) {
                Some(topic) if !topic.is_active => {
                    return Err(BrokerError::TopicInactive(entry.topic.clone()));
                }
                Some(_) => {}
                None if !settings.auto_create_topics => {
                    return Err(BrokerError::TopicNotFound(entry.topic.clone()));
                }
                None if !is_valid_name(&entry.topic, separator) => {
                    return Err(BrokerError::InvalidTopicName(entry.topic.clone()));
                }
                None => {
                    if !new_topics.contains(&entry.topic.as_str()) {
                        new_topics.push(&entry.topic);
                    }
                }
            }
        }
        if directory.topic_count() + new_topics.len() > settings.max_topics {
            return Err(BrokerError::CapacityExceeded {
                resource: "topic",
                limit: settings.max_topics,
            });
        }

        let plans: Vec<Vec<Subscription>> =
            entries.iter().map(|e| directory.resolve(&e.topic)).collect();

        let mut demand: Vec<(String, usize)> = Vec::new();
        for (entry, subscriptions) in entries.iter().zip(&plans) {
            if subscriptions.is_empty() {
                continue;
            }
            match demand.iter_mut().find(|(t, _)| *t == entry.topic) {
                Some((_, count)) => *count += 1,
                None => demand.push((entry.topic.clone(), 1)),
            }
        }

        let senders: Vec<_> = demand
            .into_iter()
            .map(|(topic, count)| {
                let concurrency = directory
                    .get_topic(&topic)
                    .and_then(|t| t.options.max_concurrency)
                    .unwrap_or(settings.max_concurrent_handlers);
                let sender = dispatcher.sender_for(&topic, concurrency);
                (topic, sender, count)
            })
            .collect();

        let mut permits = Vec::with_capacity(senders.len());
        for (topic, sender, count) in &senders {
            match sender.try_reserve_many(*count) {
                Ok(reserved) => permits.push(reserved),
                Err(e) => {
                    warn!(topic = %topic, requested = count, error = %e, "dispatch backlog full, rejecting publish");
                    return Err(BrokerError::QueueFull {
                        name: topic.clone(),
                        capacity: dispatcher.backlog(),
                    });
                }
            }
        }

        // Admission decided; nothing below can fail.
        for name in new_topics {
            directory.create_topic(name, TopicOptions::default())?;
            info!(topic = name, "topic created on publish");
            self.emit(BrokerEvent::TopicCreated {
                topic: name.to_string(),
            });
        }

        let default_ttl = settings.default_message_ttl();
        let mut ids = Vec::with_capacity(entries.len());
        for (entry, subscriptions) in entries.iter().zip(plans) {
            let mut message = Message::new(entry.topic.as_str(), entry.payload.clone());
            message.priority = entry.options.priority;
            message.ttl = entry.options.ttl.or(default_ttl);
            let id = message.id.clone();

            directory.record_publish(&entry.topic, 1);
            MetricsRecorder::incr(&self.inner.ctx.metrics.published);
            debug!(topic = %entry.topic, message_id = %id, subscribers = subscriptions.len(), "published");
            self.emit(BrokerEvent::Published {
                message_id: id.clone(),
                topic: entry.topic.clone(),
                subscriber_count: subscriptions.len(),
            });

            if !subscriptions.is_empty() {
                let slot = senders
                    .iter()
                    .position(|(topic, _, _)| *topic == entry.topic)
                    .and_then(|idx| permits[idx].next());
                if let Some(permit) = slot {
                    permit.send(DispatchCommand::Deliver {
                        message: Arc::new(message),
                        subscriptions,
                    });
                }
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Wait until every message already admitted to `topic` has been handed
    /// to all of its handlers.
    pub async fn flush_topic(&self, topic: &str) {
        self.inner.dispatcher.flush(topic).await;
    }

    // ----- pull path -----

    fn queue(&self, name: &str) -> Option<SharedQueue> {
        self.queues().get(name).cloned()
    }

    fn queue_or_create(&self, name: &str) -> SharedQueue {
        let mut queues = self.queues();
        let queue = queues.entry(name.to_string()).or_insert_with(|| {
            debug!(queue = name, "queue created on enqueue");
            Arc::new(Mutex::new(ReliableQueue::new(
                name,
                QueueOptions::from(&self.inner.settings.queue),
                self.inner.ctx.clone(),
            )))
        });
        Arc::clone(queue)
    }

    fn with_queue<T>(&self, name: &str, f: impl FnOnce(&mut ReliableQueue) -> T) -> Option<T> {
        let queue = self.queue(name)?;
        let mut guard = queue.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut guard))
    }

    /// Create a queue with explicit options. Returns `false` if it already existed.
    pub fn create_queue(&self, name: &str, options: Option<QueueOptions>) -> bool {
        let mut queues = self.queues();
        if queues.contains_key(name) {
            return false;
        }
        let options = options.unwrap_or_else(|| QueueOptions::from(&self.inner.settings.queue));
        queues.insert(
            name.to_string(),
            Arc::new(Mutex::new(ReliableQueue::new(
                name,
                options,
                self.inner.ctx.clone(),
            ))),
        );
        info!(queue = name, "queue created");
        true
    }

    /// Drop a queue with everything in it, leases and dead letters included.
    pub fn delete_queue(&self, name: &str) -> bool {
        let removed = self.queues().remove(name).is_some();
        if removed {
            info!(queue = name, "queue deleted");
        }
        removed
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.queues().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn enqueue(&self, queue: &str, payload: Payload, options: EnqueueOptions) -> Result<MessageId> {
        let queue = self.queue_or_create(queue);
        let mut guard = queue.lock().unwrap_or_else(PoisonError::into_inner);
        guard.enqueue(payload, options)
    }

    /// Lease the next ready entry, or `None` when nothing is deliverable.
    pub fn dequeue(&self, queue: &str) -> Option<QueueEntry> {
        self.with_queue(queue, |q| q.dequeue()).flatten()
    }

    pub fn acknowledge(&self, queue: &str, message_id: &str) -> bool {
        self.with_queue(queue, |q| q.acknowledge(message_id))
            .unwrap_or(false)
    }

    pub fn reject(&self, queue: &str, message_id: &str, error: Option<String>) -> bool {
        self.with_queue(queue, |q| q.reject(message_id, error))
            .unwrap_or(false)
    }

    pub fn update_priority(&self, queue: &str, message_id: &str, priority: i32) -> Result<()> {
        self.with_queue(queue, |q| q.update_priority(message_id, priority))
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?
    }

    pub fn extend_lease(&self, queue: &str, message_id: &str, extra: Duration) -> bool {
        self.with_queue(queue, |q| q.extend_lease(message_id, extra))
            .unwrap_or(false)
    }

    /// Drop every pending entry of `queue`, returning how many were removed.
    pub fn purge_queue(&self, queue: &str) -> Result<usize> {
        self.with_queue(queue, |q| q.purge())
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
    }

    pub fn get_entry(&self, queue: &str, message_id: &str) -> Option<QueueEntry> {
        self.with_queue(queue, |q| q.get_entry(message_id)).flatten()
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<QueueEntry> {
        self.with_queue(queue, |q| q.dead_letters())
            .unwrap_or_default()
    }

    /// Offer every dead letter of `queue` to `processor`; entries it returns
    /// `true` for are removed. Returns the number removed.
    pub fn process_dead_letter_queue<F>(&self, queue: &str, processor: F) -> Result<usize>
    where
        F: FnMut(&QueueEntry) -> bool,
    {
        let processed = self
            .with_queue(queue, |q| q.process_dead_letters(processor))
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        debug!(queue, processed, "processed dead letters");
        Ok(processed)
    }

    /// One reaper pass over every queue: return expired leases and drop
    /// expired pending entries. Returns the number of entries touched.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let queues: Vec<SharedQueue> = self.queues().values().cloned().collect();
        queues
            .iter()
            .map(|queue| {
                let mut guard = queue.lock().unwrap_or_else(PoisonError::into_inner);
                guard.reclaim_expired_leases(now) + guard.purge_expired(now)
            })
            .sum()
    }

    /// Spawn the background reaper. It stops once the last broker handle is dropped.
    pub fn start_lease_reaper(&self) -> JoinHandle<()> {
        let weak: Weak<BrokerInner> = Arc::downgrade(&self.inner);
        let period = self.inner.settings.queue.reaper_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let touched = Broker { inner }.reap_expired();
                if touched > 0 {
                    debug!(touched, "lease reaper pass");
                }
            }
            debug!("lease reaper stopped");
        })
    }

    // ----- metrics -----

    pub fn get_metrics(&self) -> BrokerMetrics {
        let topics: BTreeMap<_, _> = self
            .directory()
            .topics()
            .map(|t| {
                (
                    t.name.clone(),
                    TopicMetrics {
                        subscriber_count: t.subscriber_count(),
                        message_count: t.message_count,
                        is_active: t.is_active,
                    },
                )
            })
            .collect();

        let queues: Vec<(String, SharedQueue)> = self
            .queues()
            .iter()
            .map(|(name, q)| (name.clone(), Arc::clone(q)))
            .collect();
        let queues: BTreeMap<_, _> = queues
            .into_iter()
            .map(|(name, q)| {
                let metrics = q.lock().unwrap_or_else(PoisonError::into_inner).metrics();
                (name, metrics)
            })
            .collect();

        self.inner.ctx.metrics.snapshot(topics, queues)
    }
}
