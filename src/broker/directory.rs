//! Topic & subscription directory
//!
//! Owns topic metadata and the subscriptions attached to each topic. The
//! directory has no knowledge of dispatch or queues; the broker facade wraps
//! it in a lock and turns its return values into events.

use std::collections::{BTreeSet, HashMap};

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::broker::topic::{
    SubscriberId, Subscription, SubscriptionFilter, SubscriptionId, Topic, TopicOptions, ancestry,
    child_of, is_valid_name,
};
use crate::config::BrokerSettings;
use crate::utils::error::{BrokerError, Result};

#[derive(Debug)]
pub struct Directory {
    topics: HashMap<String, Topic>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    max_topics: usize,
    max_subscriptions: usize,
    separator: char,
    next_seq: u64,
}

impl Directory {
    pub fn new(settings: &BrokerSettings) -> Self {
        Self {
            topics: HashMap::new(),
            subscriptions: HashMap::new(),
            max_topics: settings.max_topics,
            max_subscriptions: settings.max_subscriptions,
            separator: settings.topic_separator,
            next_seq: 0,
        }
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    /// Register a new topic.
    pub fn create_topic(&mut self, name: &str, options: TopicOptions) -> Result<&Topic> {
        if !is_valid_name(name, self.separator) {
            return Err(BrokerError::InvalidTopicName(name.to_string()));
        }
        if self.topics.contains_key(name) {
            return Err(BrokerError::TopicAlreadyExists(name.to_string()));
        }
        if self.topics.len() >= self.max_topics {
            return Err(BrokerError::CapacityExceeded {
                resource: "topic",
                limit: self.max_topics,
            });
        }

        debug!(topic = name, "topic created");
        Ok(self
            .topics
            .entry(name.to_string())
            .or_insert_with(|| Topic::new(name, options)))
    }

    /// Remove a topic together with its subscriptions.
    ///
    /// Returns the removed subscriptions in registration order.
    pub fn delete_topic(&mut self, name: &str) -> Result<Vec<Subscription>> {
        let topic = self
            .topics
            .get(name)
            .ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))?;

        let ids = topic.subscriptions.clone();
        let removed = ids.iter().filter_map(|id| self.unsubscribe(id)).collect();

        self.topics.remove(name);
        debug!(topic = name, "topic deleted");
        Ok(removed)
    }

    pub fn subscribe(
        &mut self,
        topic: &str,
        subscriber_id: SubscriberId,
        filter: Option<SubscriptionFilter>,
    ) -> Result<SubscriptionId> {
        if self.subscriptions.len() >= self.max_subscriptions {
            return Err(BrokerError::CapacityExceeded {
                resource: "subscription",
                limit: self.max_subscriptions,
            });
        }
        let entry = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let seq = self.next_seq;
        self.next_seq += 1;
        entry.attach(id.clone());
        self.subscriptions.insert(
            id.clone(),
            Subscription {
                id: id.clone(),
                topic: topic.to_string(),
                subscriber_id,
                filter,
                created_at: Instant::now(),
                is_active: true,
                seq,
            },
        );
        Ok(id)
    }

    /// Remove a subscription. Returns `None` if it was already gone.
    pub fn unsubscribe(&mut self, id: &str) -> Option<Subscription> {
        let subscription = self.subscriptions.remove(id)?;
        if let Some(topic) = self.topics.get_mut(&subscription.topic) {
            topic.detach(id);
        }
        Some(subscription)
    }

    /// Snapshot of the active subscriptions on `topic`, in registration order.
    pub fn resolve(&self, topic: &str) -> Vec<Subscription> {
        let Some(topic) = self.topics.get(topic) else {
            return Vec::new();
        };
        topic
            .subscriptions
            .iter()
            .filter_map(|id| self.subscriptions.get(id))
            .filter(|s| s.is_active)
            .cloned()
            .collect()
    }

    pub fn get_topic(&self, name: &str) -> Option<&Topic> {
        self.topics.get(name)
    }

    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.topics.values()
    }

    pub fn list_topics(&self) -> Vec<String> {
        let mut names: Vec<_> = self.topics.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn get_subscription(&self, id: &str) -> Option<&Subscription> {
        self.subscriptions.get(id)
    }

    /// Every subscription held by `subscriber_id`, across topics, in the order
    /// they were made.
    pub fn subscriptions_for(&self, subscriber_id: &str) -> Vec<Subscription> {
        let mut subs: Vec<_> = self
            .subscriptions
            .values()
            .filter(|s| s.subscriber_id == subscriber_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.seq);
        subs
    }

    pub fn set_subscription_active(&mut self, id: &str, active: bool) -> Result<()> {
        let subscription = self
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| BrokerError::SubscriptionNotFound(id.to_string()))?;
        subscription.is_active = active;
        Ok(())
    }

    pub fn set_topic_active(&mut self, name: &str, active: bool) -> Result<()> {
        let topic = self
            .topics
            .get_mut(name)
            .ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))?;
        topic.is_active = active;
        Ok(())
    }

    pub(crate) fn record_publish(&mut self, name: &str, count: u64) {
        if let Some(topic) = self.topics.get_mut(name) {
            topic.message_count += count;
        }
    }

    /// Direct children of `parent` implied by every known topic name.
    pub fn get_child_topics(&self, parent: &str) -> Vec<String> {
        let children: BTreeSet<&str> = self
            .topics
            .keys()
            .filter_map(|name| child_of(parent, name, self.separator))
            .collect();
        children.into_iter().map(str::to_string).collect()
    }

    /// Ancestor chain of `topic`, root first, ending with `topic`.
    pub fn get_topic_hierarchy(&self, topic: &str) -> Result<Vec<String>> {
        if !is_valid_name(topic, self.separator) {
            return Err(BrokerError::InvalidTopicName(topic.to_string()));
        }
        Ok(ancestry(topic, self.separator))
    }
}
