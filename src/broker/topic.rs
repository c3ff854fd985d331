//! Topic and subscription records owned by the directory.
//!
//! A topic keeps its subscription ids in registration order; dispatch walks
//! them in that order. Hierarchy is purely lexical: `a.b.c` has parent `a.b`
//! whether or not `a.b` exists as a topic.

use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use crate::broker::message::Message;

pub type SubscriberId = String;
pub type SubscriptionId = String;

/// Predicate deciding whether a subscription receives a message.
pub type SubscriptionFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Per-topic overrides.
#[derive(Debug, Clone, Default)]
pub struct TopicOptions {
    /// Bound on in-flight handler invocations for this topic.
    pub max_concurrency: Option<usize>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Topic {
    pub name: String,
    pub subscriptions: Vec<SubscriptionId>,
    pub message_count: u64,
    pub is_active: bool,
    pub created_at: Instant,
    pub options: TopicOptions,
}

impl Topic {
    pub fn new(name: &str, options: TopicOptions) -> Self {
        Self {
            name: name.to_string(),
            subscriptions: Vec::new(),
            message_count: 0,
            is_active: true,
            created_at: Instant::now(),
            options,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub(crate) fn attach(&mut self, id: SubscriptionId) {
        self.subscriptions.push(id);
    }

    pub(crate) fn detach(&mut self, id: &str) {
        self.subscriptions.retain(|s| s != id);
    }
}

#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub subscriber_id: SubscriberId,
    pub filter: Option<SubscriptionFilter>,
    pub created_at: Instant,
    pub is_active: bool,
    /// Directory-wide registration order.
    pub(crate) seq: u64,
}

impl Subscription {
    /// True when the subscription is active and its filter (if any) accepts `message`.
    pub fn accepts(&self, message: &Message) -> bool {
        self.is_active && self.filter.as_ref().is_none_or(|f| f(message))
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("subscriber_id", &self.subscriber_id)
            .field("filtered", &self.filter.is_some())
            .field("is_active", &self.is_active)
            .finish()
    }
}

/// A name is valid when it is non-empty and has no empty segments.
pub fn is_valid_name(name: &str, separator: char) -> bool {
    !name.is_empty() && name.split(separator).all(|segment| !segment.is_empty())
}

/// Ancestor chain of `name`, root first, ending with `name` itself.
pub fn ancestry(name: &str, separator: char) -> Vec<String> {
    let mut chain = Vec::new();
    for (idx, ch) in name.char_indices() {
        if ch == separator {
            chain.push(name[..idx].to_string());
        }
    }
    chain.push(name.to_string());
    chain
}

/// Direct child of `parent` implied by `name`, e.g. `a.b` for parent `a` and name `a.b.c`.
pub fn child_of<'a>(parent: &str, name: &'a str, separator: char) -> Option<&'a str> {
    let rest = name.strip_prefix(parent)?;
    let rest = rest.strip_prefix(separator)?;
    if rest.is_empty() {
        return None;
    }
    let end = rest
        .find(separator)
        .map_or(name.len(), |idx| parent.len() + separator.len_utf8() + idx);
    Some(&name[..end])
}
