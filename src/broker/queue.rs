//! Reliable queue (pull path)
//!
//! Entries move through `Pending -> Leased -> {Completed | Pending | DeadLettered}`.
//!
//! - Pending entries are ordered by priority (higher first), then by insertion
//!   sequence, using a `BTreeMap` keyed on `(Reverse(priority), seq)`.
//! - A dequeued entry is moved out of the pending map into `leased`, so it is
//!   invisible to every other `dequeue` until it is acknowledged, rejected or
//!   its visibility timeout passes.
//! - An expired lease puts the entry back at its original position with its
//!   attempt count untouched. `reject` bumps the attempt count and either
//!   schedules a retry with exponential backoff or dead-letters the entry.
//! - Only pending entries count toward `max_size`. Leased and dead-lettered
//!   entries do not, and lease returns or retries are never refused.
//!
//! Every operation first returns expired leases, so correctness does not
//! depend on the background reaper running on time.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::BrokerContext;
use crate::broker::events::BrokerEvent;
use crate::broker::message::{EnqueueOptions, Message, MessageId, Payload};
use crate::broker::metrics::{MetricsRecorder, QueueMetrics};
use crate::config::QueueSettings;
use crate::persistence::{DeadLetterRecord, DeadLetterSource};
use crate::utils::error::{BrokerError, Result};

/// Roughly 30 years; stands in for deadlines too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + after`, saturating at a far-future instant instead of overflowing.
fn deadline_after(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Leased,
    Completed,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Position {
    priority: Reverse<i32>,
    seq: u64,
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub message: Message,
    pub queue: String,
    pub state: EntryState,
    pub lease_expires_at: Option<Instant>,
    pub leased_at: Option<Instant>,
    pub last_error: Option<String>,
    seq: u64,
}

impl QueueEntry {
    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn attempts(&self) -> u32 {
        self.message.attempts
    }

    fn position(&self) -> Position {
        Position {
            priority: Reverse(self.message.priority),
            seq: self.seq,
        }
    }
}

/// Per-queue settings. Unset values come from `QueueSettings`.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_size: usize,
    pub visibility_timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_retry_delay: Duration,
    pub max_dead_letter_size: usize,
}

impl From<&QueueSettings> for QueueOptions {
    fn from(s: &QueueSettings) -> Self {
        Self {
            max_size: s.max_size,
            visibility_timeout: Duration::from_millis(s.visibility_timeout_ms),
            max_attempts: s.max_attempts.max(1),
            retry_delay: Duration::from_millis(s.retry_delay_ms),
            backoff_multiplier: s.backoff_multiplier,
            max_retry_delay: Duration::from_millis(s.max_retry_delay_ms),
            max_dead_letter_size: s.max_dead_letter_size,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl QueueOptions {
    /// Backoff before the next attempt, given the attempts made before this rejection.
    pub fn retry_delay_for(&self, prior_attempts: u32) -> Duration {
        let exponent = i32::try_from(prior_attempts).unwrap_or(i32::MAX);
        let ms = self.retry_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = ms.min(self.max_retry_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug)]
pub struct ReliableQueue {
    name: String,
    options: QueueOptions,
    pending: BTreeMap<Position, QueueEntry>,
    index: HashMap<MessageId, Position>,
    leased: HashMap<MessageId, QueueEntry>,
    dead_letters: VecDeque<QueueEntry>,
    next_seq: u64,
    ctx: BrokerContext,
}

impl ReliableQueue {
    pub(crate) fn new(name: &str, options: QueueOptions, ctx: BrokerContext) -> Self {
        Self {
            name: name.to_string(),
            options,
            pending: BTreeMap::new(),
            index: HashMap::new(),
            leased: HashMap::new(),
            dead_letters: VecDeque::new(),
            next_seq: 0,
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn leased_len(&self) -> usize {
        self.leased.len()
    }

    pub fn dead_letter_len(&self) -> usize {
        self.dead_letters.len()
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            pending: self.pending.len(),
            leased: self.leased.len(),
            dead_letter: self.dead_letters.len(),
        }
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn insert_pending(&mut self, entry: QueueEntry) {
        let position = entry.position();
        self.index.insert(entry.message.id.clone(), position);
        self.pending.insert(position, entry);
    }

    fn remove_pending(&mut self, id: &str) -> Option<QueueEntry> {
        let position = self.index.remove(id)?;
        self.pending.remove(&position)
    }

    pub fn enqueue(&mut self, payload: Payload, options: EnqueueOptions) -> Result<MessageId> {
        let now = Instant::now();
        self.reclaim_expired_leases(now);

        if self.pending.len() >= self.options.max_size {
            warn!(queue = %self.name, capacity = self.options.max_size, "queue full, rejecting enqueue");
            return Err(BrokerError::QueueFull {
                name: self.name.clone(),
                capacity: self.options.max_size,
            });
        }

        let mut message = Message::new(self.name.as_str(), payload);
        message.priority = options.priority;
        message.ttl = options.ttl;
        message.max_attempts = options
            .max_attempts
            .unwrap_or(self.options.max_attempts)
            .max(1);
        message.delay_until = options.delay.map(|d| deadline_after(now, d));

        let id = message.id.clone();
        let seq = self.take_seq();
        self.insert_pending(QueueEntry {
            message,
            queue: self.name.clone(),
            state: EntryState::Pending,
            lease_expires_at: None,
            leased_at: None,
            last_error: None,
            seq,
        });

        debug!(queue = %self.name, message_id = %id, priority = options.priority, "enqueued");
        MetricsRecorder::incr(&self.ctx.metrics.enqueued);
        self.ctx.events.emit(BrokerEvent::Enqueued {
            message_id: id.clone(),
            queue: self.name.clone(),
            priority: options.priority,
        });
        Ok(id)
    }

    /// Lease the highest-priority ready entry.
    ///
    /// Entries whose TTL has elapsed are dropped on the way. Entries still
    /// waiting out a delay are skipped but keep their place.
    pub fn dequeue(&mut self) -> Option<QueueEntry> {
        let now = Instant::now();
        self.reclaim_expired_leases(now);

        let mut expired = Vec::new();
        let mut selected = None;
        for (position, entry) in &self.pending {
            if entry.message.is_expired(now) {
                expired.push(entry.message.id.clone());
            } else if entry.message.is_ready(now) {
                selected = Some(*position);
                break;
            }
        }

        for id in expired {
            if let Some(entry) = self.remove_pending(&id) {
                self.drop_expired(entry);
            }
        }

        let position = selected?;
        let mut entry = self.pending.remove(&position)?;
        self.index.remove(&entry.message.id);

        entry.state = EntryState::Leased;
        entry.leased_at = Some(now);
        entry.lease_expires_at = Some(deadline_after(now, self.options.visibility_timeout));
        self.leased.insert(entry.message.id.clone(), entry.clone());

        debug!(queue = %self.name, message_id = %entry.message.id, attempts = entry.message.attempts, "leased");
        self.ctx.events.emit(BrokerEvent::Dequeued {
            message_id: entry.message.id.clone(),
            queue: self.name.clone(),
            attempts: entry.message.attempts,
        });
        Some(entry)
    }

    /// Complete a leased entry. Returns `false` when `id` holds no live lease.
    pub fn acknowledge(&mut self, id: &str) -> bool {
        let now = Instant::now();
        self.reclaim_expired_leases(now);

        let Some(mut entry) = self.leased.remove(id) else {
            debug!(queue = %self.name, message_id = id, "ack for entry without a lease ignored");
            return false;
        };
        entry.state = EntryState::Completed;
        if let Some(leased_at) = entry.leased_at {
            self.ctx
                .metrics
                .record_processing_latency(now.saturating_duration_since(leased_at));
        }

        MetricsRecorder::incr(&self.ctx.metrics.acknowledged);
        self.ctx.events.emit(BrokerEvent::Acknowledged {
            message_id: entry.message.id,
            queue: self.name.clone(),
        });
        true
    }

    /// Fail a leased entry, retrying it after a backoff or dead-lettering it
    /// once its attempts are used up. Returns `false` when `id` holds no live lease.
    pub fn reject(&mut self, id: &str, error: Option<String>) -> bool {
        let now = Instant::now();
        self.reclaim_expired_leases(now);

        let Some(mut entry) = self.leased.remove(id) else {
            debug!(queue = %self.name, message_id = id, "reject for entry without a lease ignored");
            return false;
        };

        let prior_attempts = entry.message.attempts;
        entry.message.attempts += 1;
        entry.lease_expires_at = None;
        entry.leased_at = None;
        entry.last_error = error.clone();

        MetricsRecorder::incr(&self.ctx.metrics.rejected);
        self.ctx.events.emit(BrokerEvent::Rejected {
            message_id: entry.message.id.clone(),
            queue: self.name.clone(),
            attempts: entry.message.attempts,
            error,
        });

        if entry.message.attempts < entry.message.max_attempts {
            let delay = self.options.retry_delay_for(prior_attempts);
            entry.message.delay_until = Some(deadline_after(now, delay));
            entry.state = EntryState::Pending;
            entry.seq = self.take_seq();
            debug!(
                queue = %self.name,
                message_id = %entry.message.id,
                attempts = entry.message.attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduled retry"
            );
            self.insert_pending(entry);
        } else {
            self.dead_letter(entry);
        }
        true
    }

    fn dead_letter(&mut self, mut entry: QueueEntry) {
        entry.state = EntryState::DeadLettered;
        let error = entry
            .last_error
            .clone()
            .unwrap_or_else(|| "max attempts exceeded".to_string());

        info!(
            queue = %self.name,
            message_id = %entry.message.id,
            attempts = entry.message.attempts,
            "moved to dead-letter area"
        );
        MetricsRecorder::incr(&self.ctx.metrics.dead_lettered);
        self.ctx.events.emit(BrokerEvent::DeadLetter {
            message_id: entry.message.id.clone(),
            destination: self.name.clone(),
            error: error.clone(),
        });
        self.ctx.forward_dead_letter(&DeadLetterRecord::new(
            entry.message.record(),
            error,
            DeadLetterSource::Queue,
        ));

        self.dead_letters.push_back(entry);
        while self.dead_letters.len() > self.options.max_dead_letter_size {
            let Some(evicted) = self.dead_letters.pop_front() else {
                break;
            };
            warn!(queue = %self.name, message_id = %evicted.message.id, "dead-letter area full, evicting oldest");
            self.ctx.events.emit(BrokerEvent::DeadLetterEvicted {
                message_id: evicted.message.id,
                queue: self.name.clone(),
            });
        }
    }

    fn drop_expired(&self, entry: QueueEntry) {
        debug!(queue = %self.name, message_id = %entry.message.id, "dropping expired entry");
        MetricsRecorder::incr(&self.ctx.metrics.expired);
        self.ctx.events.emit(BrokerEvent::Expired {
            reason: BrokerError::MessageExpired(entry.message.id.clone()).to_string(),
            message_id: entry.message.id,
            destination: self.name.clone(),
        });
    }

    /// Move a pending entry to the position for `priority`.
    pub fn update_priority(&mut self, id: &str, priority: i32) -> Result<()> {
        self.reclaim_expired_leases(Instant::now());

        let mut entry = self
            .remove_pending(id)
            .ok_or_else(|| BrokerError::MessageNotFound(id.to_string()))?;
        entry.message.priority = priority;
        entry.seq = self.take_seq();
        self.insert_pending(entry);
        Ok(())
    }

    /// Push the lease deadline of `id` out by `extra`.
    pub fn extend_lease(&mut self, id: &str, extra: Duration) -> bool {
        self.reclaim_expired_leases(Instant::now());

        match self.leased.get_mut(id) {
            Some(entry) => {
                entry.lease_expires_at = entry.lease_expires_at.map(|at| deadline_after(at, extra));
                true
            }
            None => false,
        }
    }

    /// Return every lease whose visibility timeout has passed to pending.
    pub fn reclaim_expired_leases(&mut self, now: Instant) -> usize {
        let expired: Vec<MessageId> = self
            .leased
            .values()
            .filter(|e| e.lease_expires_at.is_some_and(|at| at <= now))
            .map(|e| e.message.id.clone())
            .collect();

        for id in &expired {
            if let Some(mut entry) = self.leased.remove(id) {
                entry.state = EntryState::Pending;
                entry.lease_expires_at = None;
                entry.leased_at = None;

                debug!(queue = %self.name, message_id = %id, "lease expired, returning entry");
                MetricsRecorder::incr(&self.ctx.metrics.returned);
                self.ctx.events.emit(BrokerEvent::Returned {
                    message_id: id.clone(),
                    queue: self.name.clone(),
                });
                self.insert_pending(entry);
            }
        }
        expired.len()
    }

    /// Drop pending entries whose TTL has elapsed.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<MessageId> = self
            .pending
            .values()
            .filter(|e| e.message.is_expired(now))
            .map(|e| e.message.id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = self.remove_pending(id) {
                self.drop_expired(entry);
            }
        }
        expired.len()
    }

    /// Discard every pending entry. Leases and dead letters are kept.
    pub fn purge(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        self.index.clear();
        count
    }

    /// Look up an entry in any state it can still be found in.
    pub fn get_entry(&self, id: &str) -> Option<QueueEntry> {
        if let Some(position) = self.index.get(id) {
            return self.pending.get(position).cloned();
        }
        if let Some(entry) = self.leased.get(id) {
            return Some(entry.clone());
        }
        self.dead_letters.iter().find(|e| e.message.id == id).cloned()
    }

    pub fn dead_letters(&self) -> Vec<QueueEntry> {
        self.dead_letters.iter().cloned().collect()
    }

    /// Offer each dead letter to `processor` in arrival order; the ones it
    /// returns `true` for are removed.
    pub fn process_dead_letters<F>(&mut self, mut processor: F) -> usize
    where
        F: FnMut(&QueueEntry) -> bool,
    {
        let before = self.dead_letters.len();
        self.dead_letters.retain(|entry| !processor(entry));
        before - self.dead_letters.len()
    }
}
