use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Default)]
struct Latency {
    total_micros: AtomicU64,
    samples: AtomicU64,
}

impl Latency {
    fn record(&self, elapsed: Duration) {
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    fn average_ms(&self) -> f64 {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        self.total_micros.load(Ordering::Relaxed) as f64 / samples as f64 / 1_000.0
    }
}

/// Process-wide counters updated by the dispatch engine and the queues.
#[derive(Debug)]
pub struct MetricsRecorder {
    started_at: Instant,
    pub(crate) published: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) handler_invocations: AtomicU64,
    pub(crate) handler_failures: AtomicU64,
    pub(crate) expired: AtomicU64,
    pub(crate) enqueued: AtomicU64,
    pub(crate) acknowledged: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) returned: AtomicU64,
    pub(crate) dead_lettered: AtomicU64,
    dispatch_latency: Latency,
    processing_latency: Latency,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            published: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            handler_invocations: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            dispatch_latency: Latency::default(),
            processing_latency: Latency::default(),
        }
    }
}

impl MetricsRecorder {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Time from publish to a completed handler invocation.
    pub(crate) fn record_dispatch_latency(&self, elapsed: Duration) {
        self.dispatch_latency.record(elapsed);
    }

    /// Time from lease grant to acknowledgment.
    pub(crate) fn record_processing_latency(&self, elapsed: Duration) {
        self.processing_latency.record(elapsed);
    }

    pub(crate) fn snapshot(
        &self,
        topics: BTreeMap<String, TopicMetrics>,
        queues: BTreeMap<String, QueueMetrics>,
    ) -> BrokerMetrics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let published = load(&self.published);
        let enqueued = load(&self.enqueued);
        let invocations = load(&self.handler_invocations);
        let failures = load(&self.handler_failures);

        let elapsed = self.started_at.elapsed().as_secs_f64();
        let throughput_per_sec = if elapsed > 0.0 {
            (published + enqueued) as f64 / elapsed
        } else {
            0.0
        };
        let error_rate = if invocations > 0 {
            failures as f64 / invocations as f64
        } else {
            0.0
        };

        BrokerMetrics {
            topics,
            queues,
            published,
            dispatched: load(&self.dispatched),
            handler_failures: failures,
            expired: load(&self.expired),
            enqueued,
            acknowledged: load(&self.acknowledged),
            rejected: load(&self.rejected),
            returned: load(&self.returned),
            dead_lettered: load(&self.dead_lettered),
            avg_dispatch_latency_ms: self.dispatch_latency.average_ms(),
            avg_processing_latency_ms: self.processing_latency.average_ms(),
            throughput_per_sec,
            error_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMetrics {
    pub subscriber_count: usize,
    pub message_count: u64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub pending: usize,
    pub leased: usize,
    pub dead_letter: usize,
}

/// Point-in-time view returned by `Broker::get_metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMetrics {
    pub topics: BTreeMap<String, TopicMetrics>,
    pub queues: BTreeMap<String, QueueMetrics>,
    pub published: u64,
    pub dispatched: u64,
    pub handler_failures: u64,
    pub expired: u64,
    pub enqueued: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    pub returned: u64,
    pub dead_lettered: u64,
    pub avg_dispatch_latency_ms: f64,
    pub avg_processing_latency_ms: f64,
    pub throughput_per_sec: f64,
    pub error_rate: f64,
}
