use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the broker.
///
/// Every section falls back to its defaults, so a config file only needs to
/// name the values it overrides.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub broker: BrokerSettings,
    pub queue: QueueSettings,
    pub persistence: PersistenceSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

/// Configuration for the topic directory and the push path.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerSettings {
    pub max_topics: usize,
    pub max_subscriptions: usize,
    /// Create unknown topics on publish instead of failing.
    pub auto_create_topics: bool,
    /// Default per-topic bound on in-flight handler invocations.
    pub max_concurrent_handlers: usize,
    /// Messages admitted to a topic but not yet dispatched.
    pub dispatch_backlog: usize,
    pub topic_separator: char,
    pub default_message_ttl_ms: Option<u64>,
    pub event_capacity: usize,
}

/// Defaults for every reliable queue; `QueueOptions` override per queue.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueSettings {
    pub max_size: usize,
    pub visibility_timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    pub max_dead_letter_size: usize,
    pub reaper_interval_ms: u64,
}

/// Optional sled-backed dead-letter sink.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PersistenceSettings {
    pub dead_letter_path: Option<String>,
    pub ttl_seconds: Option<i64>,
    pub max_records_per_source: Option<usize>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_topics: 10_000,
            max_subscriptions: 100_000,
            auto_create_topics: true,
            max_concurrent_handlers: 16,
            dispatch_backlog: 1_024,
            topic_separator: '.',
            default_message_ttl_ms: None,
            event_capacity: 1_024,
        }
    }
}

impl BrokerSettings {
    pub fn default_message_ttl(&self) -> Option<Duration> {
        self.default_message_ttl_ms.map(Duration::from_millis)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            visibility_timeout_ms: 30_000,
            max_attempts: 3,
            retry_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_retry_delay_ms: 300_000,
            max_dead_letter_size: 1_000,
            reaper_interval_ms: 1_000,
        }
    }
}

impl QueueSettings {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms.max(1))
    }
}
