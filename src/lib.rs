//! # relaybus
//!
//! `relaybus` is an in-process message broker with two delivery paths:
//!
//! - **push**: messages published to a named topic are fanned out to every
//!   matching subscription's handler, under a per-topic concurrency bound
//! - **pull**: producers enqueue into named queues and consumers lease,
//!   acknowledge or reject entries, with visibility timeouts, retry backoff
//!   and a bounded dead-letter area
//!
//! Delivery is at-least-once. Everything lives in memory; a
//! `persistence::DeadLetterSink` can be attached to keep failed deliveries.
//!
//! ## Core Modules
//!
//! - `broker`: topics, subscriptions, dispatch, reliable queues, events and metrics.
//! - `client`: a remote subscriber that forwards deliveries over a channel.
//! - `config`: loads `Settings` from files, the environment and `.env`.
//! - `persistence`: the dead-letter sink trait and its sled-backed store.
//! - `transport`: request/response frames, payload codec and authorization gate.
//! - `utils`: shared error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;

pub use broker::Broker;
pub use utils::error::{BrokerError, HandlerError, Result};
