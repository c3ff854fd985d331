//! The `client` module represents a remote subscriber.
//!
//! A `Client` owns the outbound channel of one connection and acts as the
//! subscriber handler for everything that connection subscribes to.

pub mod pubsub_client;
pub use pubsub_client::Client;

#[cfg(test)]
mod tests;
