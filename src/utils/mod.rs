//! Shared utilities: the crate error type and logging setup.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::error::{BrokerError, HandlerError};
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warning");
        logging::init("bogus");
    }

    #[test]
    fn handler_error_converts_into_broker_error() {
        let err: BrokerError = HandlerError::new("boom").into();
        assert!(matches!(err, BrokerError::Handler(_)));
        assert_eq!(err.to_string(), "handler failed: boom");
    }

    #[test]
    fn queue_full_message_names_capacity() {
        let err = BrokerError::QueueFull {
            name: "jobs".to_string(),
            capacity: 2,
        };
        assert_eq!(err.to_string(), "'jobs' is full (capacity 2)");
    }
}
