use super::{Settings, load_config};
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.logging.level, "info");
    assert_eq!(settings.broker.max_topics, 10_000);
    assert!(settings.broker.auto_create_topics);
    assert_eq!(settings.broker.topic_separator, '.');
    assert_eq!(settings.queue.max_attempts, 3);
    assert_eq!(settings.queue.backoff_multiplier, 2.0);
    assert!(settings.persistence.dead_letter_path.is_none());
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [broker]
        max_topics = 5
        auto_create_topics = false

        [queue]
        max_size = 2
        retry_delay_ms = 100
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();
    env::set_current_dir(orig).expect("restore cwd");

    let cfg = cfg.expect("load_config failed");
    assert_eq!(cfg.broker.max_topics, 5);
    assert!(!cfg.broker.auto_create_topics);
    assert_eq!(cfg.queue.max_size, 2);
    assert_eq!(cfg.queue.retry_delay_ms, 100);
    // untouched values keep their defaults
    assert_eq!(cfg.queue.max_attempts, 3);
    assert_eq!(cfg.broker.max_concurrent_handlers, 16);
}

#[test]
#[serial]
fn load_config_reads_prefixed_environment() {
    temp_env::with_vars(
        [
            ("RELAYBUS__QUEUE__MAX_SIZE", Some("7")),
            ("RELAYBUS__LOGGING__LEVEL", Some("debug")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.queue.max_size, 7);
            assert_eq!(cfg.logging.level, "debug");
        },
    );
}
