//! Configuration files on disk
#![allow(clippy::unwrap_used, clippy::expect_used)]

use analytics_worker::{ConfigError, ConfigLoader, LogFormat};
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        r#"
program = "ioc"
prefetch = 250
ack_threshold = 10
reconnect_delay_ms = 500

[logging]
level = "debug"
format = "json"
"#
    )
    .expect("write config");

    let config = ConfigLoader::new("ignored")
        .with_file(file.path())
        .load()
        .expect("load config");

    assert_eq!(config.program, "ioc");
    assert_eq!(config.queue_name(), "analytics-ioc");
    assert_eq!(config.prefetch, 250);
    assert_eq!(config.ack_threshold, 10);
    assert_eq!(config.reconnect_delay_ms, 500);
    assert_eq!(config.logging.format, LogFormat::Json);
    // untouched keys keep their defaults
    assert_eq!(config.output_buffer, 100);
    assert!(config.persistent);
}

#[test]
fn test_malformed_file_is_rejected() {
    let mut file = NamedTempFile::new().expect("temp file");
    writeln!(file, "prefetch = \"lots\"").expect("write config");

    let result = ConfigLoader::new("geo").with_file(file.path()).load();
    assert!(matches!(result, Err(ConfigError::InvalidFormat(_))));
}

#[test]
fn test_invalid_file_values_fail_validation() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("worker.toml");
    std::fs::write(&path, "output_buffer = 0\n").expect("write config");

    let result = ConfigLoader::new("geo").with_file(&path).load();
    assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
}
