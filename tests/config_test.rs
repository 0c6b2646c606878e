//! Configuration loading tests

use cloudmgr_core::config::{ConfigManager, ConfigurationError, CoreConfig};
use std::io::Write;
use std::path::Path;

#[test]
fn defaults_are_valid() {
    let config = CoreConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.executor.workers, 8);
    assert_eq!(config.executor.max_step_attempts, 3);
    assert!(config.reconciliation.discover_new);
    assert!(config.cache.enabled);
}

#[test]
fn file_values_override_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[executor]
workers = 2
retry_backoff_ms = 10

[reconciliation]
discover_died = false
"#
    )
    .unwrap();

    let manager = ConfigManager::load_with_environment(file.path(), true, "test").unwrap();
    let config = manager.config();
    assert_eq!(manager.environment(), "test");
    assert_eq!(config.executor.workers, 2);
    assert_eq!(config.executor.retry_backoff_ms, 10);
    // untouched keys keep their defaults
    assert_eq!(config.executor.max_step_attempts, 3);
    assert_eq!(config.executor.task_retention_seconds, 3600);
    assert!(!config.reconciliation.discover_died);
    assert!(config.reconciliation.discover_new);
    assert_eq!(manager.source(), Some(file.path()));
}

#[test]
fn required_file_must_exist() {
    let err = ConfigManager::load_with_environment(
        Path::new("/nonexistent/cloudmgr.toml"),
        true,
        "test",
    )
    .unwrap_err();
    assert!(matches!(err, ConfigurationError::FileNotFound(_)));
}

#[test]
fn invalid_values_are_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[executor]\nworkers = 0").unwrap();
    assert!(ConfigManager::load_with_environment(file.path(), true, "test").is_err());

    let mut config = CoreConfig::default();
    config.executor.max_step_attempts = 0;
    assert!(ConfigManager::from_config(config).is_err());
}

#[test]
fn shipped_config_file_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/cloudmgr.toml");
    let manager = ConfigManager::load_with_environment(&path, true, "test").unwrap();
    assert_eq!(manager.config(), &{
        let mut expected = CoreConfig::default();
        expected.environment = "test".to_string();
        expected
    });
}
