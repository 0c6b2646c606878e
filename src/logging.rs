//! # Structured Logging Module
//!
//! Environment-aware structured logging for the control plane. Console output is
//! human-readable by default and switches to JSON lines when `logging.json` is set.

use crate::config::{ConfigManager, LoggingConfig};
use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging. Only the first call has an effect.
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let filter = match (&config.level, std::env::var("RUST_LOG")) {
            (Some(level), _) => EnvFilter::new(level),
            (None, Ok(directives)) => EnvFilter::new(directives),
            (None, Err(_)) => EnvFilter::new(get_log_level(&environment)),
        };

        let layer = if config.json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(filter)
                .boxed()
        };

        // A subscriber installed by the host application wins
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json = config.json,
            "STRUCTURED LOGGING: initialized"
        );
    });
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log structured data for resource lifecycle operations
pub fn log_resource_operation(
    operation: &str,
    resource_id: Option<i64>,
    resource_type: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        resource_id = resource_id,
        resource_type = %resource_type,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "RESOURCE_OPERATION"
    );
}

/// Log structured data for container operations
pub fn log_container_operation(
    operation: &str,
    container_id: Option<i64>,
    container_type: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        container_id = container_id,
        container_type = %container_type,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "CONTAINER_OPERATION"
    );
}

/// Log the outcome of one reconciliation pass over a resource type
pub fn log_reconciliation(
    container_id: i64,
    resource_type: &str,
    new: usize,
    died: usize,
    changed: usize,
    errors: usize,
) {
    tracing::info!(
        container_id = container_id,
        resource_type = %resource_type,
        new = new,
        died = died,
        changed = changed,
        errors = errors,
        timestamp = %Utc::now().to_rfc3339(),
        "RECONCILIATION"
    );
}

/// Log an error with its context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_per_environment() {
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("staging"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        init_structured_logging(&config);
        init_structured_logging(&config);
    }
}
