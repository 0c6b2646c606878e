//! Configuration Loader
//!
//! Environment-aware loading: built-in defaults, then an optional TOML file, then
//! `CLOUDMGR__*` environment variables. The merged result is validated before it is
//! handed out.

use super::error::{ConfigResult, ConfigurationError};
use super::CoreConfig;
use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Default location of the configuration file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config/cloudmgr.toml";

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "CLOUDMGR";

/// Loaded, validated configuration
#[derive(Debug)]
pub struct ConfigManager {
    config: CoreConfig,
    environment: String,
    source: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection. The default file is optional.
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_with_environment(Path::new(DEFAULT_CONFIG_FILE), false, &environment)
    }

    /// Load configuration from a file that must exist
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_with_environment(path.as_ref(), true, &environment)
    }

    /// Load configuration with an explicit environment name
    pub fn load_with_environment(
        path: &Path,
        required: bool,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        if required && !path.exists() {
            return Err(ConfigurationError::FileNotFound(path.display().to_string()));
        }

        debug!(
            environment = environment,
            path = %path.display(),
            "Loading configuration"
        );

        let settings = Config::builder()
            .set_default("environment", environment)?
            .add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(required),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: CoreConfig = settings.try_deserialize()?;
        config.validate()?;

        debug!(
            environment = %config.environment,
            workers = config.executor.workers,
            cache_enabled = config.cache.enabled,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            environment: config.environment.clone(),
            config,
            source: path.exists().then(|| path.to_path_buf()),
        }))
    }

    /// Wrap an already-built configuration, validating it
    pub fn from_config(config: CoreConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            environment: config.environment.clone(),
            config,
            source: None,
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// File the configuration was read from, if one existed
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// `CLOUDMGR_ENV`, then `APP_ENV`, then `development`
    pub fn detect_environment() -> String {
        env::var("CLOUDMGR_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_optional_file_uses_defaults() {
        let manager = ConfigManager::load_with_environment(
            Path::new("does/not/exist.toml"),
            false,
            "test",
        )
        .unwrap();
        assert_eq!(manager.environment(), "test");
        assert_eq!(manager.config().executor.max_step_attempts, 3);
        assert!(manager.source().is_none());
    }

    #[test]
    fn test_missing_required_file_is_an_error() {
        let err = ConfigManager::load_with_environment(Path::new("nope.toml"), true, "test")
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::FileNotFound(_)));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[executor]\nworkers = 2\n\n[reconciliation]\ndiscover_died = false\n"
        )
        .unwrap();

        let manager = ConfigManager::load_with_environment(file.path(), true, "test").unwrap();
        assert_eq!(manager.config().executor.workers, 2);
        assert!(!manager.config().reconciliation.discover_died);
        assert!(manager.config().reconciliation.discover_new);
    }

    #[test]
    fn test_invalid_file_values_fail_validation() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[executor]\nmax_step_attempts = 0\n").unwrap();

        let err = ConfigManager::load_with_environment(file.path(), true, "test").unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    }
}
