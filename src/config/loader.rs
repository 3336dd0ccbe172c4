//! Configuration Loader
//!
//! Environment-aware loading: a base TOML file, an optional per-environment
//! override and `MEDIAFLOW__*` environment variables, merged by the `config`
//! crate and validated before use.

use super::error::{ConfigResult, ConfigurationError};
use super::{CapabilitySettingsStore, MediaflowConfig};
use config::{Config, ConfigError, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_FILE_STEM: &str = "mediaflow";
const ENV_PREFIX: &str = "MEDIAFLOW";
const ENV_SEPARATOR: &str = "__";

/// Loaded, validated configuration plus the context it was loaded in
#[derive(Debug)]
pub struct ConfigManager {
    config: MediaflowConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Tests use this to avoid touching process-wide environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);
        let base = config_directory.join(format!("{BASE_FILE_STEM}.toml"));
        Self::load_layers(&base, &config_directory, environment)
    }

    /// Load from an explicit base file; the environment override is looked
    /// up next to it
    pub fn load_from_file(path: &Path, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        if !path.is_file() {
            return Err(ConfigurationError::file_read_error(
                path.display().to_string(),
                "file does not exist",
            ));
        }
        let directory = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::load_layers(path, &directory, environment)
    }

    /// Wrap an already-built configuration (validated)
    pub fn from_config(
        config: MediaflowConfig,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        }))
    }

    fn load_layers(
        base: &Path,
        config_directory: &Path,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let env_override = config_directory.join(format!("{BASE_FILE_STEM}.{environment}.toml"));

        debug!(
            "Loading configuration for environment '{}' from {} (override: {})",
            environment,
            base.display(),
            env_override.display()
        );

        let layered = Config::builder()
            .add_source(File::from(base).required(false))
            .add_source(File::from(env_override.as_path()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| layering_error(environment, e))?;

        let config: MediaflowConfig = layered
            .try_deserialize()
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        config.validate()?;

        info!(
            environment = environment,
            broker_url = %config.broker.url_redacted(),
            rpc_queue = %config.broker.rpc_queue,
            capabilities = config.capabilities.len(),
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: config_directory.to_path_buf(),
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &MediaflowConfig {
        &self.config
    }

    /// Get the current environment
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Get the configuration directory
    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Broker URL safe for logging
    pub fn broker_url_redacted(&self) -> String {
        self.config.broker.url_redacted()
    }

    /// Capability settings seeded from `[capabilities.*]`
    pub fn capability_settings(&self) -> CapabilitySettingsStore {
        CapabilitySettingsStore::from_map(&self.config.capabilities)
    }

    /// Stage directory, resolved against the working directory when relative
    pub fn stages_directory(&self) -> PathBuf {
        let dir = &self.config.stages.directory;
        if dir.is_absolute() {
            dir.clone()
        } else {
            env::current_dir()
                .map(|cwd| cwd.join(dir))
                .unwrap_or_else(|_| dir.clone())
        }
    }

    /// MEDIAFLOW_ENV || APP_ENV || 'development'
    pub fn detect_environment() -> String {
        env::var("MEDIAFLOW_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn default_config_directory() -> PathBuf {
        env::var("MEDIAFLOW_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }
}

/// A malformed file is reported against that file; anything else against
/// the environment being loaded
fn layering_error(environment: &str, err: ConfigError) -> ConfigurationError {
    match err {
        ConfigError::FileParse { uri, cause } => ConfigurationError::parse_error(
            uri.unwrap_or_else(|| format!("{BASE_FILE_STEM}.toml")),
            cause,
        ),
        other => ConfigurationError::load_error(environment, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn test_missing_files_fall_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap();
        assert_eq!(manager.environment(), "test");
        assert_eq!(manager.config().broker.rpc_queue, "rpc_requests_queue");
    }

    #[test]
    fn test_environment_file_overrides_base() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "mediaflow.toml",
            r#"
[broker]
rpc_queue = "base_queue"
prefetch_count = 4

[rpc]
max_in_flight = 2

[capabilities.translate]
remote_enabled = true
"#,
        );
        write(
            dir.path(),
            "mediaflow.staging.toml",
            r#"
[broker]
rpc_queue = "staging_queue"
"#,
        );

        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "staging")
                .unwrap();
        let config = manager.config();
        assert_eq!(config.broker.rpc_queue, "staging_queue");
        assert_eq!(config.broker.prefetch_count, 4);
        assert_eq!(config.rpc.max_in_flight, 2);

        let settings = manager.capability_settings();
        assert!(settings.remote_enabled("translate"));
        assert!(!settings.remote_enabled("speech"));
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "mediaflow.toml",
            r#"
[streaming]
channel_capacity = 0
"#,
        );
        let result =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test");
        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mediaflow.test.toml", "[broker\nurl = ");
        let result =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test");
        match result {
            Err(ConfigurationError::ParseError { file_path, .. }) => {
                assert!(file_path.ends_with("mediaflow.test.toml"));
            }
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        let result = ConfigManager::load_from_file(&dir.path().join("nope.toml"), "test");
        assert!(matches!(
            result,
            Err(ConfigurationError::FileReadError { .. })
        ));
    }

    #[test]
    fn test_redacted_url() {
        let mut config = MediaflowConfig::default();
        config.broker.url = "amqp://svc:hunter2@mq:5672/%2F".to_string();
        let manager = ConfigManager::from_config(config, "test").unwrap();
        assert!(!manager.broker_url_redacted().contains("hunter2"));
    }
}
