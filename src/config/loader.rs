//! Configuration Loader
//!
//! Environment-aware loading: compiled defaults, then `tasker.yaml`, then
//! `tasker.{environment}.yaml`, then `TASKER__SECTION__KEY` environment
//! variables. Later sources override earlier ones key by key.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config, Environment, File};
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::TaskerConfig;

const BASE_FILE_STEM: &str = "tasker";
const ENV_PREFIX: &str = "TASKER";
const ENV_SEPARATOR: &str = "__";

pub struct ConfigManager {
    config: TaskerConfig,
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
    /// Missing files are skipped; defaults fill every gap.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));
        if config_directory.exists() && !config_directory.is_dir() {
            return Err(ConfigurationError::invalid_value(
                "config_directory",
                config_directory.display(),
                "must be a directory",
            ));
        }

        debug!(
            environment,
            directory = %config_directory.display(),
            "Loading configuration"
        );

        let base = config_directory.join(format!("{BASE_FILE_STEM}.yaml"));
        let overlay = config_directory.join(format!("{BASE_FILE_STEM}.{environment}.yaml"));
        let config = Self::build(vec![(base, false), (overlay, false)])?;

        Ok(Self::finish(config, environment, config_directory))
    }

    /// Load a single explicit YAML file over the defaults
    pub fn load_from_file(path: &Path) -> ConfigResult<Arc<ConfigManager>> {
        if !path.is_file() {
            return Err(ConfigurationError::file_read_error(
                path.display().to_string(),
                "not a regular file",
            ));
        }

        let environment = Self::detect_environment();
        let config = Self::build(vec![(path.to_path_buf(), true)])?;
        let directory = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self::finish(config, &environment, directory))
    }

    /// Wrap an in-code configuration, validating it like a loaded one
    pub fn from_config(config: TaskerConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_directory: PathBuf::from("config"),
        }))
    }

    fn build(files: Vec<(PathBuf, bool)>) -> ConfigResult<TaskerConfig> {
        let mut builder = Config::builder().add_source(Config::try_from(&TaskerConfig::default())?);
        for (path, required) in files {
            builder = builder.add_source(File::from(path).required(required));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: TaskerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn finish(
        config: TaskerConfig,
        environment: &str,
        config_directory: PathBuf,
    ) -> Arc<ConfigManager> {
        info!(
            environment,
            min_concurrent_steps = config.execution.min_concurrent_steps,
            max_concurrent_steps_limit = config.execution.max_concurrent_steps_limit,
            max_backoff_seconds = config.backoff.max_backoff_seconds,
            "Configuration loaded successfully"
        );

        Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        })
    }

    pub fn config(&self) -> &TaskerConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    pub fn is_test_environment(&self) -> bool {
        self.environment == "test"
    }

    /// `TASKER_ENV`, then `APP_ENV`, defaulting to `development`
    pub fn detect_environment() -> String {
        env::var("TASKER_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }
}
