//! Configuration Loader
//!
//! Environment-aware configuration loading built on the `config` crate.
//! A base file is merged with an optional `taskguard.<environment>.toml`
//! override next to it, then with `TASKGUARD__`-prefixed environment
//! variables (`TASKGUARD__WORKER_POOL__MAX_CONCURRENCY=8`).

use super::error::{ConfigResult, ConfigurationError};
use super::ResilienceConfig;
use ::config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use std::env;
use std::path::Path;
use tracing::{debug, info};

/// Base file name searched for by [`ResilienceConfig::load_from_directory_with_env`]
pub const DEFAULT_CONFIG_FILE: &str = "taskguard.toml";

impl ResilienceConfig {
    /// Load configuration from a single file plus environment overrides
    pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigurationError::config_file_not_found(vec![
                path.to_path_buf()
            ]));
        }

        let builder = Config::builder()
            .add_source(File::from(path))
            .add_source(environment_source());

        finish(builder, path)
    }

    /// Load `taskguard.toml` from a directory with environment auto-detection
    pub fn load_from_directory(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::load_from_directory_with_env(config_dir, &detect_environment())
    }

    /// Load `taskguard.toml` from a directory, merging `taskguard.<environment>.toml`
    /// when present. Useful for tests that must not touch process environment.
    pub fn load_from_directory_with_env(
        config_dir: impl AsRef<Path>,
        environment: &str,
    ) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref();
        let base_path = config_dir.join(DEFAULT_CONFIG_FILE);
        let override_path = config_dir.join(format!("taskguard.{environment}.toml"));

        if !base_path.exists() {
            return Err(ConfigurationError::config_file_not_found(vec![base_path]));
        }

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_dir.display()
        );

        let mut builder = Config::builder().add_source(File::from(base_path.as_path()));
        if override_path.exists() {
            debug!(path = %override_path.display(), "Applying environment override file");
            builder = builder.add_source(File::from(override_path.as_path()));
        }
        builder = builder.add_source(environment_source());

        finish(builder, &base_path)
    }
}

/// Current environment from `TASKGUARD_ENV` or `APP_ENV`, defaulting to development
pub fn detect_environment() -> String {
    env::var("TASKGUARD_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn environment_source() -> Environment {
    Environment::with_prefix("TASKGUARD")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

fn finish(builder: ConfigBuilder<DefaultState>, origin: &Path) -> ConfigResult<ResilienceConfig> {
    let file_path = origin.display().to_string();

    let config: ResilienceConfig = builder
        .build()
        .and_then(|built| built.try_deserialize::<ResilienceConfig>())
        .map_err(|e| ConfigurationError::parse_error(file_path.clone(), e))?;

    config.validate()?;

    debug!(
        "Configuration loaded successfully: {}",
        serde_json::to_string_pretty(&config)
            .unwrap_or_else(|_| "[serialization error]".to_string())
    );
    info!(
        file = %file_path,
        dependencies = config.dependencies.len(),
        max_concurrency = config.worker_pool.max_concurrency,
        "Configuration loaded"
    );

    Ok(config)
}
