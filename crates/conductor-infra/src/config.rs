//! Engine configuration loader for Conductor.
//!
//! Reads `config.toml` from the data directory (`~/.conductor/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use conductor_types::config::EngineConfig;
use conductor_types::workflow::RetryConfig;

/// Path of the configuration file inside `data_dir`.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - An invalid `default_retry` table is replaced by the default retry policy.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = config_path(data_dir);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    let mut config = match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            return EngineConfig::default();
        }
    };

    if let Err(reason) = config.default_retry.validate() {
        tracing::warn!(
            "Invalid default_retry in {}: {reason}, using default retry policy",
            config_path.display()
        );
        config.default_retry = RetryConfig::default();
    }
    config
}
