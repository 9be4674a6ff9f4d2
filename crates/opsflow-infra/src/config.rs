//! Engine configuration loader.
//!
//! Reads `opsflow.toml` from the data directory (`OPSFLOW_DATA_DIR`, else
//! `~/.opsflow`) and deserializes it into [`EngineConfig`]. Every field
//! has a default, and a missing or malformed file falls back to the
//! defaults with a warning.

use std::path::Path;
use std::time::Duration;

use opsflow_core::engine::sweeper::SweeperConfig;
use serde::{Deserialize, Serialize};

/// Tunable engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database URL; defaults to `{data_dir}/opsflow.db`.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Engine default workflow deadline in seconds.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Sweeper poll period in seconds.
    #[serde(default = "default_sweeper_interval_secs")]
    pub sweeper_interval_secs: u64,
    /// Maximum rows the sweeper finalizes per tenant per cycle.
    #[serde(default = "default_sweeper_batch_size")]
    pub sweeper_batch_size: u32,
    /// TTL for context cache entries in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub context_cache_ttl_secs: u64,
    /// Outbound webhook client timeout in seconds.
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
    /// Base URL of the context enrichment service.
    #[serde(default)]
    pub enrichment_base_url: Option<String>,
    /// Base URL of the record service backing create/update_record.
    #[serde(default)]
    pub record_service_base_url: Option<String>,
    /// Base URL of the notification service; absent means log-only.
    #[serde(default)]
    pub notification_base_url: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_sweeper_interval_secs() -> u64 {
    60
}

fn default_sweeper_batch_size() -> u32 {
    100
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_webhook_timeout_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            default_timeout_secs: default_timeout_secs(),
            sweeper_interval_secs: default_sweeper_interval_secs(),
            sweeper_batch_size: default_sweeper_batch_size(),
            context_cache_ttl_secs: default_cache_ttl_secs(),
            webhook_timeout_secs: default_webhook_timeout_secs(),
            enrichment_base_url: None,
            record_service_base_url: None,
            notification_base_url: None,
        }
    }
}

impl EngineConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.context_cache_ttl_secs)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    pub fn sweeper(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(self.sweeper_interval_secs),
            batch_size: self.sweeper_batch_size,
        }
    }
}

/// Resolve the data directory: `OPSFLOW_DATA_DIR`, else `~/.opsflow`.
pub fn default_data_dir() -> String {
    std::env::var("OPSFLOW_DATA_DIR").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/.opsflow")
    })
}

/// Load configuration from `{data_dir}/opsflow.toml`.
///
/// - Missing file: defaults.
/// - Unreadable or malformed file: defaults, with a warning.
pub async fn load_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("opsflow.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(
                "no opsflow.toml at {}, using defaults",
                config_path.display()
            );
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(
                "failed to read {}: {err}, using defaults",
                config_path.display()
            );
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}
