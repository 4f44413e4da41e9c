//! Sync configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use harborsync_common::{Collection, ConflictStrategy, Error, Result};

use crate::network::NetworkConfig;
use crate::retry::RetryConfig;
use crate::scheduler::SyncMode;

/// Configuration for the sync engine and its context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// SQLite database file. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    /// Base URL of the backend API.
    pub backend_url: Option<String>,
    /// Collections covered by `sync_all`.
    pub collections: Vec<Collection>,
    /// Strategy used when a sync call does not name one.
    pub default_strategy: ConflictStrategy,
    /// Attempts per request before it is marked failed.
    pub max_retries: u32,
    pub retry: RetryConfig,
    pub network: NetworkConfig,
    pub sync_mode: SyncMode,
    /// Refresh collections from the backend after draining the queue.
    pub pull_on_sync: bool,
    /// Longest backoff a running pass waits out before leaving the request
    /// for the next pass.
    pub max_inline_backoff: Duration,
    /// Transport request timeout.
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            backend_url: None,
            collections: Collection::defaults(),
            default_strategy: ConflictStrategy::ServerWins,
            max_retries: 3,
            retry: RetryConfig::default(),
            network: NetworkConfig::default(),
            sync_mode: SyncMode::OnDemand,
            pull_on_sync: true,
            max_inline_backoff: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from {}", path.display());
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Read a config file, or use the defaults if it does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Write the config file, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::InvalidInput(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::InvalidInput(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if let SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } = self.sync_mode {
            if interval.is_zero() {
                return Err(Error::InvalidInput(
                    "sync interval must be positive".to_string(),
                ));
            }
        }
        if self.network.probe_interval.is_zero() {
            return Err(Error::InvalidInput(
                "network.probe_interval must be positive".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.collections.iter().find(|c| !seen.insert(*c)) {
            return Err(Error::InvalidInput(format!(
                "Collection {} listed twice",
                dup
            )));
        }
        Ok(())
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = Some(url.into());
        self
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.collections.len(), 4);
        assert_eq!(config.default_strategy, ConflictStrategy::ServerWins);
        assert_eq!(config.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SyncConfig::from_json(
            r#"{"default_strategy": "manual", "sync_mode": {"mode": "periodic", "interval": {"secs": 60, "nanos": 0}}}"#,
        )
        .unwrap();
        assert_eq!(config.default_strategy, ConflictStrategy::Manual);
        assert_eq!(
            config.sync_mode,
            SyncMode::Periodic {
                interval: Duration::from_secs(60)
            }
        );
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(SyncConfig::from_json(r#"{"max_retry": 5}"#).is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = SyncConfig::default();
        config.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.collections.push(Collection::containers());
        assert!(config.validate().is_err());

        let config = SyncConfig::default().with_sync_mode(SyncMode::Hybrid {
            interval: Duration::ZERO,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");

        let config = SyncConfig::default()
            .with_backend_url("http://localhost:8080/api")
            .with_strategy(ConflictStrategy::ClientWins);
        config.save(&path).unwrap();

        assert_eq!(SyncConfig::load(&path).unwrap(), config);
        assert_eq!(
            SyncConfig::load_or_default(temp.path().join("missing.json")).unwrap(),
            SyncConfig::default()
        );
    }
}
