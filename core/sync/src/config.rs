//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use twinsync_common::{Error, Result};

use crate::conflict::ConflictStrategy;
use crate::retry::RetryConfig;

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Local changes read per batch.
    pub batch_size: usize,
    /// Conflict resolution strategy.
    pub conflict_strategy: ConflictStrategy,
    /// Modification times closer than this never conflict.
    #[serde(with = "duration_ms")]
    pub conflict_window: Duration,
    /// Minimum age before a missing counterpart means deletion.
    #[serde(with = "duration_ms")]
    pub grace_window: Duration,
    /// Number of past outcomes kept for diagnostics.
    pub history_len: usize,
    /// Retry behaviour for remote calls.
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            conflict_strategy: ConflictStrategy::MostRecent,
            conflict_window: Duration::from_secs(5),
            grace_window: Duration::from_secs(5 * 60),
            history_len: 10,
            retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Set batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set conflict strategy.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    /// Set conflict window.
    pub fn with_conflict_window(mut self, window: Duration) -> Self {
        self.conflict_window = window;
        self
    }

    /// Set deletion grace window.
    pub fn with_grace_window(mut self, window: Duration) -> Self {
        self.grace_window = window;
        self
    }

    /// Set retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Load a configuration from a JSON file. Missing keys take defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(Error::Io)?;
        Self::from_json(&content)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        if config.batch_size == 0 {
            return Err(Error::Validation("batchSize must be positive".to_string()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.conflict_strategy, ConflictStrategy::MostRecent);
        assert_eq!(config.conflict_window, Duration::from_secs(5));
        assert_eq!(config.grace_window, Duration::from_secs(300));
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = SyncConfig::from_json(r#"{ "graceWindow": 60000, "conflictStrategy": "remoteWins" }"#)
            .unwrap();
        assert_eq!(config.grace_window, Duration::from_secs(60));
        assert_eq!(config.conflict_strategy, ConflictStrategy::RemoteWins);
        assert_eq!(config.batch_size, 50);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = SyncConfig::default()
            .with_batch_size(7)
            .with_conflict_window(Duration::from_millis(1500));
        let restored = SyncConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn test_zero_batch_rejected() {
        assert!(SyncConfig::from_json(r#"{ "batchSize": 0 }"#).is_err());
    }
}
