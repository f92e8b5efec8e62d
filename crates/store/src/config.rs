/// Tuning knobs for the autosave engine.
/// Every field has a default so partial JSON files are accepted.
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Result, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quiet period before a debounced save fires
    pub debounce_ms: u64,

    /// Backup save interval, independent of typing activity
    pub backup_interval_ms: u64,

    /// Automatic retries before a save failure is surfaced
    pub max_retries: u32,

    /// First retry delay; doubles on every further attempt
    pub backoff_base_ms: u64,

    /// Versions kept per document
    pub version_retention: usize,

    /// Lifetime of a draft cache entry
    pub cache_ttl_ms: u64,

    pub max_content_chars: usize,
    pub max_word_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            backup_interval_ms: 30_000,
            max_retries: 3,
            backoff_base_ms: 1_000,
            version_retention: 50,
            cache_ttl_ms: 300_000,
            max_content_chars: 1_000_000,
            max_word_count: 200_000,
        }
    }
}

impl EngineConfig {
    /// Loads a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.debounce_ms == 0 {
            return Err(StoreError::Config("debounce_ms must be positive".into()));
        }
        if self.backup_interval_ms == 0 {
            return Err(StoreError::Config(
                "backup_interval_ms must be positive".into(),
            ));
        }
        if self.version_retention == 0 {
            return Err(StoreError::Config(
                "version_retention must be at least 1".into(),
            ));
        }
        if self.cache_ttl_ms == 0 {
            return Err(StoreError::Config("cache_ttl_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_millis(self.backup_interval_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "debounce_ms": 500, "version_retention": 10 }"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.debounce(), Duration::from_millis(500));
        assert_eq!(config.version_retention, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn zero_retention_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "version_retention": 0 }"#).unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("engine.json");
        let config = EngineConfig {
            max_retries: 5,
            ..EngineConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }
}
