//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StrataError};

/// Smallest pool accepted: enough for a root split of a two-level tree from a
/// single writer. An insert pins its latched path plus one fresh page per
/// splitting level, so deeper trees and concurrent writers need more frames.
pub const MIN_POOL_PAGES: usize = 4;

/// Configuration for a database instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding table files, the log and checkpoint snapshots.
    pub data_dir: PathBuf,
    /// Buffer pool size (in pages) for each table.
    pub buffer_pool_pages: usize,
    /// Name of the write-ahead log file inside `data_dir`.
    pub log_file: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            buffer_pool_pages: 1024,
            log_file: "strata.wal".to_string(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration rooted at `data_dir` with default settings.
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Builds a configuration from `STRATA_DATA_DIR` and `STRATA_POOL_PAGES`,
    /// falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("STRATA_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(raw) = std::env::var("STRATA_POOL_PAGES") {
            config.buffer_pool_pages = raw.trim().parse().map_err(|_| {
                StrataError::Config(format!("STRATA_POOL_PAGES is not a number: {raw:?}"))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_pool_pages < MIN_POOL_PAGES {
            return Err(StrataError::Config(format!(
                "buffer_pool_pages must be at least {MIN_POOL_PAGES}, got {}",
                self.buffer_pool_pages
            )));
        }
        if self.log_file.is_empty() || self.log_file.contains('/') {
            return Err(StrataError::Config(format!(
                "log_file must be a plain file name, got {:?}",
                self.log_file
            )));
        }
        Ok(())
    }

    /// Path of the write-ahead log.
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(&self.log_file)
    }

    /// Directory holding checkpoint snapshots.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.buffer_pool_pages, 1024);
        assert_eq!(config.log_path(), PathBuf::from("./data/strata.wal"));
        assert_eq!(config.checkpoint_dir(), PathBuf::from("./data/checkpoints"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_rejects_tiny_pool() {
        let config = EngineConfig {
            buffer_pool_pages: 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StrataError::Config(_))));
    }

    #[test]
    fn test_engine_config_rejects_nested_log_file() {
        let config = EngineConfig {
            log_file: "wal/strata.wal".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_config_serde_roundtrip() {
        let original = EngineConfig::with_data_dir("/var/lib/strata");
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: EngineConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original.data_dir, deserialized.data_dir);
        assert_eq!(original.buffer_pool_pages, deserialized.buffer_pool_pages);
        assert_eq!(original.log_file, deserialized.log_file);
    }
}
