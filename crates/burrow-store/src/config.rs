//! Store configuration

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{StoreError, StoreResult};
use crate::log::DEFAULT_MAX_RECORD_SIZE;

/// Configuration for opening a [`Store`](crate::Store)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the log file
    pub path: PathBuf,
    /// Rewrite the log down to live keys while opening
    pub compact_on_open: bool,
    /// Decode every replayed value at open instead of on first read
    pub eager_decode: bool,
    /// Changes buffered per observer before the oldest are dropped
    pub observer_capacity: usize,
    /// Records larger than this are treated as corruption on replay
    pub max_record_size: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/burrow.log"),
            compact_on_open: false,
            eager_decode: false,
            observer_capacity: 256,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
        }
    }
}

impl StoreConfig {
    /// Default configuration for a log at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document
    pub fn from_toml(text: &str) -> StoreResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub async fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_toml(&text)
    }

    /// Set whether to compact while opening
    pub fn with_compact_on_open(mut self, compact: bool) -> Self {
        self.compact_on_open = compact;
        self
    }

    /// Set whether to decode all values at open
    pub fn with_eager_decode(mut self, eager: bool) -> Self {
        self.eager_decode = eager;
        self
    }

    /// Set the per-observer buffer size
    pub fn with_observer_capacity(mut self, capacity: usize) -> Self {
        self.observer_capacity = capacity;
        self
    }

    /// Set the largest record accepted on replay
    pub fn with_max_record_size(mut self, size: u64) -> Self {
        self.max_record_size = size;
        self
    }

    /// Check the configuration for values the store cannot work with
    pub fn validate(&self) -> StoreResult<()> {
        if self.path.as_os_str().is_empty() {
            return Err(StoreError::InvalidConfig("path must not be empty".into()));
        }
        if self.path.file_name().is_none() {
            return Err(StoreError::InvalidConfig(format!(
                "path {} does not name a file",
                self.path.display()
            )));
        }
        if self.observer_capacity == 0 {
            return Err(StoreError::InvalidConfig(
                "observer_capacity must be at least 1".into(),
            ));
        }
        if self.max_record_size == 0 {
            return Err(StoreError::InvalidConfig(
                "max_record_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        StoreConfig::default().validate().unwrap();
    }

    #[test]
    fn test_from_toml_partial() {
        let config = StoreConfig::from_toml(
            r#"
            path = "/tmp/timeline.log"
            compact_on_open = true
            "#,
        )
        .unwrap();

        assert_eq!(config.path, PathBuf::from("/tmp/timeline.log"));
        assert!(config.compact_on_open);
        assert!(!config.eager_decode);
        assert_eq!(config.observer_capacity, 256);
    }

    #[test]
    fn test_from_toml_rejects_unknown_types() {
        assert!(matches!(
            StoreConfig::from_toml("observer_capacity = \"lots\""),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = StoreConfig::new("x.log").with_observer_capacity(0);
        assert!(matches!(
            config.validate(),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_directory_path() {
        let config = StoreConfig::new("/");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_setters() {
        let config = StoreConfig::new("store.log")
            .with_compact_on_open(true)
            .with_eager_decode(true)
            .with_max_record_size(1024);
        assert!(config.compact_on_open);
        assert!(config.eager_decode);
        assert_eq!(config.max_record_size, 1024);
    }
}
