//! Kernel configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::DEFAULT_PRIVATE_PREFIX;

/// Default capacity of the outbound message channel.
pub const DEFAULT_MESSAGE_CAPACITY: usize = 256;

/// Default debounce window for file watching.
pub const DEFAULT_DEBOUNCE_MS: u64 = 200;

/// Configuration for a [`Kernel`](crate::Kernel).
///
/// Every field has a default, so a config file only needs to name what it
/// changes:
///
/// ```json
/// { "module_pinning": true, "cache": { "persist_path": ".tessera/cache.bin" } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Names with this prefix are private to their cell.
    pub private_prefix: String,
    /// Serve unchanged pure cells from the cache.
    pub cell_cache: bool,
    /// Include module versions in content hashes.
    pub module_pinning: bool,
    /// Capacity of the broadcast channel for kernel messages.
    pub message_capacity: usize,
    pub watch: WatchConfig,
    pub cache: CacheConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            private_prefix: DEFAULT_PRIVATE_PREFIX.to_string(),
            cell_cache: true,
            module_pinning: false,
            message_capacity: DEFAULT_MESSAGE_CAPACITY,
            watch: WatchConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Start an OS file watcher for watched handles.
    pub enabled: bool,
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Where cache snapshots are loaded from and saved to.
    pub persist_path: Option<PathBuf>,
}

impl KernelConfig {
    /// Parse a JSON config document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.message_capacity == 0 {
            return Err(Error::Config("message_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = KernelConfig::default();
        assert_eq!(config.private_prefix, "_");
        assert!(config.cell_cache);
        assert!(!config.module_pinning);
        assert_eq!(config.message_capacity, 256);
        assert_eq!(config.watch.debounce(), Duration::from_millis(200));
        assert!(config.cache.persist_path.is_none());
    }

    #[test]
    fn test_partial_document() {
        let config = KernelConfig::from_json_str(
            r#"{ "module_pinning": true, "watch": { "enabled": false } }"#,
        )
        .unwrap();
        assert!(config.module_pinning);
        assert!(!config.watch.enabled);
        assert_eq!(config.watch.debounce_ms, DEFAULT_DEBOUNCE_MS);
        assert!(config.cell_cache);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = KernelConfig::from_json_str(r#"{ "message_capacity": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tessera.json");
        std::fs::write(&path, r#"{ "cache": { "persist_path": "cache.bin" } }"#).unwrap();

        let config = KernelConfig::load(&path).unwrap();
        assert_eq!(config.cache.persist_path, Some(PathBuf::from("cache.bin")));
    }

    #[test]
    fn test_malformed_file_names_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{").unwrap();

        let err = KernelConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
