//! Cache persistence using rkyv.
//!
//! Snapshots of the [`CacheEngine`](super::CacheEngine) can be written to
//! disk and restored on the next kernel start, so unchanged units are served
//! from the cache instead of being recomputed.
//!
//! # Usage
//!
//! ```ignore
//! use tessera_core::cache::{CacheEngine, CachePersistence};
//!
//! let cache = CacheEngine::new();
//! if let Some(snapshot) = CachePersistence::load(&path)? {
//!     cache.restore(&snapshot);
//! }
//!
//! // ... run cells ...
//!
//! CachePersistence::save(&path, &cache.snapshot())?;
//! ```

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use rkyv::{Archive, Deserialize, Serialize, rancor};

use super::engine::{CacheEntry, ScopeId, unix_now};
use super::hash::{Digest, HashStrategy};

/// Current cache format version.
///
/// Increment this when the cache format changes in an incompatible way.
/// Old caches with different versions will be automatically invalidated.
pub const CACHE_VERSION: u32 = 1;

/// Snapshot of cache entries that can be persisted to disk.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Default)]
pub struct CacheSnapshot {
    /// Cache format version for compatibility checking.
    pub version: u32,

    /// Unix timestamp when the snapshot was taken.
    pub created_at: u64,

    pub entries: Vec<PersistedEntry>,
}

/// One cache entry in archived form.
///
/// Results are stored as JSON text; the strategy is split into its variant
/// flag and digest bytes.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PersistedEntry {
    pub scope: String,
    pub execution_path: bool,
    pub digest: [u8; 32],
    pub result_json: String,
    pub side_effect_digest: [u8; 32],
    pub created_at: u64,
}

impl PersistedEntry {
    pub(crate) fn from_entry(scope: &ScopeId, entry: &CacheEntry) -> Self {
        Self {
            scope: scope.as_str().to_string(),
            execution_path: !entry.strategy.is_content_addressed(),
            digest: *entry.strategy.digest().as_bytes(),
            result_json: entry.result.to_string(),
            side_effect_digest: *entry.side_effect_digest.as_bytes(),
            created_at: entry.created_at,
        }
    }

    pub(crate) fn to_entry(&self) -> Option<(ScopeId, CacheEntry)> {
        let result = serde_json::from_str(&self.result_json).ok()?;
        let digest = Digest::from_bytes(self.digest);
        let strategy = if self.execution_path {
            HashStrategy::ExecutionPath(digest)
        } else {
            HashStrategy::ContentAddressed(digest)
        };
        Some((
            ScopeId::new(self.scope.clone()),
            CacheEntry {
                strategy,
                result,
                side_effect_digest: Digest::from_bytes(self.side_effect_digest),
                created_at: self.created_at,
            },
        ))
    }
}

/// Error type for cache persistence.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// IO error reading/writing cache file.
    #[error("cache IO error: {0}")]
    Io(#[from] io::Error),

    /// Cache format version mismatch.
    #[error("cache version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Failed to deserialize cache data.
    #[error("cache deserialize error: {0}")]
    Deserialize(String),

    /// Failed to serialize cache data.
    #[error("cache serialize error: {0}")]
    Serialize(String),
}

/// Cache persistence operations.
pub struct CachePersistence;

impl CachePersistence {
    /// Save a cache snapshot to disk.
    ///
    /// Creates parent directories if they don't exist.
    /// Uses atomic write (write to temp file, then rename) to prevent corruption.
    pub fn save(path: &Path, snapshot: &CacheSnapshot) -> Result<(), CacheError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = rkyv::to_bytes::<rancor::Error>(snapshot)
            .map_err(|e| CacheError::Serialize(e.to_string()))?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        fs::rename(&temp_path, path)?;

        tracing::debug!(
            "Saved cache snapshot: {} entries, {} bytes",
            snapshot.entries.len(),
            bytes.len()
        );

        Ok(())
    }

    /// Load a cache snapshot from disk.
    ///
    /// Returns `Ok(None)` if the cache file doesn't exist.
    /// Returns `Err` if the cache exists but is invalid or incompatible.
    pub fn load(path: &Path) -> Result<Option<CacheSnapshot>, CacheError> {
        if !path.exists() {
            tracing::debug!("No cache file at {:?}", path);
            return Ok(None);
        }

        let mut file = fs::File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let archived = rkyv::access::<ArchivedCacheSnapshot, rancor::Error>(&bytes)
            .map_err(|e| CacheError::Deserialize(e.to_string()))?;

        let found_version: u32 = archived.version.into();
        if found_version != CACHE_VERSION {
            return Err(CacheError::VersionMismatch {
                expected: CACHE_VERSION,
                found: found_version,
            });
        }

        let snapshot: CacheSnapshot = rkyv::deserialize::<CacheSnapshot, rancor::Error>(archived)
            .map_err(|e| CacheError::Deserialize(e.to_string()))?;

        tracing::debug!(
            "Loaded cache snapshot: {} entries, created at {}",
            snapshot.entries.len(),
            snapshot.created_at
        );

        Ok(Some(snapshot))
    }

    /// Delete the cache file if it exists.
    pub fn invalidate(path: &Path) -> Result<(), CacheError> {
        if path.exists() {
            fs::remove_file(path)?;
            tracing::debug!("Invalidated cache at {:?}", path);
        }
        Ok(())
    }
}

impl CacheSnapshot {
    /// Create an empty snapshot stamped with the current time.
    pub fn new() -> Self {
        Self {
            version: CACHE_VERSION,
            created_at: unix_now(),
            entries: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, entry: PersistedEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
