//! Content-addressed result store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::hash::{
    CacheUnit, Digest, ExecutionTrace, HashStrategy, Purity, UnitEnvironment, UnitHasher,
    execution_path,
};
use super::persist::{CacheSnapshot, PersistedEntry};
use crate::error::{Error, Result};
use crate::graph::CellId;

/// Collaborator-supplied namespace for cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(String);

impl ScopeId {
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    /// Scope for everything cached on behalf of one cell.
    pub fn for_cell(cell: CellId) -> Self {
        Self(cell.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// The strategy (and digest) that produced this entry.
    pub strategy: HashStrategy,
    pub result: Value,
    /// Digest of the side effects observed while computing `result`.
    pub side_effect_digest: Digest,
    /// Unix timestamp (seconds).
    pub created_at: u64,
}

type CacheKey = (ScopeId, Digest);

/// Execution paths kept per impure unit.
const MAX_RECORDED_PATHS: usize = 8;

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
}

/// Stores and looks up cached results by `(scope, hash)`.
///
/// Safe to share across threads. Concurrent [`get_or_compute`](Self::get_or_compute)
/// callers for the same key compute at most once; plain [`store`](Self::store)
/// is last-writer-wins.
#[derive(Default)]
pub struct CacheEngine {
    entries: Mutex<FxHashMap<CacheKey, CacheEntry>>,
    inflight: Mutex<FxHashMap<CacheKey, Arc<Mutex<()>>>>,
    /// Traces of past runs of impure units, keyed by unit identity
    paths: Mutex<FxHashMap<CacheKey, Vec<ExecutionTrace>>>,
    module_pinning: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl CacheEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable module pinning for subsequent identifications.
    pub fn with_module_pinning(self, pinned: bool) -> Self {
        self.module_pinning.store(pinned, Ordering::Relaxed);
        self
    }

    pub fn set_module_pinning(&self, pinned: bool) {
        self.module_pinning.store(pinned, Ordering::Relaxed);
    }

    pub fn module_pinning(&self) -> bool {
        self.module_pinning.load(Ordering::Relaxed)
    }

    /// Compute the effective strategy for `unit`.
    pub fn identify(&self, unit: &CacheUnit, env: &dyn UnitEnvironment) -> Result<HashStrategy> {
        self.identify_pinned(unit, env, self.module_pinning())
    }

    /// Like [`identify`](Self::identify) with an explicit pinning choice.
    pub fn identify_pinned(
        &self,
        unit: &CacheUnit,
        env: &dyn UnitEnvironment,
        pinned: bool,
    ) -> Result<HashStrategy> {
        UnitHasher::new(env, pinned).identify(unit)
    }

    /// Look up an entry.
    ///
    /// An entry stored under the same digest by a different strategy is an
    /// internal inconsistency and reported as [`Error::CacheKeyMismatch`].
    pub fn lookup(&self, scope: &ScopeId, strategy: &HashStrategy) -> Result<Option<CacheEntry>> {
        let key = (scope.clone(), strategy.digest());
        let found = self.entries.lock().get(&key).cloned();

        match found {
            Some(entry) if entry.strategy == *strategy => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry))
            }
            Some(entry) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(Error::CacheKeyMismatch {
                    scope: scope.to_string(),
                    expected: strategy.kind().to_string(),
                    found: entry.strategy.kind().to_string(),
                })
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Store a result. Overwrites any existing entry for the key.
    pub fn store(
        &self,
        scope: &ScopeId,
        strategy: HashStrategy,
        result: Value,
        side_effect_digest: Digest,
    ) {
        let entry = CacheEntry {
            strategy,
            result,
            side_effect_digest,
            created_at: unix_now(),
        };
        self.entries
            .lock()
            .insert((scope.clone(), strategy.digest()), entry);
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    /// Return the cached result for the key, computing and storing it on a miss.
    ///
    /// Concurrent callers for the same key wait for the first computation
    /// instead of repeating it.
    pub fn get_or_compute<F>(&self, scope: &ScopeId, strategy: HashStrategy, compute: F) -> Result<Value>
    where
        F: FnOnce() -> Result<Value>,
    {
        if let Some(hit) = self.lookup_recoverable(scope, &strategy) {
            return Ok(hit.result);
        }

        let key = (scope.clone(), strategy.digest());
        let slot = self
            .inflight
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = slot.lock();

        if let Some(hit) = self.lookup_recoverable(scope, &strategy) {
            return Ok(hit.result);
        }

        let result = compute();
        if let Ok(value) = &result {
            self.store(scope, strategy, value.clone(), Digest::default());
        }

        drop(guard);
        let mut inflight = self.inflight.lock();
        if inflight.get(&key).is_some_and(|s| Arc::ptr_eq(s, &slot)) && Arc::strong_count(&slot) <= 2 {
            inflight.remove(&key);
        }

        result
    }

    /// Identify `unit` and serve it from the cache.
    ///
    /// `compute` runs the unit and returns its result with the trace of what
    /// it did. Pure units are keyed by content. Impure units are keyed by the
    /// execution path of an earlier run: when every operation of a recorded
    /// path still holds in `env`, its result is served without running the
    /// unit. Identity failures degrade to always recomputing.
    pub fn cached_call<F>(
        &self,
        scope: &ScopeId,
        unit: &CacheUnit,
        env: &dyn UnitEnvironment,
        compute: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Result<(Value, ExecutionTrace)>,
    {
        let mut hasher = UnitHasher::new(env, self.module_pinning());
        match hasher.purity(unit) {
            Ok(Purity::Pure(digest)) => {
                self.get_or_compute(scope, HashStrategy::ContentAddressed(digest), || {
                    compute().map(|(value, _)| value)
                })
            }
            Ok(Purity::Impure(reason)) => {
                tracing::debug!(unit = %unit.name, "keyed by execution path: {}", reason);
                self.cached_path_call(scope, unit, env, compute)
            }
            Err(e) => {
                tracing::warn!(unit = %unit.name, "cache identity failed, recomputing: {}", e);
                compute().map(|(value, _)| value)
            }
        }
    }

    fn cached_path_call<F>(
        &self,
        scope: &ScopeId,
        unit: &CacheUnit,
        env: &dyn UnitEnvironment,
        compute: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Result<(Value, ExecutionTrace)>,
    {
        let key = (scope.clone(), unit.identity());
        let recorded = self.paths.lock().get(&key).cloned().unwrap_or_default();

        let mut looked_up = false;
        for trace in recorded.iter().rev() {
            if !trace.ops().iter().all(|op| env.still_holds(op)) {
                continue;
            }
            looked_up = true;
            if let Some(hit) = self.lookup_recoverable(scope, &execution_path(unit, trace)) {
                return Ok(hit.result);
            }
        }
        if !looked_up {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        let (value, trace) = compute()?;
        self.store(scope, execution_path(unit, &trace), value.clone(), trace.digest());

        let mut paths = self.paths.lock();
        let traces = paths.entry(key).or_default();
        traces.retain(|t| t != &trace);
        traces.push(trace);
        if traces.len() > MAX_RECORDED_PATHS {
            traces.remove(0);
        }
        Ok(value)
    }

    fn lookup_recoverable(&self, scope: &ScopeId, strategy: &HashStrategy) -> Option<CacheEntry> {
        match self.lookup(scope, strategy) {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(%scope, "treating cache entry as a miss: {}", e);
                None
            }
        }
    }

    /// Drop every entry in a scope.
    pub fn invalidate_scope(&self, scope: &ScopeId) -> usize {
        self.paths.lock().retain(|(s, _), _| s != scope);
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(s, _), _| s != scope);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.paths.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
        }
    }

    /// Capture every entry for persistence.
    pub fn snapshot(&self) -> CacheSnapshot {
        let mut snapshot = CacheSnapshot::new();
        for ((scope, _), entry) in self.entries.lock().iter() {
            snapshot.add_entry(PersistedEntry::from_entry(scope, entry));
        }
        snapshot
    }

    /// Load entries from a snapshot, keeping newer in-memory entries.
    ///
    /// Returns the number of entries restored. Entries whose payload no longer
    /// decodes are skipped.
    pub fn restore(&self, snapshot: &CacheSnapshot) -> usize {
        let mut entries = self.entries.lock();
        let mut restored = 0;
        for persisted in &snapshot.entries {
            let Some((scope, entry)) = persisted.to_entry() else {
                tracing::debug!(scope = %persisted.scope, "skipping undecodable cache entry");
                continue;
            };
            let key = (scope, entry.strategy.digest());
            if !entries.contains_key(&key) {
                entries.insert(key, entry);
                restored += 1;
            }
        }
        restored
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
