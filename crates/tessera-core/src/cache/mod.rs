//! Content-addressed caching.
//!
//! This module provides:
//! - Unit identification (content-addressed with execution-path fallback)
//! - A thread-safe result store keyed by `(scope, hash)`
//! - Disk persistence of cache snapshots
//!
//! # Module Organization
//!
//! - [`hash`] - Digests, strategies, units and the recursive hasher
//! - [`engine`] - The in-memory store
//! - [`persist`] - rkyv snapshots

pub mod engine;
pub mod hash;
pub mod persist;

pub use engine::{CacheEngine, CacheEntry, CacheStats, ScopeId};
pub use hash::{
    CacheUnit, Digest, ExecutionTrace, HashStrategy, ModuleRef, Resolved, TraceOp,
    UnitEnvironment,
};
pub use persist::{CACHE_VERSION, CacheError, CachePersistence, CacheSnapshot, PersistedEntry};
