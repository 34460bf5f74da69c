//! Core engine for the Tessera reactive notebook kernel.
//!
//! This crate provides:
//! - Dependency graph over cell definitions and references
//! - Reactive kernel scheduling and running cells through a pluggable executor
//! - UI element registry with lens-based update projection
//! - Reactive state, widget model bindings and watched files
//! - Content-addressed caching with execution-path fallback and persistence

pub mod cache;
pub mod config;
pub mod elements;
pub mod error;
pub mod graph;
pub mod kernel;
pub mod models;
pub mod namespace;
pub mod runtime;
pub mod watch;

pub use cache::{CacheEngine, CacheUnit, Digest, HashStrategy, ScopeId};
pub use config::KernelConfig;
pub use elements::{ElementId, ElementKind, ElementRegistry, Lens};
pub use error::{Error, Result};
pub use graph::{CellId, CellSpec, CellStatus, CodeToken, DependencyGraph, VarName};
pub use kernel::{
    AbortHandle, CellError, CellExecutor, CellFailure, CellOutput, CellRequest, Kernel,
    KernelEvent, KernelHandle, KernelMessage, RunReport, Task,
};
pub use models::{ModelBindingTable, ModelId};
pub use namespace::{Binding, CompletionWorker, Namespace, SharedNamespace};
pub use runtime::{Origin, Runtime, StateId};
pub use watch::{WatchId, WatchedDirectory, WatchedFile};
