//! Dependency graph for reactive execution.
//!
//! This module provides:
//! - Cell registration with single-definition enforcement
//! - Topological ordering with a stable registration-order tie-break
//! - Cycle detection reporting the minimal cycle
//! - Affected-closure queries for changed variables

mod engine;
mod types;

pub use engine::{DEFAULT_PRIVATE_PREFIX, DependencyGraph};
pub use types::{
    BlockReason, Cell, CellId, CellSpec, CellStatus, CodeToken, CycleError, ExecutionPlan,
    MultipleDefinitionError, VarName,
};
