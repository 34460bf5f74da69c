//! Types for the dependency graph.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Name of a variable in the global namespace.
pub type VarName = String;

/// Unique identifier for a cell within a notebook.
///
/// Identifiers are supplied by the static analyzer and are otherwise opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellId(pub(crate) usize);

impl CellId {
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cell_{}", self.0)
    }
}

/// Opaque execution token for a cell's code.
///
/// The kernel never interprets this; it is handed to the injected executor
/// and hashed for cell-level caching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeToken(String);

impl CodeToken {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CodeToken {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

/// Execution status of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    /// Not scheduled; outputs (if any) are current.
    #[default]
    Idle,
    /// Part of the current run-set, waiting for its turn.
    Queued,
    /// Currently executing.
    Running,
    /// Inputs changed but the cell was not executed (blocked on an ancestor).
    Stale,
    /// Last execution failed, or the cell is structurally invalid.
    Error,
}

/// Analyzer output for one cell: `cell_id -> (defs, refs, code)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSpec {
    pub id: CellId,
    pub code: CodeToken,
    #[serde(default)]
    pub defs: BTreeSet<VarName>,
    #[serde(default)]
    pub refs: BTreeSet<VarName>,
}

impl CellSpec {
    pub fn new<D, R>(id: CellId, code: impl Into<String>, defs: D, refs: R) -> Self
    where
        D: IntoIterator,
        D::Item: Into<VarName>,
        R: IntoIterator,
        R::Item: Into<VarName>,
    {
        Self {
            id,
            code: CodeToken::new(code),
            defs: defs.into_iter().map(Into::into).collect(),
            refs: refs.into_iter().map(Into::into).collect(),
        }
    }
}

/// A cell registered with the graph.
#[derive(Debug, Clone)]
pub struct Cell {
    /// Unique identifier
    pub id: CellId,
    /// Opaque code token
    pub code: CodeToken,
    /// Variables this cell binds
    pub defs: BTreeSet<VarName>,
    /// Variables this cell reads
    pub refs: BTreeSet<VarName>,
    /// Current execution status
    pub status: CellStatus,
    /// Position in first-registration order, used as the tie-break
    pub(crate) seq: u64,
}

impl Cell {
    /// Registration order of the cell (stable across re-registration).
    pub fn registration_index(&self) -> u64 {
        self.seq
    }
}

/// A registration was rejected because a name is already bound elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipleDefinitionError {
    /// The cell whose registration was rejected.
    pub cell: CellId,
    /// Each conflicting name with the live cell that already defines it.
    pub conflicts: Vec<(VarName, CellId)>,
}

impl std::fmt::Display for MultipleDefinitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .conflicts
            .iter()
            .map(|(name, owner)| format!("'{}' (already defined by {})", name, owner))
            .collect();
        write!(f, "{} redefines {}", self.cell, names.join(", "))
    }
}

impl std::error::Error for MultipleDefinitionError {}

impl From<MultipleDefinitionError> for Error {
    fn from(e: MultipleDefinitionError) -> Self {
        let (name, owner) = e
            .conflicts
            .first()
            .cloned()
            .unwrap_or_else(|| (String::new(), e.cell));
        Error::MultipleDefinition {
            name,
            cells: vec![owner, e.cell],
        }
    }
}

/// A cycle among cells, reported as the minimal cycle found.
///
/// The cycle starts at its earliest-registered member and follows
/// definer → referrer edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub cycle: Vec<CellId>,
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path: Vec<String> = self.cycle.iter().map(|c| c.to_string()).collect();
        write!(f, "cycle: {}", path.join(" → "))
    }
}

impl std::error::Error for CycleError {}

impl From<CycleError> for Error {
    fn from(e: CycleError) -> Self {
        Error::Cycle { cycle: e.cycle }
    }
}

/// Why a cell in a run-set cannot execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// The cell is a member of this cycle.
    InCycle(Vec<CellId>),
    /// The cell depends (transitively) on a cell in a cycle.
    DownstreamOfCycle(CellId),
}

/// Execution plan for a run-set.
///
/// Cells in `order` can run; cells in `blocked` are structurally prevented
/// from running and must be reported instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub order: Vec<CellId>,
    pub cycles: Vec<CycleError>,
    pub blocked: Vec<(CellId, BlockReason)>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.order.is_empty() && self.blocked.is_empty()
    }
}
