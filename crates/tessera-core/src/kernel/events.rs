//! Requests into the kernel and messages out of it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::elements::ElementId;
use crate::graph::{CellId, CellSpec, CellStatus, VarName};
use crate::models::ModelId;
use crate::runtime::StateId;
use crate::watch::WatchId;

/// A request queued for the kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    /// New or edited cells, as analyzed by the frontend.
    RegisterCells(Vec<CellSpec>),
    DeleteCell(CellId),
    /// Run these cells and everything downstream of them.
    RunCells(BTreeSet<CellId>),
    /// The frontend changed a UI element.
    SetElementValue { element: ElementId, value: Value },
    /// The frontend changed a widget model.
    ModelUpdate { model: ModelId, patch: Value },
    /// A state cell was written from outside any cell.
    SetState { state: StateId, value: Value },
    /// A watched path changed on disk.
    WatchTriggered(WatchId),
    /// Complete a name prefix; answered with [`KernelMessage::Completion`].
    Complete { request: u64, prefix: String },
}

impl KernelEvent {
    /// Whether a later `other` makes this event redundant.
    fn superseded_by(&self, other: &KernelEvent) -> bool {
        match (self, other) {
            (KernelEvent::Complete { .. }, KernelEvent::Complete { .. }) => true,
            (
                KernelEvent::SetElementValue { element: a, .. },
                KernelEvent::SetElementValue { element: b, .. },
            ) => a == b,
            _ => false,
        }
    }
}

/// Drop queued events that a later event of the same kind supersedes.
///
/// Only the newest completion request survives, and only the newest value per
/// UI element. Everything else keeps its order.
pub fn coalesce(events: Vec<KernelEvent>) -> Vec<KernelEvent> {
    let mut kept: Vec<KernelEvent> = Vec::with_capacity(events.len());
    for (i, event) in events.iter().enumerate() {
        if events[i + 1..].iter().any(|later| event.superseded_by(later)) {
            continue;
        }
        kept.push(event.clone());
    }
    kept
}

/// Why a cell did not produce outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CellError {
    /// The cell defines a name another live cell already defines.
    MultipleDefinition {
        name: VarName,
        /// The other cells defining `name`.
        cells: Vec<CellId>,
    },
    /// The cell is part of a dependency cycle.
    Cycle { cycle: Vec<CellId> },
    /// The cell's code failed.
    Exception { message: String },
    /// An ancestor failed, so this cell was not run.
    AncestorFailed { ancestor: CellId },
    /// An ancestor cannot run (cycle or multiple definition).
    AncestorBlocked { ancestor: CellId },
}

impl std::fmt::Display for CellError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellError::MultipleDefinition { name, cells } => {
                let cells: Vec<String> = cells.iter().map(|c| c.to_string()).collect();
                write!(f, "'{}' is also defined by {}", name, cells.join(", "))
            }
            CellError::Cycle { cycle } => {
                let cells: Vec<String> = cycle.iter().map(|c| c.to_string()).collect();
                write!(f, "cell is part of a cycle: {}", cells.join(" → "))
            }
            CellError::Exception { message } => f.write_str(message),
            CellError::AncestorFailed { ancestor } => write!(f, "ancestor {} failed", ancestor),
            CellError::AncestorBlocked { ancestor } => {
                write!(f, "ancestor {} cannot run", ancestor)
            }
        }
    }
}

/// Messages published by the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelMessage {
    /// A cell changed status.
    CellStatus { cell: CellId, status: CellStatus },

    /// A cell finished successfully.
    CellOutput {
        cell: CellId,
        /// Display value returned by the executor.
        display: Option<Value>,
        /// Whether the outputs came from the cache.
        cached: bool,
    },

    /// A cell failed or could not run.
    CellError { cell: CellId, error: CellError },

    /// A UI element's value changed; `patch` touches only the updated path
    /// inside the root composite.
    ElementValue { element: ElementId, patch: Value },

    /// Answer to [`KernelEvent::Complete`]; `names` is `None` when the
    /// namespace was busy and the request should be retried.
    Completion {
        request: u64,
        names: Option<Vec<VarName>>,
    },

    /// A cell references names no live cell defines.
    DanglingRefs { cell: CellId, names: Vec<VarName> },

    /// A cell was removed.
    CellDeleted { cell: CellId },
}

/// Cloneable sender for queuing [`KernelEvent`]s from any thread.
#[derive(Clone)]
pub struct KernelHandle {
    tx: mpsc::UnboundedSender<KernelEvent>,
}

impl KernelHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<KernelEvent>) -> Self {
        Self { tx }
    }

    /// Queue an event. Returns `false` once the kernel is gone.
    pub fn send(&self, event: KernelEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn register_cells(&self, specs: Vec<CellSpec>) -> bool {
        self.send(KernelEvent::RegisterCells(specs))
    }

    pub fn delete_cell(&self, cell: CellId) -> bool {
        self.send(KernelEvent::DeleteCell(cell))
    }

    pub fn run_cells(&self, cells: impl IntoIterator<Item = CellId>) -> bool {
        self.send(KernelEvent::RunCells(cells.into_iter().collect()))
    }

    pub fn set_element_value(&self, element: ElementId, value: Value) -> bool {
        self.send(KernelEvent::SetElementValue { element, value })
    }

    pub fn model_update(&self, model: ModelId, patch: Value) -> bool {
        self.send(KernelEvent::ModelUpdate { model, patch })
    }

    pub fn set_state(&self, state: StateId, value: Value) -> bool {
        self.send(KernelEvent::SetState { state, value })
    }

    pub fn complete(&self, request: u64, prefix: impl Into<String>) -> bool {
        self.send(KernelEvent::Complete {
            request,
            prefix: prefix.into(),
        })
    }
}
