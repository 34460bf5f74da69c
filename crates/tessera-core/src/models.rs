//! Model bindings and observe dispatch.
//!
//! Widgets backed by an external model (a frontend object with its own
//! state) are identified by an opaque [`ModelId`]. The table remembers which
//! cell created each model so that external updates can run the model's
//! observe callbacks inside that cell's execution context.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::graph::CellId;
use crate::runtime::Runtime;

/// Opaque identifier of a widget model.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Callback invoked with the patch of an external model update.
pub type ObserveCallback = Arc<dyn Fn(&Runtime, &Value) -> Result<()> + Send + Sync>;

/// Where a model lives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelBinding {
    /// Owning cell, when the model was observed directly in a cell.
    pub cell: Option<CellId>,
    /// Enclosing model, for widgets nesting other widgets.
    pub parent: Option<ModelId>,
}

/// An external update resolved to its owning cell.
pub struct Dispatch {
    pub model: ModelId,
    pub cell: CellId,
    pub observers: Vec<ObserveCallback>,
}

/// Maps model ids to the cells that created them.
#[derive(Default)]
pub struct ModelBindingTable {
    bindings: FxHashMap<ModelId, ModelBinding>,
    /// Callbacks per model, with the cell that registered each
    observers: FxHashMap<ModelId, Vec<(CellId, ObserveCallback)>>,
}

impl ModelBindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `cell` created `model`.
    pub fn bind(&mut self, model: ModelId, cell: CellId) {
        self.bindings.entry(model).or_default().cell = Some(cell);
    }

    /// Nest `child` inside `parent`.
    pub fn link(&mut self, child: ModelId, parent: ModelId) {
        self.bindings.entry(child).or_default().parent = Some(parent);
    }

    /// Register a callback, made by `cell`, for external updates of `model`.
    pub fn observe(&mut self, model: ModelId, cell: CellId, callback: ObserveCallback) {
        self.observers.entry(model).or_default().push((cell, callback));
    }

    pub fn binding(&self, model: &ModelId) -> Option<&ModelBinding> {
        self.bindings.get(model)
    }

    /// Owning cell, following parent links for nested models.
    pub fn owner(&self, model: &ModelId) -> Option<CellId> {
        let mut seen: FxHashSet<&ModelId> = FxHashSet::default();
        let mut current = model;
        while seen.insert(current) {
            let binding = self.bindings.get(current)?;
            if let Some(cell) = binding.cell {
                return Some(cell);
            }
            current = binding.parent.as_ref()?;
        }
        None
    }

    /// Resolve an external update to its owning cell and callbacks.
    pub fn on_external_update(&self, model: &ModelId) -> Result<Dispatch> {
        let cell = self
            .owner(model)
            .ok_or_else(|| Error::ModelNotFound(model.to_string()))?;
        Ok(Dispatch {
            model: model.clone(),
            cell,
            observers: self
                .observers
                .get(model)
                .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default(),
        })
    }

    /// Models created directly by `cell`.
    pub fn models_of(&self, cell: CellId) -> Vec<ModelId> {
        let mut models: Vec<ModelId> = self
            .bindings
            .iter()
            .filter(|(_, b)| b.cell == Some(cell))
            .map(|(id, _)| id.clone())
            .collect();
        models.sort();
        models
    }

    /// Drop every observer `cell` registered, whichever model it watches.
    pub fn clear_observers_of(&mut self, cell: CellId) {
        self.observers.retain(|_, list| {
            list.retain(|(owner, _)| *owner != cell);
            !list.is_empty()
        });
    }

    /// Remove models owned by `cell` that are not in `keep`.
    ///
    /// Used after a re-run: models the run did not re-create are gone.
    pub fn retain_for_cell(&mut self, cell: CellId, keep: &FxHashSet<ModelId>) -> Vec<ModelId> {
        let removed: Vec<ModelId> = self
            .models_of(cell)
            .into_iter()
            .filter(|m| !keep.contains(m))
            .collect();
        for model in &removed {
            self.bindings.remove(model);
            self.observers.remove(model);
        }
        self.prune_orphans();
        removed
    }

    /// Drop nested models whose parent chain ends at a removed model.
    fn prune_orphans(&mut self) {
        loop {
            let orphans: Vec<ModelId> = self
                .bindings
                .iter()
                .filter(|(_, b)| {
                    b.cell.is_none()
                        && b.parent.as_ref().is_some_and(|p| !self.bindings.contains_key(p))
                })
                .map(|(id, _)| id.clone())
                .collect();
            if orphans.is_empty() {
                break;
            }
            for model in orphans {
                self.bindings.remove(&model);
                self.observers.remove(&model);
            }
        }
    }

    /// Remove every model owned by `cell` and every observer it registered.
    pub fn remove_cell(&mut self, cell: CellId) -> Vec<ModelId> {
        self.clear_observers_of(cell);
        self.retain_for_cell(cell, &FxHashSet::default())
    }

    /// Number of registered observer callbacks.
    pub fn observer_count(&self) -> usize {
        self.observers.values().map(Vec::len).sum()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
        self.observers.clear();
    }
}
