//! Reactive state cells.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::graph::CellId;

/// Identifier of a state cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(u64);

impl StateId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "state_{}", self.0)
    }
}

/// Who performed a state write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Written while the given cell (or one of its callbacks) was running.
    Cell(CellId),
    /// Written from outside any cell, e.g. by the frontend.
    External,
}

impl Origin {
    pub fn cell(&self) -> Option<CellId> {
        match self {
            Origin::Cell(id) => Some(*id),
            Origin::External => None,
        }
    }
}

/// A recorded write, pending re-run scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct StateWrite {
    pub state: StateId,
    pub value: Value,
    pub origin: Origin,
}

struct StateSlot {
    value: Value,
    creator: CellId,
}

/// Values of every live state cell plus the writes not yet scheduled.
#[derive(Default)]
pub(crate) struct StateStore {
    slots: FxHashMap<StateId, StateSlot>,
    next_id: u64,
    writes: Vec<StateWrite>,
}

impl StateStore {
    pub(crate) fn create(&mut self, creator: CellId, initial: Value) -> StateId {
        let id = StateId(self.next_id);
        self.next_id += 1;
        self.slots.insert(
            id,
            StateSlot {
                value: initial,
                creator,
            },
        );
        id
    }

    pub(crate) fn get(&self, id: StateId) -> Option<&Value> {
        self.slots.get(&id).map(|s| &s.value)
    }

    /// Update the value immediately and queue the write for scheduling.
    pub(crate) fn set(&mut self, id: StateId, value: Value, origin: Origin) -> Result<()> {
        let slot = self
            .slots
            .get_mut(&id)
            .ok_or_else(|| Error::Execution(format!("unknown state: {}", id)))?;
        slot.value = value.clone();
        self.writes.push(StateWrite {
            state: id,
            value,
            origin,
        });
        Ok(())
    }

    pub(crate) fn take_writes(&mut self) -> Vec<StateWrite> {
        std::mem::take(&mut self.writes)
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    /// Drop every state created by `cell`.
    pub(crate) fn remove_cell(&mut self, cell: CellId) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.creator != cell);
        before - self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.writes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_updates_and_queues() {
        let mut store = StateStore::default();
        let id = store.create(CellId::new(0), json!(0));

        store.set(id, json!(5), Origin::Cell(CellId::new(0))).unwrap();
        assert_eq!(store.get(id), Some(&json!(5)));

        let writes = store.take_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].origin.cell(), Some(CellId::new(0)));
        assert!(!store.has_pending_writes());
    }

    #[test]
    fn test_unknown_state() {
        let mut store = StateStore::default();
        let id = store.create(CellId::new(0), json!(null));
        store.remove_cell(CellId::new(0));
        assert!(store.set(id, json!(1), Origin::External).is_err());
    }

    #[test]
    fn test_ids_are_not_reused() {
        let mut store = StateStore::default();
        let first = store.create(CellId::new(0), json!(1));
        store.remove_cell(CellId::new(0));
        let second = store.create(CellId::new(0), json!(1));
        assert_ne!(first, second);
        assert_eq!(store.len(), 1);
    }
}
