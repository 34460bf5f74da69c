//! Registry of interactive UI elements.
//!
//! Elements are value-producing objects created by cells. Composite elements
//! (arrays, dictionaries, batches) own their children; children keep only an
//! index-based link to their parent, used to project a leaf update into the
//! root composite the user's code actually holds.
//!
//! # Example
//!
//! ```rust,ignore
//! let (root, patch) = registry.set_value(&leaf, json!(5))?;
//! // patch == {"2": {"1": {"x": 5}}}, touching only the updated path
//! ```

use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use super::types::{ElementId, ElementSpec, Lens, RegisteredElement};
use crate::error::{Error, Result};
use crate::graph::{CellId, VarName};

/// Owns every registered element and the name bindings pointing at them.
#[derive(Debug, Default)]
pub struct ElementRegistry {
    elements: FxHashMap<ElementId, RegisteredElement>,
    /// Global names currently bound to an element.
    bindings: FxHashMap<VarName, ElementId>,
}

impl ElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an element under an optional parent composite.
    ///
    /// Re-registering an id with an equal fingerprint keeps the element's
    /// current value (a re-run rebuilt the same element); a different
    /// fingerprint resets it.
    pub fn register(
        &mut self,
        spec: ElementSpec,
        parent: Option<ElementId>,
        lens: Lens,
    ) -> Result<ElementId> {
        if let Some(parent_id) = &parent
            && !self.elements.contains_key(parent_id)
        {
            return Err(Error::ElementNotFound(parent_id.to_string()));
        }

        let (value, children) = match self.elements.remove(&spec.id) {
            Some(old) if old.fingerprint == spec.fingerprint && old.kind == spec.kind => {
                (old.value, old.children)
            }
            Some(old) => {
                self.detach(&old);
                (spec.value, Vec::new())
            }
            None => (spec.value, Vec::new()),
        };

        let id = spec.id.clone();
        self.elements.insert(
            id.clone(),
            RegisteredElement {
                id: id.clone(),
                kind: spec.kind,
                value,
                fingerprint: spec.fingerprint,
                cell: spec.cell,
                parent: parent.clone(),
                lens,
                children,
            },
        );

        if let Some(parent_id) = parent {
            self.adopt(&parent_id, &id);
        }

        Ok(id)
    }

    fn adopt(&mut self, parent_id: &ElementId, child_id: &ElementId) {
        let Some(child) = self.elements.get(child_id) else {
            return;
        };
        let (mut lens, mut value) = (child.lens.clone(), child.value.clone());

        if let Some(parent) = self.elements.get_mut(parent_id)
            && !parent.children.contains(child_id)
        {
            parent.children.push(child_id.clone());
        }

        // Composites hold their children's values, so the write reaches the root.
        let mut current = Some(parent_id.clone());
        while let Some(id) = current {
            let Some(element) = self.elements.get_mut(&id) else {
                break;
            };
            lens.write(&mut element.value, value);
            value = element.value.clone();
            lens = element.lens.clone();
            current = element.parent.clone();
        }
    }

    fn detach(&mut self, element: &RegisteredElement) {
        if let Some(parent_id) = &element.parent
            && let Some(parent) = self.elements.get_mut(parent_id)
        {
            parent.children.retain(|c| c != &element.id);
        }
    }

    /// Project a new leaf value into its root composite.
    ///
    /// Walks parent links upward, nesting the value one level per lens, so
    /// the patch contains only the path that was touched. A root-level
    /// element resolves to itself with the value unchanged.
    pub fn resolve_lens(&self, id: &ElementId, new_value: Value) -> Result<(ElementId, Value)> {
        let mut current = self
            .elements
            .get(id)
            .ok_or_else(|| Error::ElementNotFound(id.to_string()))?;
        let mut patch = new_value;
        let mut visited: FxHashSet<&ElementId> = FxHashSet::default();

        while visited.insert(&current.id) {
            let Some(parent) = current
                .parent
                .as_ref()
                .and_then(|p| self.elements.get(p))
            else {
                break;
            };

            if let Some(segment) = current.lens.segment() {
                let mut wrapped = serde_json::Map::new();
                wrapped.insert(segment, patch);
                patch = Value::Object(wrapped);
            }
            current = parent;
        }

        Ok((current.id.clone(), patch))
    }

    /// Set a leaf's value and write it through every ancestor composite.
    ///
    /// Returns the root element and the projected patch.
    pub fn set_value(&mut self, id: &ElementId, value: Value) -> Result<(ElementId, Value)> {
        let (root, patch) = self.resolve_lens(id, value.clone())?;

        let mut child_id = id.clone();
        let mut child_value = value;
        let mut visited: FxHashSet<ElementId> = FxHashSet::default();
        while visited.insert(child_id.clone()) {
            let Some(child) = self.elements.get_mut(&child_id) else {
                break;
            };
            child.value = child_value;
            let (parent, lens, written) = (child.parent.clone(), child.lens.clone(), child.value.clone());

            let Some(parent_id) = parent else {
                break;
            };
            let Some(parent) = self.elements.get(&parent_id) else {
                break;
            };
            let mut parent_value = parent.value.clone();
            lens.write(&mut parent_value, written);

            child_id = parent_id;
            child_value = parent_value;
        }

        Ok((root, patch))
    }

    /// Current value of an element.
    pub fn value(&self, id: &ElementId) -> Option<&Value> {
        self.elements.get(id).map(|e| &e.value)
    }

    pub fn get(&self, id: &ElementId) -> Option<&RegisteredElement> {
        self.elements.get(id)
    }

    pub fn contains(&self, id: &ElementId) -> bool {
        self.elements.contains_key(id)
    }

    /// Live parent of an element; `None` once the parent was evicted.
    pub fn parent(&self, id: &ElementId) -> Option<&ElementId> {
        self.elements
            .get(id)
            .and_then(|e| e.parent.as_ref())
            .filter(|p| self.elements.contains_key(*p))
    }

    /// Bind a global name to an element (replacing any previous binding of that name).
    pub fn bind(&mut self, name: impl Into<VarName>, id: ElementId) {
        self.bindings.insert(name.into(), id);
    }

    pub fn unbind(&mut self, name: &str) -> Option<ElementId> {
        self.bindings.remove(name)
    }

    /// Global names currently bound to this element.
    pub fn bound_names(&self, id: &ElementId) -> BTreeSet<VarName> {
        self.bindings
            .iter()
            .filter(|(_, bound)| *bound == id)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Elements created by a cell.
    pub fn elements_of(&self, cell: CellId) -> Vec<ElementId> {
        let mut ids: Vec<ElementId> = self
            .elements
            .values()
            .filter(|e| e.cell == cell)
            .map(|e| e.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Evict every element unreachable from a bound name.
    ///
    /// Reachability follows owned child links from bound elements; returns the
    /// evicted ids.
    pub fn collect_garbage(&mut self) -> Vec<ElementId> {
        let mut live: FxHashSet<ElementId> = FxHashSet::default();
        let mut stack: Vec<ElementId> = self.bindings.values().cloned().collect();

        while let Some(id) = stack.pop() {
            if !live.insert(id.clone()) {
                continue;
            }
            if let Some(element) = self.elements.get(&id) {
                stack.extend(element.children.iter().cloned());
            }
        }

        let mut evicted: Vec<ElementId> = self
            .elements
            .keys()
            .filter(|id| !live.contains(*id))
            .cloned()
            .collect();
        evicted.sort();

        for id in &evicted {
            self.elements.remove(id);
        }
        for element in self.elements.values_mut() {
            element.children.retain(|c| live.contains(c));
        }
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "evicted unreachable UI elements");
        }

        evicted
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Drop all elements and bindings.
    pub fn clear(&mut self) {
        self.elements.clear();
        self.bindings.clear();
    }
}
