//! UI element types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::Digest;
use crate::graph::CellId;

/// Identifier of a UI element.
///
/// Derived from the creating cell and the element's creation ordinal within
/// that cell's run, so a re-run that rebuilds the same element gets the same id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deterministic id for the `ordinal`-th element created by `cell`.
    pub fn derive(cell: CellId, ordinal: usize) -> Self {
        Self(format!("{}-{}", cell, ordinal))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What kind of element this is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementKind {
    /// A single input widget (slider, text box, ...).
    Leaf { widget: String },
    /// Ordered children addressed by index.
    Array,
    /// Children addressed by key.
    Dictionary,
    /// A form-like group of named children, addressed by key.
    Batch,
}

impl ElementKind {
    pub fn leaf(widget: impl Into<String>) -> Self {
        ElementKind::Leaf {
            widget: widget.into(),
        }
    }

    pub fn is_composite(&self) -> bool {
        !matches!(self, ElementKind::Leaf { .. })
    }
}

/// How a child's value projects into its parent composite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "lens", content = "at", rename_all = "snake_case")]
pub enum Lens {
    /// The child's value is the parent's value.
    Identity,
    /// Position in an array composite.
    Index(usize),
    /// Key in a dictionary or batch composite.
    Key(String),
}

impl Lens {
    /// Path segment used in projected patches; `None` for identity.
    pub fn segment(&self) -> Option<String> {
        match self {
            Lens::Identity => None,
            Lens::Index(i) => Some(i.to_string()),
            Lens::Key(k) => Some(k.clone()),
        }
    }

    /// Write `child` into `parent` at this lens.
    pub(crate) fn write(&self, parent: &mut Value, child: Value) {
        match self {
            Lens::Identity => *parent = child,
            Lens::Index(i) => match parent {
                Value::Array(items) if *i < items.len() => items[*i] = child,
                Value::Array(items) => {
                    items.resize(*i, Value::Null);
                    items.push(child);
                }
                Value::Object(map) => {
                    map.insert(i.to_string(), child);
                }
                other => {
                    let mut items = vec![Value::Null; *i];
                    items.push(child);
                    *other = Value::Array(items);
                }
            },
            Lens::Key(k) => match parent {
                Value::Object(map) => {
                    map.insert(k.clone(), child);
                }
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert(k.clone(), child);
                    *other = Value::Object(map);
                }
            },
        }
    }
}

/// Everything needed to register an element.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementSpec {
    pub id: ElementId,
    pub kind: ElementKind,
    /// Initial value (ignored when an equal element is already registered).
    pub value: Value,
    /// Identity of the construction arguments; equal fingerprints mean the
    /// element was rebuilt unchanged.
    pub fingerprint: Digest,
    /// The cell that created the element.
    pub cell: CellId,
}

impl ElementSpec {
    /// Spec whose fingerprint covers its kind and initial value.
    pub fn new(id: ElementId, kind: ElementKind, value: Value, cell: CellId) -> Self {
        let described = serde_json::json!({ "kind": kind, "value": value });
        Self {
            fingerprint: Digest::of_value(&described),
            id,
            kind,
            value,
            cell,
        }
    }
}

/// A registered element.
///
/// `parent` is a weak back-reference: it is only used for lens resolution and
/// resolves to nothing once the parent has been evicted.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredElement {
    pub id: ElementId,
    pub kind: ElementKind,
    pub value: Value,
    pub fingerprint: Digest,
    pub cell: CellId,
    pub parent: Option<ElementId>,
    pub lens: Lens,
    /// Owned child elements (composites only)
    pub children: Vec<ElementId>,
}
