//! Interactive UI elements and lens resolution.

mod registry;
mod types;

pub use registry::ElementRegistry;
pub use types::{ElementId, ElementKind, ElementSpec, Lens, RegisteredElement};
