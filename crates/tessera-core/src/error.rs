//! Error types for tessera-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::graph::CellId;

/// Result type for tessera-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tessera-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Two live cells define the same variable.
    #[error("variable '{name}' is defined by multiple cells: {}", join_cells(cells))]
    MultipleDefinition { name: String, cells: Vec<CellId> },

    /// Cyclic dependency detected in the cell graph.
    #[error("cyclic dependency detected: {}", format_cycle(cycle))]
    Cycle { cycle: Vec<CellId> },

    /// A watched resource was accessed from the cell that created its handle.
    #[error("{path} is watched by {cell}; read it from a separate cell that depends on the handle")]
    ReentrantWatchAccess { cell: CellId, path: PathBuf },

    /// A cache entry was looked up with a strategy that did not produce it.
    #[error("cache key mismatch in scope {scope}: expected {expected}, found {found}")]
    CacheKeyMismatch {
        scope: String,
        expected: String,
        found: String,
    },

    /// Module pinning was requested for a module without a known version.
    #[error("cannot pin module '{module}': no version or origin is known")]
    UnknownModuleForPinning { module: String },

    /// A unit closes over impure state and no execution trace is available.
    #[error("unit '{unit}' cannot be cached: {reason}")]
    Uncacheable { unit: String, reason: String },

    /// Cell not found.
    #[error("cell not found: {0}")]
    CellNotFound(CellId),

    /// UI element not found.
    #[error("UI element not found: {0}")]
    ElementNotFound(String),

    /// Model not bound to any cell.
    #[error("model not bound to any cell: {0}")]
    ModelNotFound(String),

    /// Execution error.
    #[error("execution error: {0}")]
    Execution(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// File watch error.
    #[error("file watch error: {0}")]
    Watch(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

fn join_cells(cells: &[CellId]) -> String {
    cells
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_cycle(cycle: &[CellId]) -> String {
    match cycle.first() {
        Some(first) => format!("{} → {}", join_cells(cycle).replace(", ", " → "), first),
        None => String::from("<empty>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_closes_the_loop() {
        let err = Error::Cycle {
            cycle: vec![CellId::new(1), CellId::new(2)],
        };
        assert_eq!(
            err.to_string(),
            "cyclic dependency detected: cell_1 → cell_2 → cell_1"
        );
    }

    #[test]
    fn test_multiple_definition_lists_cells() {
        let err = Error::MultipleDefinition {
            name: "x".to_string(),
            cells: vec![CellId::new(0), CellId::new(3)],
        };
        assert!(err.to_string().contains("cell_0, cell_3"));
    }
}
