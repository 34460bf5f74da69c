//! The seam between the kernel and whatever actually runs cell code.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::graph::{CellId, CodeToken, VarName};
use crate::namespace::Binding;
use crate::runtime::Runtime;

/// Everything an executor needs to run one cell.
#[derive(Clone)]
pub struct CellRequest {
    pub cell: CellId,
    pub code: CodeToken,
    /// Bindings of the cell's references, as currently in the namespace.
    pub inputs: BTreeMap<VarName, Binding>,
    /// Referenced names with no binding.
    pub missing: Vec<VarName>,
    /// The cell's view of the kernel runtime.
    pub runtime: Runtime,
}

impl CellRequest {
    pub fn input(&self, name: &str) -> Option<&Binding> {
        self.inputs.get(name)
    }

    /// The plain value bound to `name`, if it is one.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name).and_then(Binding::as_value)
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellOutput {
    /// New bindings for the cell's definitions.
    pub bindings: BTreeMap<VarName, Binding>,
    /// Value to show under the cell.
    pub display: Option<Value>,
}

impl CellOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, name: impl Into<VarName>, binding: impl Into<Binding>) -> Self {
        self.bindings.insert(name.into(), binding.into());
        self
    }

    pub fn with_display(mut self, display: Value) -> Self {
        self.display = Some(display);
        self
    }

    /// Whether every binding is a plain value.
    pub fn is_plain(&self) -> bool {
        self.bindings.values().all(Binding::is_value)
    }
}

/// A failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellFailure {
    pub message: String,
}

impl CellFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CellFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<Error> for CellFailure {
    fn from(e: Error) -> Self {
        Self::new(e.to_string())
    }
}

/// A pending cell run.
pub struct Task(BoxFuture<'static, Result<CellOutput, CellFailure>>);

impl Task {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<CellOutput, CellFailure>> + Send + 'static,
    {
        Self(future.boxed())
    }

    /// A task that is already finished.
    pub fn ready(result: Result<CellOutput, CellFailure>) -> Self {
        Self(futures::future::ready(result).boxed())
    }
}

impl Future for Task {
    type Output = Result<CellOutput, CellFailure>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

/// Runs cell code.
///
/// The kernel calls [`execute`](Self::execute) for one cell at a time and
/// awaits the task before starting the next. While the task runs,
/// [`Runtime::current_cell`] reports the requesting cell.
pub trait CellExecutor: Send + Sync {
    fn execute(&self, request: CellRequest) -> Task;
}

impl<F> CellExecutor for F
where
    F: Fn(CellRequest) -> Task + Send + Sync,
{
    fn execute(&self, request: CellRequest) -> Task {
        self(request)
    }
}
