//! The global namespace shared by all cells.
//!
//! The kernel owns the namespace and mutates it between cell runs. Background
//! workers (completion) only ever read it, through a reentrant lock they must
//! not wait on: when the kernel holds it, they give up and retry later.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::elements::ElementId;
use crate::graph::VarName;
use crate::models::ModelId;
use crate::runtime::StateId;
use crate::watch::WatchId;

/// What a global name is bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Binding {
    /// A plain value.
    Value(Value),
    /// A UI element; its current value lives in the element registry.
    Element(ElementId),
    /// A reactive state cell.
    State(StateId),
    /// A watched file or directory handle.
    Watch(WatchId),
    /// A widget model.
    Model(ModelId),
    /// A value the executor cannot describe (open connections, closures...).
    Opaque { type_name: String },
}

impl Binding {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Binding::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Binding::Value(_))
    }
}

impl From<Value> for Binding {
    fn from(value: Value) -> Self {
        Binding::Value(value)
    }
}

/// Name to binding map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Namespace {
    bindings: BTreeMap<VarName, Binding>,
    generation: u64,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with `initial`.
    pub fn init<I>(&mut self, initial: I)
    where
        I: IntoIterator<Item = (VarName, Binding)>,
    {
        self.bindings = initial.into_iter().collect();
        self.generation += 1;
    }

    /// Drop every binding.
    pub fn reset(&mut self) {
        self.bindings.clear();
        self.generation += 1;
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn insert(&mut self, name: impl Into<VarName>, binding: Binding) -> Option<Binding> {
        self.generation += 1;
        self.bindings.insert(name.into(), binding)
    }

    pub fn remove(&mut self, name: &str) -> Option<Binding> {
        let removed = self.bindings.remove(name);
        if removed.is_some() {
            self.generation += 1;
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Names bound to something matching `pred`.
    pub fn names_where<F>(&self, pred: F) -> Vec<VarName>
    where
        F: Fn(&Binding) -> bool,
    {
        self.bindings
            .iter()
            .filter(|(_, b)| pred(b))
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &VarName> {
        self.bindings.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VarName, &Binding)> {
        self.bindings.iter()
    }

    /// Bumped on every mutation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Handle to the namespace shared between the kernel and background workers.
///
/// The lock is reentrant so kernel code that already holds it may call back
/// into helpers that lock it again on the same thread.
#[derive(Clone, Default)]
pub struct SharedNamespace {
    inner: Arc<ReentrantMutex<RefCell<Namespace>>>,
}

impl SharedNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read under the lock, blocking.
    pub fn with<R>(&self, f: impl FnOnce(&Namespace) -> R) -> R {
        let guard = self.inner.lock();
        let ns = guard.borrow();
        f(&ns)
    }

    /// Mutate under the lock, blocking.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Namespace) -> R) -> R {
        let guard = self.inner.lock();
        let mut ns = guard.borrow_mut();
        f(&mut ns)
    }

    /// Read without waiting. `None` when the lock or the namespace is busy.
    pub fn try_with<R>(&self, f: impl FnOnce(&Namespace) -> R) -> Option<R> {
        let guard = self.inner.try_lock()?;
        let ns = guard.try_borrow().ok()?;
        Some(f(&ns))
    }

    /// Hold the lock until the returned guard is dropped.
    ///
    /// The guard is not `Send`; never keep it across an `.await`.
    pub fn hold(&self) -> NamespaceHold<'_> {
        NamespaceHold {
            _guard: self.inner.lock(),
        }
    }

    pub fn init<I>(&self, initial: I)
    where
        I: IntoIterator<Item = (VarName, Binding)>,
    {
        self.with_mut(|ns| ns.init(initial));
    }

    pub fn reset(&self) {
        self.with_mut(Namespace::reset);
    }

    pub fn get(&self, name: &str) -> Option<Binding> {
        self.with(|ns| ns.get(name).cloned())
    }

    /// A completion worker reading this namespace.
    pub fn completion_worker(&self) -> CompletionWorker {
        CompletionWorker {
            namespace: self.clone(),
        }
    }
}

/// Proof that the current thread holds the namespace lock.
pub struct NamespaceHold<'a> {
    _guard: parking_lot::ReentrantMutexGuard<'a, RefCell<Namespace>>,
}

/// Answers name completion requests from the namespace.
#[derive(Clone)]
pub struct CompletionWorker {
    namespace: SharedNamespace,
}

impl CompletionWorker {
    /// Names starting with `prefix`, sorted.
    ///
    /// Returns `None` without blocking when the kernel holds the namespace;
    /// the caller should retry later.
    pub fn complete(&self, prefix: &str) -> Option<Vec<VarName>> {
        let result = self.namespace.try_with(|ns| {
            ns.names()
                .filter(|name| name.starts_with(prefix))
                .cloned()
                .collect::<Vec<_>>()
        });
        if result.is_none() {
            tracing::trace!(prefix, "namespace busy, completion backed off");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shared_with(names: &[&str]) -> SharedNamespace {
        let shared = SharedNamespace::new();
        shared.init(
            names
                .iter()
                .map(|n| (n.to_string(), Binding::Value(json!(null)))),
        );
        shared
    }

    #[test]
    fn test_init_and_reset() {
        let mut ns = Namespace::new();
        ns.init([("x".to_string(), Binding::Value(json!(1)))]);
        assert_eq!(ns.get("x"), Some(&Binding::Value(json!(1))));

        ns.reset();
        assert!(ns.is_empty());
    }

    #[test]
    fn test_generation_tracks_mutations() {
        let mut ns = Namespace::new();
        let start = ns.generation();
        ns.insert("a", Binding::Value(json!(1)));
        assert!(ns.generation() > start);

        let after_insert = ns.generation();
        assert!(ns.remove("missing").is_none());
        assert_eq!(ns.generation(), after_insert);
    }

    #[test]
    fn test_completion_filters_by_prefix() {
        let shared = shared_with(&["data", "df", "x"]);
        let worker = shared.completion_worker();
        assert_eq!(
            worker.complete("d"),
            Some(vec!["data".to_string(), "df".to_string()])
        );
    }

    #[test]
    fn test_completion_backs_off_while_held() {
        let shared = shared_with(&["alpha"]);
        let worker = shared.completion_worker();

        let hold = shared.hold();
        let busy = std::thread::scope(|s| s.spawn(|| worker.complete("a")).join().unwrap());
        assert_eq!(busy, None);
        drop(hold);

        assert_eq!(worker.complete("a"), Some(vec!["alpha".to_string()]));
    }

    #[test]
    fn test_reentrant_access_while_held() {
        let shared = shared_with(&["x"]);
        let _hold = shared.hold();
        assert!(shared.get("x").is_some());
        shared.with_mut(|ns| ns.insert("y", Binding::Value(json!(2))));
        assert!(shared.with(|ns| ns.contains("y")));
    }

    #[test]
    fn test_completion_backs_off_during_mutation_on_same_thread() {
        let shared = shared_with(&["x"]);
        let worker = shared.completion_worker();
        let seen = shared.with_mut(|_ns| worker.complete("x"));
        assert_eq!(seen, None);
    }
}
