//! The runtime context seen by executing cells.
//!
//! [`Runtime`] is a cheap, cloneable handle passed to the executor with every
//! cell request. It knows which cell is currently running and owns the
//! side-channel registries a cell can touch: UI elements, state cells, widget
//! models and watched paths. Everything a cell does through it is recorded as
//! an effect of that cell's run, which is what decides whether the run may
//! be cached.

mod state;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde_json::Value;

use crate::cache::{CacheEngine, Digest};
use crate::elements::{ElementId, ElementKind, ElementRegistry, ElementSpec, Lens, RegisteredElement};
use crate::error::{Error, Result};
use crate::graph::{CellId, VarName};
use crate::models::{ModelBindingTable, ModelId};
use crate::watch::{WatchId, WatchKind, WatchService, WatchedDirectory, WatchedFile};

pub use state::{Origin, StateId, StateWrite};
pub(crate) use state::StateStore;

/// Why a frame is on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// The cell's own code is running.
    Run,
    /// A model observer owned by the cell is running.
    Callback,
}

/// Something a cell did besides computing its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", content = "target", rename_all = "snake_case")]
pub enum Effect {
    CreateElement(ElementId),
    CreateState(StateId),
    WriteState(StateId),
    BindModel(ModelId),
    Observe(ModelId),
    Watch(WatchId),
    /// Reported by the executor (printing, network, ...).
    External(String),
}

/// One entry of the execution stack.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub(crate) cell: CellId,
    pub(crate) kind: FrameKind,
    element_ordinal: usize,
    pub(crate) effects: Vec<Effect>,
    pub(crate) bound_models: FxHashSet<ModelId>,
}

impl Frame {
    fn new(cell: CellId, kind: FrameKind) -> Self {
        Self {
            cell,
            kind,
            element_ordinal: 0,
            effects: Vec::new(),
            bound_models: FxHashSet::default(),
        }
    }

    pub(crate) fn is_pure(&self) -> bool {
        self.effects.is_empty()
    }

    /// Digest of the recorded effects; the zero digest when there were none.
    pub(crate) fn effect_digest(&self) -> Digest {
        if self.effects.is_empty() {
            return Digest::default();
        }
        match serde_json::to_vec(&self.effects) {
            Ok(bytes) => Digest::of(bytes),
            Err(_) => Digest::of(format!("{:?}", self.effects)),
        }
    }
}

struct WatchEntry {
    path: std::path::PathBuf,
    kind: WatchKind,
    creator: CellId,
}

#[derive(Default)]
struct RuntimeState {
    frames: Vec<Frame>,
    elements: ElementRegistry,
    models: ModelBindingTable,
    states: StateStore,
    watches: FxHashMap<WatchId, WatchEntry>,
    next_watch: u64,
    watch_service: Option<WatchService>,
}

impl RuntimeState {
    fn frame_mut(&mut self) -> Result<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| Error::Execution("no cell is running".into()))
    }

    fn remove_watches_of(&mut self, cell: CellId) {
        let ids: Vec<WatchId> = self
            .watches
            .iter()
            .filter(|(_, w)| w.creator == cell)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.watches.remove(&id);
            if let Some(service) = self.watch_service.as_mut() {
                service.unwatch(id);
            }
        }
    }
}

struct Inner {
    state: Mutex<RuntimeState>,
    cache: Arc<CacheEngine>,
}

/// Handle to the kernel's runtime context.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    pub(crate) fn new(cache: Arc<CacheEngine>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RuntimeState::default()),
                cache,
            }),
        }
    }

    pub(crate) fn set_watch_service(&self, service: Option<WatchService>) {
        self.inner.state.lock().watch_service = service;
    }

    /// The kernel's cache, for executors memoizing work inside a cell.
    pub fn cache(&self) -> &Arc<CacheEngine> {
        &self.inner.cache
    }

    /// The cell whose code or callback is running, if any.
    pub fn current_cell(&self) -> Option<CellId> {
        self.inner.state.lock().frames.last().map(|f| f.cell)
    }

    pub(crate) fn enter(&self, cell: CellId, kind: FrameKind) {
        self.inner.state.lock().frames.push(Frame::new(cell, kind));
    }

    pub(crate) fn exit(&self) -> Option<Frame> {
        self.inner.state.lock().frames.pop()
    }

    /// Record a side effect the executor performed on behalf of the cell.
    pub fn record_effect(&self, description: impl Into<String>) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.frame_mut()?.effects.push(Effect::External(description.into()));
        Ok(())
    }

    // ---- UI elements ----

    /// Create a top-level element in the running cell.
    pub fn create_element(&self, kind: ElementKind, value: Value) -> Result<ElementId> {
        self.register_element(None, kind, value)
    }

    /// Create an element nested inside `parent` at `lens`.
    pub fn create_child_element(
        &self,
        parent: &ElementId,
        lens: Lens,
        kind: ElementKind,
        value: Value,
    ) -> Result<ElementId> {
        self.register_element(Some((parent.clone(), lens)), kind, value)
    }

    fn register_element(
        &self,
        parent: Option<(ElementId, Lens)>,
        kind: ElementKind,
        value: Value,
    ) -> Result<ElementId> {
        let mut state = self.inner.state.lock();
        let frame = state.frame_mut()?;
        if frame.kind != FrameKind::Run {
            return Err(Error::Execution(
                "elements can only be created while a cell runs".into(),
            ));
        }
        let cell = frame.cell;
        let id = ElementId::derive(cell, frame.element_ordinal);
        frame.element_ordinal += 1;
        frame.effects.push(Effect::CreateElement(id.clone()));

        let (parent, lens) = match parent {
            Some((p, lens)) => (Some(p), lens),
            None => (None, Lens::Identity),
        };
        let spec = ElementSpec::new(id, kind, value, cell);
        state.elements.register(spec, parent, lens)
    }

    /// Current value of an element.
    pub fn element_value(&self, id: &ElementId) -> Option<Value> {
        self.inner.state.lock().elements.value(id).cloned()
    }

    pub fn element(&self, id: &ElementId) -> Option<RegisteredElement> {
        self.inner.state.lock().elements.get(id).cloned()
    }

    pub(crate) fn set_element_value(&self, id: &ElementId, value: Value) -> Result<(ElementId, Value)> {
        self.inner.state.lock().elements.set_value(id, value)
    }

    pub(crate) fn bind_element(&self, name: &str, id: ElementId) {
        self.inner.state.lock().elements.bind(name, id);
    }

    pub(crate) fn unbind_element(&self, name: &str) {
        self.inner.state.lock().elements.unbind(name);
    }

    pub(crate) fn element_names(&self, id: &ElementId) -> BTreeSet<VarName> {
        self.inner.state.lock().elements.bound_names(id)
    }

    pub(crate) fn collect_garbage(&self) -> Vec<ElementId> {
        self.inner.state.lock().elements.collect_garbage()
    }

    pub fn element_count(&self) -> usize {
        self.inner.state.lock().elements.len()
    }

    // ---- state ----

    /// Create a state cell owned by the running cell.
    pub fn create_state(&self, initial: Value) -> Result<StateId> {
        let mut state = self.inner.state.lock();
        let cell = state.frame_mut()?.cell;
        let id = state.states.create(cell, initial);
        state.frame_mut()?.effects.push(Effect::CreateState(id));
        Ok(id)
    }

    pub fn get_state(&self, id: StateId) -> Option<Value> {
        self.inner.state.lock().states.get(id).cloned()
    }

    /// Write a state cell.
    ///
    /// The write is attributed to the running cell, or to
    /// [`Origin::External`] outside any cell. Cells reading the state re-run
    /// once the current run finishes; the writing cell itself does not.
    pub fn set_state(&self, id: StateId, value: Value) -> Result<()> {
        let mut state = self.inner.state.lock();
        let origin = match state.frames.last_mut() {
            Some(frame) => {
                frame.effects.push(Effect::WriteState(id));
                Origin::Cell(frame.cell)
            }
            None => Origin::External,
        };
        state.states.set(id, value, origin)
    }

    pub fn state_count(&self) -> usize {
        self.inner.state.lock().states.len()
    }

    pub(crate) fn take_writes(&self) -> Vec<StateWrite> {
        self.inner.state.lock().states.take_writes()
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        self.inner.state.lock().states.has_pending_writes()
    }

    // ---- models ----

    /// Record that the running cell owns `model`.
    pub fn bind_model(&self, model: ModelId) -> Result<()> {
        let mut state = self.inner.state.lock();
        let frame = state.frame_mut()?;
        let cell = frame.cell;
        frame.bound_models.insert(model.clone());
        frame.effects.push(Effect::BindModel(model.clone()));
        state.models.bind(model, cell);
        Ok(())
    }

    /// Nest `child` inside `parent` so updates to it resolve to the parent's owner.
    pub fn link_model(&self, child: ModelId, parent: ModelId) {
        self.inner.state.lock().models.link(child, parent);
    }

    /// Run `callback` whenever the frontend updates `model`.
    pub fn observe<F>(&self, model: ModelId, callback: F) -> Result<()>
    where
        F: Fn(&Runtime, &Value) -> Result<()> + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock();
        let frame = state.frame_mut()?;
        let cell = frame.cell;
        frame.effects.push(Effect::Observe(model.clone()));
        state.models.observe(model, cell, Arc::new(callback));
        Ok(())
    }

    pub fn model_owner(&self, model: &ModelId) -> Option<CellId> {
        self.inner.state.lock().models.owner(model)
    }

    /// Run the observers of `model` inside its owning cell's context.
    ///
    /// Returns the owning cell. Observer failures are logged and do not stop
    /// the remaining observers.
    pub(crate) fn dispatch_model_update(&self, model: &ModelId, patch: &Value) -> Result<CellId> {
        let dispatch = self.inner.state.lock().models.on_external_update(model)?;

        self.enter(dispatch.cell, FrameKind::Callback);
        for observer in &dispatch.observers {
            if let Err(e) = observer(self, patch) {
                tracing::warn!(model = %dispatch.model, cell = %dispatch.cell, "observer failed: {}", e);
            }
        }
        self.exit();

        Ok(dispatch.cell)
    }

    // ---- watched paths ----

    /// Watch a file on behalf of the running cell.
    pub fn watch_file(&self, path: impl AsRef<Path>) -> Result<WatchedFile> {
        let (id, path, creator) = self.add_watch(path.as_ref(), WatchKind::File)?;
        Ok(WatchedFile::new(id, path, creator, self.clone()))
    }

    /// Watch a directory tree on behalf of the running cell.
    pub fn watch_directory(&self, path: impl AsRef<Path>) -> Result<WatchedDirectory> {
        let (id, path, creator) = self.add_watch(path.as_ref(), WatchKind::Directory)?;
        Ok(WatchedDirectory::new(id, path, creator, self.clone()))
    }

    fn add_watch(&self, path: &Path, kind: WatchKind) -> Result<(WatchId, std::path::PathBuf, CellId)> {
        let mut state = self.inner.state.lock();
        let creator = state.frame_mut()?.cell;
        let id = WatchId::from_raw(state.next_watch);
        state.next_watch += 1;
        state.frame_mut()?.effects.push(Effect::Watch(id));

        if let Some(service) = state.watch_service.as_mut()
            && let Err(e) = service.watch(id, path, kind)
        {
            tracing::warn!(path = %path.display(), "cannot watch path, changes will not re-run cells: {}", e);
        }
        state.watches.insert(
            id,
            WatchEntry {
                path: path.to_path_buf(),
                kind,
                creator,
            },
        );
        Ok((id, path.to_path_buf(), creator))
    }

    /// Rebuild a file handle from its id, e.g. for a cell receiving it as input.
    pub fn watched_file(&self, id: WatchId) -> Option<WatchedFile> {
        let state = self.inner.state.lock();
        let entry = state.watches.get(&id).filter(|w| w.kind == WatchKind::File)?;
        Some(WatchedFile::new(id, entry.path.clone(), entry.creator, self.clone()))
    }

    pub fn watched_directory(&self, id: WatchId) -> Option<WatchedDirectory> {
        let state = self.inner.state.lock();
        let entry = state
            .watches
            .get(&id)
            .filter(|w| w.kind == WatchKind::Directory)?;
        Some(WatchedDirectory::new(id, entry.path.clone(), entry.creator, self.clone()))
    }

    // ---- cell lifecycle ----

    /// Forget what the previous run of `cell` set up, before it runs again.
    ///
    /// Elements are kept: a re-run that rebuilds an unchanged element keeps
    /// its value, and the rest are collected after the run.
    pub(crate) fn begin_cell(&self, cell: CellId) {
        let mut state = self.inner.state.lock();
        state.states.remove_cell(cell);
        state.models.clear_observers_of(cell);
        state.remove_watches_of(cell);
    }

    /// Drop models the finished run did not bind again.
    pub(crate) fn finish_cell(&self, cell: CellId, frame: &Frame) {
        let removed = self
            .inner
            .state
            .lock()
            .models
            .retain_for_cell(cell, &frame.bound_models);
        if !removed.is_empty() {
            tracing::debug!(%cell, count = removed.len(), "dropped models not re-created");
        }
    }

    /// Forget everything a deleted cell owned.
    pub(crate) fn remove_cell(&self, cell: CellId) {
        let mut state = self.inner.state.lock();
        state.states.remove_cell(cell);
        state.models.remove_cell(cell);
        state.remove_watches_of(cell);
    }

    /// Drop all runtime state. Frames in flight are kept.
    pub(crate) fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.elements.clear();
        state.models.clear();
        state.states.clear();
        let ids: Vec<WatchId> = state.watches.keys().copied().collect();
        for id in ids {
            if let Some(service) = state.watch_service.as_mut() {
                service.unwatch(id);
            }
        }
        state.watches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime() -> Runtime {
        Runtime::new(Arc::new(CacheEngine::new()))
    }

    #[test]
    fn test_element_ids_follow_creation_order() {
        let rt = runtime();
        rt.enter(CellId::new(2), FrameKind::Run);
        let a = rt.create_element(ElementKind::leaf("slider"), json!(1)).unwrap();
        let b = rt.create_element(ElementKind::leaf("text"), json!("")).unwrap();
        rt.exit();

        assert_eq!(a.as_str(), "cell_2-0");
        assert_eq!(b.as_str(), "cell_2-1");

        rt.enter(CellId::new(2), FrameKind::Run);
        let again = rt.create_element(ElementKind::leaf("slider"), json!(1)).unwrap();
        rt.exit();
        assert_eq!(again, a);
    }

    #[test]
    fn test_elements_require_a_running_cell() {
        let rt = runtime();
        assert!(rt.create_element(ElementKind::leaf("slider"), json!(0)).is_err());
    }

    #[test]
    fn test_effects_mark_frame_impure() {
        let rt = runtime();
        rt.enter(CellId::new(0), FrameKind::Run);
        let frame = rt.exit().unwrap();
        assert!(frame.is_pure());
        assert_eq!(frame.effect_digest(), Digest::default());

        rt.enter(CellId::new(0), FrameKind::Run);
        rt.record_effect("printed to stdout").unwrap();
        let frame = rt.exit().unwrap();
        assert!(!frame.is_pure());
        assert_ne!(frame.effect_digest(), Digest::default());
    }

    #[test]
    fn test_state_write_origin() {
        let rt = runtime();
        rt.enter(CellId::new(0), FrameKind::Run);
        let id = rt.create_state(json!(0)).unwrap();
        rt.set_state(id, json!(1)).unwrap();
        rt.exit();
        rt.set_state(id, json!(2)).unwrap();

        let writes = rt.take_writes();
        assert_eq!(writes[0].origin, Origin::Cell(CellId::new(0)));
        assert_eq!(writes[1].origin, Origin::External);
        assert_eq!(rt.get_state(id), Some(json!(2)));
    }

    #[test]
    fn test_observer_runs_in_owner_frame() {
        let rt = runtime();
        let seen_cell = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        rt.enter(CellId::new(5), FrameKind::Run);
        rt.bind_model(ModelId::new("widget")).unwrap();
        let (seen, count) = (Arc::clone(&seen_cell), Arc::clone(&calls));
        rt.observe(ModelId::new("widget"), move |rt, _patch| {
            *seen.lock() = rt.current_cell();
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        rt.exit();

        let owner = rt
            .dispatch_model_update(&ModelId::new("widget"), &json!({"value": 3}))
            .unwrap();
        assert_eq!(owner, CellId::new(5));
        assert_eq!(*seen_cell.lock(), Some(CellId::new(5)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rt.current_cell(), None);
    }

    #[test]
    fn test_rerun_does_not_stack_nested_observers() {
        let rt = runtime();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            rt.begin_cell(CellId::new(1));
            rt.enter(CellId::new(1), FrameKind::Run);
            rt.bind_model(ModelId::new("outer")).unwrap();
            rt.link_model(ModelId::new("inner"), ModelId::new("outer"));
            let count = Arc::clone(&calls);
            rt.observe(ModelId::new("inner"), move |_, _| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
            let frame = rt.exit().unwrap();
            rt.finish_cell(CellId::new(1), &frame);
        }

        rt.dispatch_model_update(&ModelId::new("inner"), &json!({})).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rerun_drops_unbound_models() {
        let rt = runtime();
        rt.enter(CellId::new(1), FrameKind::Run);
        rt.bind_model(ModelId::new("a")).unwrap();
        rt.bind_model(ModelId::new("b")).unwrap();
        let frame = rt.exit().unwrap();
        rt.finish_cell(CellId::new(1), &frame);

        rt.begin_cell(CellId::new(1));
        rt.enter(CellId::new(1), FrameKind::Run);
        rt.bind_model(ModelId::new("a")).unwrap();
        let frame = rt.exit().unwrap();
        rt.finish_cell(CellId::new(1), &frame);

        assert_eq!(rt.model_owner(&ModelId::new("a")), Some(CellId::new(1)));
        assert_eq!(rt.model_owner(&ModelId::new("b")), None);
    }
}
