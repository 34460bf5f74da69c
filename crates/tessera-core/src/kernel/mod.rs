//! The reactive kernel.
//!
//! The kernel owns the dependency graph and the global namespace. It accepts
//! [`KernelEvent`]s (registrations, run requests, UI and model updates, state
//! writes, file changes), turns them into a set of root cells, and runs the
//! roots plus everything downstream of them in dependency order, one cell at
//! a time, through a [`CellExecutor`]. Progress is published as
//! [`KernelMessage`]s on a broadcast channel.
//!
//! # Example
//!
//! ```rust,ignore
//! let (mut kernel, mut messages) = Kernel::new(KernelConfig::default(), executor)?;
//! kernel.register_cells(vec![
//!     CellSpec::new(CellId::new(0), "x = 1", ["x"], Vec::<&str>::new()),
//!     CellSpec::new(CellId::new(1), "y = x + 1", ["y"], ["x"]),
//! ]);
//! let report = kernel.run_until_idle().await;
//! assert_eq!(report.executed, vec![CellId::new(0), CellId::new(1)]);
//! ```

mod events;
mod executor;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rustc_hash::FxHashSet;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::cache::{CacheEngine, CachePersistence, CacheUnit, HashStrategy, Resolved, ScopeId, UnitEnvironment};
use crate::config::KernelConfig;
use crate::elements::ElementId;
use crate::error::{Error, Result};
use crate::graph::{BlockReason, Cell, CellId, CellSpec, CellStatus, DependencyGraph, VarName};
use crate::models::ModelId;
use crate::namespace::{Binding, CompletionWorker, Namespace, SharedNamespace};
use crate::runtime::{FrameKind, Origin, Runtime, StateId};
use crate::watch::{WatchId, WatchService};

pub use events::{CellError, KernelEvent, KernelHandle, KernelMessage, coalesce};
pub use executor::{CellExecutor, CellFailure, CellOutput, CellRequest, Task};

/// Handle for cooperative cancellation of a run.
///
/// Any clone can request the abort; the kernel checks it before starting
/// each cell and marks the cells it did not get to as stale.
#[derive(Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.aborted.store(false, Ordering::Relaxed);
    }
}

/// What happened during [`Kernel::run_until_idle`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Cells whose code ran, in execution order.
    pub executed: Vec<CellId>,
    /// Cells served from the cache.
    pub cached: Vec<CellId>,
    /// Cells whose code failed.
    pub failed: Vec<CellId>,
    /// Cells not run because an ancestor failed or the run was aborted.
    pub skipped: Vec<CellId>,
    /// Cells not run because of a cycle.
    pub blocked: Vec<CellId>,
}

impl RunReport {
    /// Every cell the run touched, whatever the outcome.
    pub fn touched(&self) -> BTreeSet<CellId> {
        self.executed
            .iter()
            .chain(&self.cached)
            .chain(&self.failed)
            .chain(&self.skipped)
            .chain(&self.blocked)
            .copied()
            .collect()
    }
}

enum CellRun {
    Executed,
    Cached,
    Failed,
}

/// Resolves a cell's free variables against the namespace for hashing.
struct NamespaceEnv<'a> {
    namespace: &'a Namespace,
    runtime: &'a Runtime,
}

impl UnitEnvironment for NamespaceEnv<'_> {
    fn resolve(&self, name: &str) -> Option<Resolved> {
        let resolved = match self.namespace.get(name)? {
            Binding::Value(v) => Resolved::Value(v.clone()),
            Binding::Element(id) => match self.runtime.element_value(id) {
                Some(v) => Resolved::Value(v),
                None => Resolved::Impure {
                    reason: format!("element {} is gone", id),
                },
            },
            Binding::State(id) => match self.runtime.get_state(*id) {
                Some(v) => Resolved::Value(v),
                None => Resolved::Impure {
                    reason: format!("{} is gone", id),
                },
            },
            Binding::Watch(id) => Resolved::Impure {
                reason: format!("{} reads the filesystem", id),
            },
            Binding::Model(id) => Resolved::Impure {
                reason: format!("model {} is externally mutable", id),
            },
            Binding::Opaque { type_name } => Resolved::Impure {
                reason: format!("opaque {}", type_name),
            },
        };
        Some(resolved)
    }
}

/// A registration waiting for a name to be freed.
struct ParkedCell {
    /// When the cell was first parked; retries go oldest first
    seq: u64,
    spec: CellSpec,
}

/// The reactive kernel.
pub struct Kernel {
    config: KernelConfig,
    graph: DependencyGraph,
    namespace: SharedNamespace,
    runtime: Runtime,
    cache: Arc<CacheEngine>,
    executor: Arc<dyn CellExecutor>,
    /// Registrations rejected for defining an already-defined name
    parked: BTreeMap<CellId, ParkedCell>,
    next_park_seq: u64,
    /// Last error per cell
    errors: BTreeMap<CellId, CellError>,
    /// Roots of the next run
    pending: BTreeSet<CellId>,
    /// Roots that must execute even on a cache hit
    forced: BTreeSet<CellId>,
    events_tx: mpsc::UnboundedSender<KernelEvent>,
    events_rx: mpsc::UnboundedReceiver<KernelEvent>,
    messages: broadcast::Sender<KernelMessage>,
    abort: AbortHandle,
}

impl Kernel {
    /// Create a kernel and a receiver for its messages.
    pub fn new<E>(config: KernelConfig, executor: E) -> Result<(Self, broadcast::Receiver<KernelMessage>)>
    where
        E: CellExecutor + 'static,
    {
        config.validate()?;

        let cache = Arc::new(CacheEngine::new().with_module_pinning(config.module_pinning));
        if let Some(path) = &config.cache.persist_path {
            match CachePersistence::load(path) {
                Ok(Some(snapshot)) => {
                    let restored = cache.restore(&snapshot);
                    tracing::info!("Restored {} cached results", restored);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Ignoring unusable cache at {}: {}", path.display(), e),
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (messages, rx) = broadcast::channel(config.message_capacity);

        let runtime = Runtime::new(Arc::clone(&cache));
        if config.watch.enabled {
            match WatchService::new(config.watch.debounce(), events_tx.clone()) {
                Ok(service) => runtime.set_watch_service(Some(service)),
                Err(e) => tracing::warn!("File watching unavailable: {}", e),
            }
        }

        let kernel = Self {
            graph: DependencyGraph::with_private_prefix(config.private_prefix.clone()),
            namespace: SharedNamespace::new(),
            runtime,
            cache,
            executor: Arc::new(executor),
            parked: BTreeMap::new(),
            next_park_seq: 0,
            errors: BTreeMap::new(),
            pending: BTreeSet::new(),
            forced: BTreeSet::new(),
            events_tx,
            events_rx,
            messages,
            abort: AbortHandle::new(),
            config,
        };

        Ok((kernel, rx))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Sender for queuing events from other tasks or threads.
    pub fn handle(&self) -> KernelHandle {
        KernelHandle::new(self.events_tx.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelMessage> {
        self.messages.subscribe()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn cache(&self) -> &Arc<CacheEngine> {
        &self.cache
    }

    pub fn namespace(&self) -> &SharedNamespace {
        &self.namespace
    }

    pub fn completion_worker(&self) -> CompletionWorker {
        self.namespace.completion_worker()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Current binding of a global name.
    pub fn binding(&self, name: &str) -> Option<Binding> {
        self.namespace.get(name)
    }

    /// Current plain value of a global name.
    pub fn value(&self, name: &str) -> Option<Value> {
        match self.binding(name)? {
            Binding::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn status(&self, cell: CellId) -> Option<CellStatus> {
        if self.parked.contains_key(&cell) {
            return Some(CellStatus::Error);
        }
        self.graph.status(cell)
    }

    pub fn cell_error(&self, cell: CellId) -> Option<&CellError> {
        self.errors.get(&cell)
    }

    /// Whether a registration was rejected for a multiple definition.
    pub fn is_parked(&self, cell: CellId) -> bool {
        self.parked.contains_key(&cell)
    }

    /// Cells queued for the next run.
    pub fn pending(&self) -> &BTreeSet<CellId> {
        &self.pending
    }

    fn broadcast(&self, msg: KernelMessage) {
        let _ = self.messages.send(msg);
    }

    fn set_status(&mut self, cell: CellId, status: CellStatus) {
        self.graph.set_status(cell, status);
        self.broadcast(KernelMessage::CellStatus { cell, status });
    }

    // ---- lifecycle ----

    /// Seed the namespace, replacing its contents.
    pub fn init<I>(&mut self, initial: I)
    where
        I: IntoIterator<Item = (VarName, Binding)>,
    {
        self.namespace.init(initial);
    }

    /// Forget every result: namespace, elements, states, models and watches.
    ///
    /// Registrations are kept; cells return to idle until they are run again.
    pub fn reset(&mut self) {
        self.namespace.reset();
        self.runtime.reset();
        self.pending.clear();
        self.forced.clear();
        self.errors
            .retain(|_, e| matches!(e, CellError::MultipleDefinition { .. }));
        for cell in self.graph.cells_in_registration_order() {
            self.set_status(cell, CellStatus::Idle);
        }
        tracing::info!("Kernel reset");
    }

    /// Write the cache to the configured snapshot path.
    ///
    /// Returns `false` when no path is configured.
    pub fn save_cache(&self) -> Result<bool> {
        let Some(path) = &self.config.cache.persist_path else {
            return Ok(false);
        };
        CachePersistence::save(path, &self.cache.snapshot())
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(true)
    }

    // ---- events ----

    /// Apply one event. Cells to run are queued, not run.
    pub fn apply(&mut self, event: KernelEvent) -> Result<()> {
        match event {
            KernelEvent::RegisterCells(specs) => {
                self.register_cells(specs);
                Ok(())
            }
            KernelEvent::DeleteCell(cell) => self.delete_cell(cell),
            KernelEvent::RunCells(cells) => self.run_cells(cells),
            KernelEvent::SetElementValue { element, value } => self.set_element_value(&element, value),
            KernelEvent::ModelUpdate { model, patch } => self.model_update(&model, patch),
            KernelEvent::SetState { state, value } => self.set_state(state, value),
            KernelEvent::WatchTriggered(id) => {
                self.watch_triggered(id);
                Ok(())
            }
            KernelEvent::Complete { request, prefix } => {
                self.complete(request, &prefix);
                Ok(())
            }
        }
    }

    /// Apply every queued event, after dropping superseded ones.
    ///
    /// Returns the number of events received.
    pub fn drain_events(&mut self) -> usize {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        let received = events.len();
        for event in coalesce(events) {
            if let Err(e) = self.apply(event) {
                tracing::warn!("Dropping kernel event: {}", e);
            }
        }
        received
    }

    /// Register new or edited cells and queue them to run.
    ///
    /// Registered cells are ordinary roots: a pure cell whose code and inputs
    /// match a cached run is served from the cache.
    ///
    /// A cell defining a name another live cell already defines is parked
    /// with a [`CellError::MultipleDefinition`] and retried whenever
    /// definitions change.
    pub fn register_cells(&mut self, specs: Vec<CellSpec>) {
        for spec in specs {
            self.register_one(spec);
        }
        self.retry_parked();
    }

    fn register_one(&mut self, spec: CellSpec) {
        let id = spec.id;
        let unchanged = !self.parked.contains_key(&id)
            && self
                .graph
                .get_cell(id)
                .is_some_and(|c| c.code == spec.code && c.defs == spec.defs && c.refs == spec.refs);
        if unchanged {
            return;
        }

        let old_defs = self
            .graph
            .get_cell(id)
            .map(|c| c.defs.clone())
            .unwrap_or_default();

        match self.graph.register(spec.clone()) {
            Ok(()) => {
                self.parked.remove(&id);
                self.errors.remove(&id);
                let dropped: BTreeSet<VarName> = old_defs.difference(&spec.defs).cloned().collect();
                if !dropped.is_empty() {
                    self.clear_definitions(&dropped);
                    for orphan in self.graph.referrers_of(&dropped) {
                        self.mark_dangling(orphan);
                    }
                }
                self.pending.insert(id);
            }
            Err(conflict) => {
                if self.graph.contains(id) {
                    self.remove_from_graph(id);
                }
                let mut cells: Vec<CellId> = conflict.conflicts.iter().map(|(_, c)| *c).collect();
                cells.sort();
                cells.dedup();
                let name = conflict
                    .conflicts
                    .first()
                    .map(|(n, _)| n.clone())
                    .unwrap_or_default();
                tracing::warn!("{}", conflict);

                let error = CellError::MultipleDefinition { name, cells };
                let seq = match self.parked.get(&id) {
                    Some(parked) => parked.seq,
                    None => {
                        self.next_park_seq += 1;
                        self.next_park_seq
                    }
                };
                self.parked.insert(id, ParkedCell { seq, spec });
                self.pending.remove(&id);
                self.forced.remove(&id);
                self.errors.insert(id, error.clone());
                self.broadcast(KernelMessage::CellStatus {
                    cell: id,
                    status: CellStatus::Error,
                });
                self.broadcast(KernelMessage::CellError { cell: id, error });
            }
        }
    }

    fn retry_parked(&mut self) {
        let mut parked: Vec<(u64, CellId)> = self.parked.iter().map(|(id, p)| (p.seq, *id)).collect();
        parked.sort_unstable();
        for (_, id) in parked {
            let Some(spec) = self.parked.get(&id).map(|p| p.spec.clone()) else {
                continue;
            };
            if self.graph.register(spec).is_ok() {
                tracing::debug!(cell = %id, "parked cell registered");
                self.parked.remove(&id);
                self.errors.remove(&id);
                self.pending.insert(id);
            }
        }
    }

    /// Remove a cell. Dependents keep their now-dangling references and
    /// become stale.
    pub fn delete_cell(&mut self, cell: CellId) -> Result<()> {
        if self.parked.remove(&cell).is_none() {
            if !self.graph.contains(cell) {
                return Err(Error::CellNotFound(cell));
            }
            self.remove_from_graph(cell);
        }
        self.errors.remove(&cell);
        self.pending.remove(&cell);
        self.forced.remove(&cell);
        self.broadcast(KernelMessage::CellDeleted { cell });
        self.retry_parked();
        Ok(())
    }

    fn remove_from_graph(&mut self, cell: CellId) {
        let children = self.graph.children(cell);
        let Some(removed) = self.graph.unregister(cell) else {
            return;
        };
        self.clear_definitions(&removed.defs);
        self.runtime.remove_cell(cell);
        self.cache.invalidate_scope(&ScopeId::for_cell(cell));
        for child in children {
            self.mark_dangling(child);
        }
    }

    fn mark_dangling(&mut self, cell: CellId) {
        let names = self.graph.dangling_refs(cell);
        if !names.is_empty() {
            tracing::debug!(%cell, ?names, "dangling references");
            self.broadcast(KernelMessage::DanglingRefs { cell, names });
        }
        self.set_status(cell, CellStatus::Stale);
    }

    /// Queue cells to run, bypassing the cache for them.
    pub fn run_cells(&mut self, cells: impl IntoIterator<Item = CellId>) -> Result<()> {
        for cell in cells {
            if self.graph.contains(cell) {
                self.pending.insert(cell);
                self.forced.insert(cell);
            } else if self.parked.contains_key(&cell) {
                tracing::debug!(%cell, "not running parked cell");
            } else {
                return Err(Error::CellNotFound(cell));
            }
        }
        Ok(())
    }

    /// Apply a frontend update to a UI element.
    ///
    /// Publishes the projected patch and queues the cells that read any name
    /// bound to the element or to the composite containing it.
    pub fn set_element_value(&mut self, element: &ElementId, value: Value) -> Result<()> {
        let (root, patch) = self.runtime.set_element_value(element, value)?;
        self.broadcast(KernelMessage::ElementValue {
            element: root.clone(),
            patch,
        });

        let mut names = self.runtime.element_names(&root);
        names.extend(self.runtime.element_names(element));
        let readers = self.graph.referrers_of(&names);
        self.pending.extend(readers);
        Ok(())
    }

    /// Apply a frontend update to a widget model.
    ///
    /// Observers run inside the owning cell. Readers of the model re-run, the
    /// owning cell does not.
    pub fn model_update(&mut self, model: &ModelId, patch: Value) -> Result<()> {
        let owner = self.runtime.dispatch_model_update(model, &patch)?;

        let names = self
            .namespace
            .with(|ns| ns.names_where(|b| matches!(b, Binding::Model(m) if m == model)));
        let mut readers = self.graph.referrers_of(&names);
        readers.remove(&owner);
        self.pending.extend(readers);

        self.schedule_state_writes();
        Ok(())
    }

    /// Write a state cell from outside any cell.
    pub fn set_state(&mut self, state: StateId, value: Value) -> Result<()> {
        self.runtime.set_state(state, value)?;
        self.schedule_state_writes();
        Ok(())
    }

    /// Queue the readers of a changed watched path.
    pub fn watch_triggered(&mut self, id: WatchId) {
        let names = self
            .namespace
            .with(|ns| ns.names_where(|b| matches!(b, Binding::Watch(w) if *w == id)));
        let readers = self.graph.referrers_of(&names);
        tracing::debug!(watch = %id, readers = readers.len(), "watched path changed");
        self.pending.extend(readers);
    }

    /// Answer a completion request, or report that the namespace was busy.
    pub fn complete(&self, request: u64, prefix: &str) {
        let names = self.completion_worker().complete(prefix);
        self.broadcast(KernelMessage::Completion { request, names });
    }

    fn schedule_state_writes(&mut self) {
        for write in self.runtime.take_writes() {
            let state = write.state;
            let names = self
                .namespace
                .with(|ns| ns.names_where(|b| matches!(b, Binding::State(s) if *s == state)));
            let mut readers = self.graph.referrers_of(&names);
            if let Origin::Cell(origin) = write.origin {
                readers.remove(&origin);
            }
            self.pending.extend(readers);
        }
    }

    // ---- running ----

    /// Apply queued events and run until nothing is left to run.
    ///
    /// State writes and element updates made during a run queue new roots;
    /// each round's run-set is computed fresh from the graph at that point.
    pub async fn run_until_idle(&mut self) -> RunReport {
        let mut report = RunReport::default();
        self.abort.reset();

        loop {
            self.drain_events();
            // writes made through a runtime handle outside any run
            if self.runtime.has_pending_writes() {
                self.schedule_state_writes();
            }
            if self.pending.is_empty() {
                break;
            }
            let roots = std::mem::take(&mut self.pending);
            let forced = std::mem::take(&mut self.forced);
            self.run_once(&roots, &forced, &mut report).await;

            if self.abort.is_aborted() {
                self.pending.clear();
                self.forced.clear();
                break;
            }
        }

        report
    }

    async fn run_once(&mut self, roots: &BTreeSet<CellId>, forced: &BTreeSet<CellId>, report: &mut RunReport) {
        let plan = self.graph.plan(roots);
        for cycle in &plan.cycles {
            tracing::warn!("{}", cycle);
        }

        let mut failed: FxHashSet<CellId> = FxHashSet::default();
        for (cell, reason) in &plan.blocked {
            let (status, error) = match reason {
                BlockReason::InCycle(cycle) => (CellStatus::Error, CellError::Cycle { cycle: cycle.clone() }),
                BlockReason::DownstreamOfCycle(ancestor) => (
                    CellStatus::Stale,
                    CellError::AncestorBlocked { ancestor: *ancestor },
                ),
            };
            self.fail_cell(*cell, status, error);
            failed.insert(*cell);
            report.blocked.push(*cell);
        }

        for &cell in &plan.order {
            self.set_status(cell, CellStatus::Queued);
        }

        for &cell in &plan.order {
            if self.abort.is_aborted() {
                self.set_status(cell, CellStatus::Stale);
                report.skipped.push(cell);
                continue;
            }

            if let Some(ancestor) = self.failed_parent(cell, &failed) {
                self.fail_cell(cell, CellStatus::Stale, CellError::AncestorFailed { ancestor });
                failed.insert(cell);
                report.skipped.push(cell);
                continue;
            }

            match self.run_cell(cell, forced.contains(&cell)).await {
                CellRun::Executed => report.executed.push(cell),
                CellRun::Cached => report.cached.push(cell),
                CellRun::Failed => {
                    failed.insert(cell);
                    report.failed.push(cell);
                }
            }
        }

        let evicted = self.runtime.collect_garbage();
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "evicted unreachable elements");
        }
        self.schedule_state_writes();
    }

    fn failed_parent(&self, cell: CellId, failed: &FxHashSet<CellId>) -> Option<CellId> {
        self.graph.parents(cell).into_iter().find(|parent| {
            failed.contains(parent)
                || matches!(
                    self.graph.status(*parent),
                    Some(CellStatus::Error | CellStatus::Stale)
                )
        })
    }

    async fn run_cell(&mut self, id: CellId, forced: bool) -> CellRun {
        let Some(cell) = self.graph.get_cell(id).cloned() else {
            return CellRun::Failed;
        };

        self.set_status(id, CellStatus::Running);
        self.errors.remove(&id);

        let (inputs, missing) = self.collect_inputs(&cell);
        self.clear_definitions(&cell.defs);
        self.runtime.begin_cell(id);

        let strategy = if self.config.cell_cache {
            self.identify_cell(&cell)
        } else {
            None
        };

        if !forced
            && let Some(strategy) = &strategy
            && let Some(output) = self.cached_output(id, strategy)
        {
            tracing::debug!(cell = %id, "served from cache");
            self.bind_outputs(&cell, &output);
            self.set_status(id, CellStatus::Idle);
            self.broadcast(KernelMessage::CellOutput {
                cell: id,
                display: output.display,
                cached: true,
            });
            return CellRun::Cached;
        }

        let request = CellRequest {
            cell: id,
            code: cell.code.clone(),
            inputs,
            missing,
            runtime: self.runtime.clone(),
        };

        self.runtime.enter(id, FrameKind::Run);
        let result = self.executor.execute(request).await;
        let frame = self.runtime.exit();
        if let Some(frame) = &frame {
            self.runtime.finish_cell(id, frame);
        }

        match result {
            Ok(output) => {
                self.bind_outputs(&cell, &output);

                if let (Some(strategy), Some(frame)) = (strategy, &frame)
                    && frame.is_pure()
                    && output.is_plain()
                {
                    match serde_json::to_value(&output) {
                        Ok(result) => self.cache.store(
                            &ScopeId::for_cell(id),
                            strategy,
                            result,
                            frame.effect_digest(),
                        ),
                        Err(e) => tracing::debug!(cell = %id, "output not cacheable: {}", e),
                    }
                }

                self.set_status(id, CellStatus::Idle);
                self.broadcast(KernelMessage::CellOutput {
                    cell: id,
                    display: output.display,
                    cached: false,
                });
                CellRun::Executed
            }
            Err(failure) => {
                tracing::warn!(cell = %id, "cell failed: {}", failure);
                self.fail_cell(
                    id,
                    CellStatus::Error,
                    CellError::Exception {
                        message: failure.message,
                    },
                );
                CellRun::Failed
            }
        }
    }

    fn collect_inputs(&self, cell: &Cell) -> (BTreeMap<VarName, Binding>, Vec<VarName>) {
        self.namespace.with(|ns| {
            let mut inputs = BTreeMap::new();
            let mut missing = Vec::new();
            for name in cell.refs.iter().filter(|n| !cell.defs.contains(*n)) {
                match ns.get(name) {
                    Some(binding) => {
                        inputs.insert(name.clone(), binding.clone());
                    }
                    None if !self.graph.is_private(name) => missing.push(name.clone()),
                    None => {}
                }
            }
            (inputs, missing)
        })
    }

    fn identify_cell(&self, cell: &Cell) -> Option<HashStrategy> {
        let free_vars = cell
            .refs
            .iter()
            .filter(|n| !self.graph.is_private(n) && !cell.defs.contains(*n))
            .cloned();
        let unit = CacheUnit::new(cell.id.to_string(), cell.code.as_str()).closing_over(free_vars);

        let identified = self.namespace.with(|ns| {
            let env = NamespaceEnv {
                namespace: ns,
                runtime: &self.runtime,
            };
            self.cache.identify(&unit, &env)
        });

        match identified {
            Ok(strategy) => Some(strategy),
            Err(e) => {
                tracing::debug!(cell = %cell.id, "not cacheable: {}", e);
                None
            }
        }
    }

    fn cached_output(&self, cell: CellId, strategy: &HashStrategy) -> Option<CellOutput> {
        match self.cache.lookup(&ScopeId::for_cell(cell), strategy) {
            Ok(Some(entry)) => serde_json::from_value(entry.result).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(%cell, "treating cache entry as a miss: {}", e);
                None
            }
        }
    }

    fn bind_outputs(&mut self, cell: &Cell, output: &CellOutput) {
        let _hold = self.namespace.hold();
        for (name, binding) in &output.bindings {
            if !cell.defs.contains(name) {
                tracing::warn!(cell = %cell.id, name = %name, "ignoring binding of undeclared name");
                continue;
            }
            if let Binding::Element(element) = binding {
                self.runtime.bind_element(name, element.clone());
            }
            self.namespace
                .with_mut(|ns| ns.insert(name.clone(), binding.clone()));
        }
    }

    fn clear_definitions(&mut self, names: &BTreeSet<VarName>) {
        let _hold = self.namespace.hold();
        for name in names {
            self.namespace.with_mut(|ns| ns.remove(name));
            self.runtime.unbind_element(name);
        }
    }

    fn fail_cell(&mut self, cell: CellId, status: CellStatus, error: CellError) {
        if let Some(defs) = self.graph.get_cell(cell).map(|c| c.defs.clone()) {
            self.clear_definitions(&defs);
        }
        self.set_status(cell, status);
        self.errors.insert(cell, error.clone());
        self.broadcast(KernelMessage::CellError { cell, error });
    }
}
