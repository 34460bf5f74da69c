//! The reactive dependency graph.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, VecDeque};

use parking_lot::Mutex;
use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use rustc_hash::{FxHashMap, FxHashSet};

use super::types::{
    BlockReason, Cell, CellId, CellSpec, CellStatus, CycleError, ExecutionPlan,
    MultipleDefinitionError, VarName,
};

/// Default prefix marking cell-private names.
pub const DEFAULT_PRIVATE_PREFIX: &str = "_";

/// Cells and the def/ref edges between them.
///
/// Edges go from the cell defining a variable to every cell referencing it.
/// Names starting with the private prefix are local to their cell: they never
/// create edges and are exempt from the single-definition rule.
pub struct DependencyGraph {
    /// The directed graph: edges go from definer to referrer
    graph: StableDiGraph<CellId, ()>,
    /// Cell ID to node index mapping
    node_indices: FxHashMap<CellId, NodeIndex>,
    /// Cell records by ID
    cells: FxHashMap<CellId, Cell>,
    /// Variable name to defining cell
    definers: FxHashMap<VarName, CellId>,
    /// Variable name to referencing cells
    referrers: FxHashMap<VarName, BTreeSet<CellId>>,
    /// Next registration sequence number
    next_seq: u64,
    private_prefix: String,
    /// `affected_by` results, cleared on every register/unregister
    affected_memo: Mutex<FxHashMap<Vec<VarName>, BTreeSet<CellId>>>,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::with_private_prefix(DEFAULT_PRIVATE_PREFIX)
    }

    /// Create a graph with a custom private-name prefix.
    pub fn with_private_prefix(prefix: impl Into<String>) -> Self {
        Self {
            graph: StableDiGraph::new(),
            node_indices: FxHashMap::default(),
            cells: FxHashMap::default(),
            definers: FxHashMap::default(),
            referrers: FxHashMap::default(),
            next_seq: 0,
            private_prefix: prefix.into(),
            affected_memo: Mutex::new(FxHashMap::default()),
        }
    }

    /// Whether `name` is exempt from cross-cell dataflow.
    pub fn is_private(&self, name: &str) -> bool {
        is_private_name(&self.private_prefix, name)
    }

    /// Register a cell, or re-register it with new code/defs/refs.
    ///
    /// Rejects the registration if any public name in `defs` is already
    /// defined by a different live cell. On rejection the graph is unchanged.
    pub fn register(&mut self, spec: CellSpec) -> Result<(), MultipleDefinitionError> {
        let conflicts: Vec<(VarName, CellId)> = spec
            .defs
            .iter()
            .filter(|name| !self.is_private(name))
            .filter_map(|name| match self.definers.get(name) {
                Some(&owner) if owner != spec.id => Some((name.clone(), owner)),
                _ => None,
            })
            .collect();

        if !conflicts.is_empty() {
            return Err(MultipleDefinitionError {
                cell: spec.id,
                conflicts,
            });
        }

        let (seq, status) = match self.cells.remove(&spec.id) {
            Some(old) => {
                self.unindex(&old);
                (old.seq, old.status)
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                (seq, CellStatus::Idle)
            }
        };

        let cell = Cell {
            id: spec.id,
            code: spec.code,
            defs: spec.defs,
            refs: spec.refs,
            status,
            seq,
        };

        self.index(&cell);
        let id = cell.id;
        self.cells.insert(id, cell);
        self.rewire(id);
        self.affected_memo.lock().clear();

        tracing::debug!(cell = %id, "registered cell");
        Ok(())
    }

    /// Remove a cell and every edge touching it.
    ///
    /// Dependents are left in place; their references to this cell's
    /// definitions become dangling (see [`dangling_refs`](Self::dangling_refs)).
    pub fn unregister(&mut self, id: CellId) -> Option<Cell> {
        let cell = self.cells.remove(&id)?;
        self.unindex(&cell);
        if let Some(idx) = self.node_indices.remove(&id) {
            self.graph.remove_node(idx);
        }
        self.affected_memo.lock().clear();

        tracing::debug!(cell = %id, "unregistered cell");
        Some(cell)
    }

    fn index(&mut self, cell: &Cell) {
        let prefix = self.private_prefix.clone();
        for name in cell.defs.iter().filter(|n| !is_private_name(&prefix, n)) {
            self.definers.insert(name.clone(), cell.id);
        }
        for name in cell.refs.iter().filter(|n| !is_private_name(&prefix, n)) {
            self.referrers
                .entry(name.clone())
                .or_default()
                .insert(cell.id);
        }
    }

    fn unindex(&mut self, cell: &Cell) {
        for name in &cell.defs {
            if self.definers.get(name) == Some(&cell.id) {
                self.definers.remove(name);
            }
        }
        for name in &cell.refs {
            if let Some(set) = self.referrers.get_mut(name) {
                set.remove(&cell.id);
                if set.is_empty() {
                    self.referrers.remove(name);
                }
            }
        }
    }

    /// Rebuild every edge incident to `id` from the name indices.
    fn rewire(&mut self, id: CellId) {
        let node = *self
            .node_indices
            .entry(id)
            .or_insert_with(|| self.graph.add_node(id));

        let incident: Vec<_> = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .chain(self.graph.edges_directed(node, Direction::Outgoing))
            .map(|e| e.id())
            .collect();
        for edge in incident {
            self.graph.remove_edge(edge);
        }

        let Some(cell) = self.cells.get(&id) else {
            return;
        };

        let mut edges = Vec::new();
        for name in cell.refs.iter().filter(|n| !self.is_private(n)) {
            if let Some(&definer) = self.definers.get(name)
                && definer != id
            {
                edges.push((definer, id));
            }
        }
        for name in cell.defs.iter().filter(|n| !self.is_private(n)) {
            if let Some(readers) = self.referrers.get(name) {
                edges.extend(readers.iter().filter(|&&r| r != id).map(|&r| (id, r)));
            }
        }

        for (from, to) in edges {
            let from_idx = self.node_indices[&from];
            let to_idx = self.node_indices[&to];
            self.graph.update_edge(from_idx, to_idx, ());
        }
    }

    /// Cells reachable from `roots`, ordered so every cell follows the cells
    /// defining the variables it references.
    ///
    /// Cells with no ordering constraint between them keep registration order.
    /// If the reachable subgraph contains a cycle, the minimal cycle is returned.
    pub fn topological_order(
        &self,
        roots: &BTreeSet<CellId>,
    ) -> Result<Vec<CellId>, CycleError> {
        let members = self.descendants(roots);
        let order = self.kahn(&members);

        if order.len() < members.len() {
            let emitted: FxHashSet<CellId> = order.iter().copied().collect();
            let remaining: FxHashSet<CellId> =
                members.difference(&emitted).copied().collect();
            let cycle = self.minimal_cycle(&remaining).unwrap_or_default();
            return Err(CycleError { cycle });
        }

        Ok(order)
    }

    /// Plan a run-set: like [`topological_order`](Self::topological_order),
    /// but cycles only block their members and descendants.
    pub fn plan(&self, roots: &BTreeSet<CellId>) -> ExecutionPlan {
        use petgraph::algo::tarjan_scc;

        let members = self.descendants(roots);
        let mut plan = ExecutionPlan::default();
        let mut excluded: FxHashSet<CellId> = FxHashSet::default();

        let mut components: Vec<FxHashSet<CellId>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .map(|scc| scc.into_iter().map(|idx| self.graph[idx]).collect::<FxHashSet<_>>())
            .filter(|scc| scc.iter().any(|id| members.contains(id)))
            .collect();
        components.sort_by_key(|scc| scc.iter().map(|id| self.seq(*id)).min());

        for component in components {
            let cycle = self.minimal_cycle(&component).unwrap_or_default();
            let mut in_cycle: Vec<CellId> = component.iter().copied().collect();
            in_cycle.sort_by_key(|id| self.seq(*id));
            for id in in_cycle {
                if excluded.insert(id) {
                    plan.blocked.push((id, BlockReason::InCycle(cycle.clone())));
                }
            }
            plan.cycles.push(CycleError { cycle });
        }

        let cycle_cells: Vec<CellId> = excluded.iter().copied().collect();
        let mut downstream: Vec<(CellId, CellId)> = Vec::new();
        for &origin in &cycle_cells {
            for id in self.descendants(&BTreeSet::from([origin])) {
                if members.contains(&id) && !excluded.contains(&id) {
                    downstream.push((id, origin));
                }
            }
        }
        downstream.sort_by_key(|(id, origin)| (self.seq(*id), self.seq(*origin)));
        for (id, origin) in downstream {
            if excluded.insert(id) {
                plan.blocked
                    .push((id, BlockReason::DownstreamOfCycle(origin)));
            }
        }

        let runnable: FxHashSet<CellId> = members.difference(&excluded).copied().collect();
        plan.order = self.kahn(&runnable);
        plan
    }

    /// Cells transitively affected by a change to `changed_vars`.
    ///
    /// Starts from the cells referencing the changed names (not the cells
    /// defining them) and follows definer → referrer edges.
    pub fn affected_by(&self, changed_vars: &BTreeSet<VarName>) -> BTreeSet<CellId> {
        let key: Vec<VarName> = changed_vars.iter().cloned().collect();
        if let Some(hit) = self.affected_memo.lock().get(&key) {
            return hit.clone();
        }

        let seeds = self.referrers_of(changed_vars);
        let affected: BTreeSet<CellId> = self.descendants(&seeds).into_iter().collect();
        self.affected_memo.lock().insert(key, affected.clone());
        affected
    }

    /// Cells directly referencing any of `names`, excluding their definers.
    pub fn referrers_of<'a, I>(&self, names: I) -> BTreeSet<CellId>
    where
        I: IntoIterator<Item = &'a VarName>,
    {
        names
            .into_iter()
            .filter(|name| !self.is_private(name))
            .flat_map(|name| {
                let definer = self.definers.get(name).copied();
                self.referrers
                    .get(name)
                    .into_iter()
                    .flatten()
                    .copied()
                    .filter(move |&id| Some(id) != definer)
            })
            .collect()
    }

    /// `roots` plus every cell transitively depending on them.
    pub fn descendants(&self, roots: &BTreeSet<CellId>) -> FxHashSet<CellId> {
        let mut seen: FxHashSet<CellId> = FxHashSet::default();
        let mut queue: VecDeque<CellId> = VecDeque::new();

        for &root in roots {
            if self.cells.contains_key(&root) && seen.insert(root) {
                queue.push_back(root);
            }
        }

        while let Some(cell_id) = queue.pop_front() {
            if let Some(&node_idx) = self.node_indices.get(&cell_id) {
                for neighbor_idx in self.graph.neighbors(node_idx) {
                    let neighbor_id = self.graph[neighbor_idx];
                    if seen.insert(neighbor_id) {
                        queue.push_back(neighbor_id);
                    }
                }
            }
        }

        seen
    }

    /// Kahn's algorithm restricted to `members`, breaking ties by registration order.
    fn kahn(&self, members: &FxHashSet<CellId>) -> Vec<CellId> {
        let mut indegree: FxHashMap<CellId, usize> =
            members.iter().map(|&id| (id, 0)).collect();
        for &id in members {
            for child in self.children(id) {
                if let Some(d) = indegree.get_mut(&child) {
                    *d += 1;
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<(u64, CellId)>> = indegree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&id, _)| Reverse((self.seq(id), id)))
            .collect();

        let mut order = Vec::with_capacity(members.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            order.push(id);
            for child in self.children(id) {
                if let Some(d) = indegree.get_mut(&child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(Reverse((self.seq(child), child)));
                    }
                }
            }
        }

        order
    }

    /// Shortest cycle inside `nodes`, starting at its earliest-registered member.
    fn minimal_cycle(&self, nodes: &FxHashSet<CellId>) -> Option<Vec<CellId>> {
        let mut starts: Vec<CellId> = nodes.iter().copied().collect();
        starts.sort_by_key(|id| self.seq(*id));

        let mut best: Option<Vec<CellId>> = None;
        for start in starts {
            let mut came_from: FxHashMap<CellId, CellId> = FxHashMap::default();
            let mut queue = VecDeque::from([start]);
            let mut closing: Option<CellId> = None;

            'bfs: while let Some(current) = queue.pop_front() {
                for child in self.children(current) {
                    if !nodes.contains(&child) {
                        continue;
                    }
                    if child == start {
                        closing = Some(current);
                        break 'bfs;
                    }
                    if !came_from.contains_key(&child) {
                        came_from.insert(child, current);
                        queue.push_back(child);
                    }
                }
            }

            let Some(mut tail) = closing else {
                continue;
            };
            let mut path = vec![tail];
            while tail != start {
                tail = came_from[&tail];
                path.push(tail);
            }
            path.reverse();

            if best.as_ref().is_none_or(|b| path.len() < b.len()) {
                best = Some(path);
            }
        }

        best
    }

    fn seq(&self, id: CellId) -> u64 {
        self.cells.get(&id).map(|c| c.seq).unwrap_or(u64::MAX)
    }

    /// Direct dependencies of a cell (cells defining names it references).
    pub fn parents(&self, id: CellId) -> Vec<CellId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of a cell (cells referencing names it defines).
    pub fn children(&self, id: CellId) -> Vec<CellId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: CellId, direction: Direction) -> Vec<CellId> {
        let mut out: Vec<CellId> = self
            .node_indices
            .get(&id)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .map(|n| self.graph[n])
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|c| self.seq(*c));
        out.dedup();
        out
    }

    /// The live cell defining `name`, if any.
    pub fn definer_of(&self, name: &str) -> Option<CellId> {
        self.definers.get(name).copied()
    }

    /// Public names a cell references that no live cell defines.
    pub fn dangling_refs(&self, id: CellId) -> Vec<VarName> {
        self.cells
            .get(&id)
            .map(|cell| {
                cell.refs
                    .iter()
                    .filter(|n| !self.is_private(n) && !self.definers.contains_key(*n))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get a cell by ID.
    pub fn get_cell(&self, id: CellId) -> Option<&Cell> {
        self.cells.get(&id)
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.cells.contains_key(&id)
    }

    /// Current status of a cell.
    pub fn status(&self, id: CellId) -> Option<CellStatus> {
        self.cells.get(&id).map(|c| c.status)
    }

    /// Update the status of a cell. Unknown cells are ignored.
    pub fn set_status(&mut self, id: CellId, status: CellStatus) {
        if let Some(cell) = self.cells.get_mut(&id) {
            cell.status = status;
        }
    }

    /// All cell IDs in registration order.
    pub fn cells_in_registration_order(&self) -> Vec<CellId> {
        let mut ids: Vec<CellId> = self.cells.keys().copied().collect();
        ids.sort_by_key(|id| self.seq(*id));
        ids
    }

    /// Get all cells.
    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    /// Get the number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

fn is_private_name(prefix: &str, name: &str) -> bool {
    !prefix.is_empty() && name.starts_with(prefix)
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}
