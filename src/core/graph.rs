//! Work graph: dependency validation and batch planning.
//!
//! The graph owns the unit set for one run. Everything derived from it
//! (adjacency, in-degrees, ready sets) is rebuilt on demand and never
//! persisted. Planning is a pure function of the unit set plus a set of
//! already-completed ids supplied by the caller.

use crate::core::unit::{UnitId, WorkUnit};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::path::Path;

/// Heap key: ascending priority, ties broken by input order.
type ReadyKey = Reverse<(i64, usize)>;

/// A set of mutually independent units that may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Layer index (0-based).
    pub index: usize,
    /// Units in non-decreasing priority order, ties in input order.
    pub units: Vec<UnitId>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.units.contains(id)
    }
}

/// Full layered plan for a graph with nothing completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub batches: Vec<Batch>,
    pub total_units: usize,
    /// Widest layer; the most workers the run could ever use at once.
    pub max_width: usize,
}

impl ExecutionPlan {
    /// Number of layers, i.e. the length of the longest dependency chain.
    pub fn depth(&self) -> usize {
        self.batches.len()
    }

    /// Batch index a unit was placed in.
    pub fn batch_of(&self, id: &UnitId) -> Option<usize> {
        self.batches
            .iter()
            .find(|b| b.contains(id))
            .map(|b| b.index)
    }
}

impl std::fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} units in {} batches (max width {})",
            self.total_units,
            self.depth(),
            self.max_width
        )?;
        for batch in &self.batches {
            let ids: Vec<&str> = batch.units.iter().map(|u| u.as_str()).collect();
            writeln!(f, "  batch {}: {}", batch.index + 1, ids.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SpecDocument {
    #[serde(alias = "stories")]
    units: Vec<WorkUnit>,
}

/// The dependency graph over one run's work units.
#[derive(Clone, Default)]
pub struct WorkGraph {
    /// Units in original input order.
    units: Vec<WorkUnit>,
    /// Id to position in `units`.
    index: HashMap<UnitId, usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl WorkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from units in input order.
    pub fn from_units(units: impl IntoIterator<Item = WorkUnit>) -> Result<Self> {
        let mut graph = Self::new();
        for unit in units {
            graph.add_unit(unit)?;
        }
        Ok(graph)
    }

    /// Deserialize a work specification document (`{"units": [...]}`).
    ///
    /// Only deserialization happens here; call [`WorkGraph::validate`]
    /// before planning.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: SpecDocument = serde_json::from_str(json)?;
        Self::from_units(doc.units)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Add a unit. Dependencies may name units added later.
    pub fn add_unit(&mut self, unit: WorkUnit) -> Result<()> {
        if self.index.contains_key(&unit.id) {
            return Err(Error::DuplicateUnit(unit.id));
        }
        self.index.insert(unit.id.clone(), self.units.len());
        self.units.push(unit);
        Ok(())
    }

    pub fn get(&self, id: &UnitId) -> Option<&WorkUnit> {
        self.index.get(id).map(|&i| &self.units[i])
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.index.contains_key(id)
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    pub fn ids(&self) -> impl Iterator<Item = &UnitId> {
        self.units.iter().map(|u| &u.id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Check that every dependency exists and the relation is acyclic.
    ///
    /// Dangling references are reported before cycles, in input order.
    pub fn validate(&self) -> Result<()> {
        let graph = self.dependency_graph()?;
        if let Some(cycle) = find_cycle(&graph) {
            return Err(Error::Cycle {
                cycle: cycle
                    .into_iter()
                    .map(|n| self.units[n.index()].id.clone())
                    .collect(),
            });
        }
        Ok(())
    }

    /// Layer the not-yet-completed units into batches.
    ///
    /// Units in `completed` are treated as satisfied and left out. Each
    /// layer holds the units whose remaining dependencies all sit in
    /// strictly earlier layers.
    pub fn compute_batches(&self, completed: &HashSet<UnitId>) -> Result<Vec<Batch>> {
        self.validate()?;
        let adjacency = self.adjacency();
        let mut remaining = self.remaining_dependencies(completed);

        let mut current: BinaryHeap<ReadyKey> = BinaryHeap::new();
        for (i, unit) in self.units.iter().enumerate() {
            if !completed.contains(&unit.id) && remaining[i] == 0 {
                current.push(Reverse((unit.priority, i)));
            }
        }

        let mut batches = Vec::new();
        while !current.is_empty() {
            let mut next = BinaryHeap::new();
            let mut units = Vec::with_capacity(current.len());
            while let Some(Reverse((_, i))) = current.pop() {
                units.push(self.units[i].id.clone());
                for &dependent in &adjacency[i] {
                    remaining[dependent] -= 1;
                    if remaining[dependent] == 0 && !completed.contains(&self.units[dependent].id) {
                        next.push(Reverse((self.units[dependent].priority, dependent)));
                    }
                }
            }
            batches.push(Batch {
                index: batches.len(),
                units,
            });
            current = next;
        }
        Ok(batches)
    }

    /// Plan the whole graph from scratch.
    pub fn get_execution_plan(&self) -> Result<ExecutionPlan> {
        let batches = self.compute_batches(&HashSet::new())?;
        let max_width = batches.iter().map(Batch::len).max().unwrap_or(0);
        Ok(ExecutionPlan {
            total_units: self.units.len(),
            max_width,
            batches,
        })
    }

    /// Incremental ready queue for unit-by-unit admission.
    pub fn ready_queue(&self, completed: &HashSet<UnitId>) -> Result<ReadyQueue> {
        self.validate()?;
        Ok(ReadyQueue::new(self, completed))
    }

    /// Units that directly depend on `id`.
    pub fn dependents_of(&self, id: &UnitId) -> Vec<&UnitId> {
        self.units
            .iter()
            .filter(|u| u.dependencies.contains(id))
            .map(|u| &u.id)
            .collect()
    }

    /// Build the petgraph view: node `i` is `units[i]`, edges run from a
    /// dependency to its dependent.
    fn dependency_graph(&self) -> Result<DiGraph<(), ()>> {
        let mut graph = DiGraph::with_capacity(self.units.len(), 0);
        for _ in &self.units {
            graph.add_node(());
        }
        for (i, unit) in self.units.iter().enumerate() {
            for dep in &unit.dependencies {
                let &d = self
                    .index
                    .get(dep)
                    .ok_or_else(|| Error::DanglingDependency {
                        unit: unit.id.clone(),
                        missing: dep.clone(),
                    })?;
                graph.add_edge(NodeIndex::new(d), NodeIndex::new(i), ());
            }
        }
        Ok(graph)
    }

    /// Dependents per unit, ascending by input position.
    ///
    /// Assumes a validated graph; unknown ids are skipped.
    fn adjacency(&self) -> Vec<Vec<usize>> {
        let mut adjacency = vec![Vec::new(); self.units.len()];
        for (i, unit) in self.units.iter().enumerate() {
            for dep in &unit.dependencies {
                if let Some(&d) = self.index.get(dep) {
                    adjacency[d].push(i);
                }
            }
        }
        adjacency
    }

    fn remaining_dependencies(&self, completed: &HashSet<UnitId>) -> Vec<usize> {
        self.units
            .iter()
            .map(|u| {
                u.dependencies
                    .iter()
                    .filter(|d| !completed.contains(*d))
                    .count()
            })
            .collect()
    }
}

impl std::fmt::Debug for WorkGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGraph")
            .field("units", &self.units.len())
            .field(
                "dependencies",
                &self.units.iter().map(|u| u.dependencies.len()).sum::<usize>(),
            )
            .finish()
    }
}

/// Three-color depth-first search, O(V+E).
///
/// Returns the nodes of the first cycle found, closed (first == last),
/// following edge direction.
fn find_cycle(graph: &DiGraph<(), ()>) -> Option<Vec<NodeIndex>> {
    let n = graph.node_count();
    let mut color = vec![Color::White; n];
    let successors: Vec<Vec<NodeIndex>> = graph
        .node_indices()
        .map(|node| {
            let mut next: Vec<NodeIndex> =
                graph.neighbors_directed(node, Direction::Outgoing).collect();
            next.sort();
            next
        })
        .collect();

    for start in graph.node_indices() {
        if color[start.index()] != Color::White {
            continue;
        }
        // (node, next successor position); doubles as the gray path.
        let mut stack: Vec<(NodeIndex, usize)> = vec![(start, 0)];
        color[start.index()] = Color::Gray;

        while let Some(top) = stack.last_mut() {
            let (node, pos) = *top;
            if let Some(&next) = successors[node.index()].get(pos) {
                top.1 += 1;
                match color[next.index()] {
                    Color::White => {
                        color[next.index()] = Color::Gray;
                        stack.push((next, 0));
                    }
                    Color::Gray => {
                        let from = stack.iter().position(|(n, _)| *n == next)?;
                        let mut cycle: Vec<NodeIndex> =
                            stack[from..].iter().map(|(n, _)| *n).collect();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Color::Black => {}
                }
            } else {
                color[node.index()] = Color::Black;
                stack.pop();
            }
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    /// Waiting on unfinished dependencies.
    Waiting,
    /// In the ready heap.
    Ready,
    /// Handed out to a worker.
    Taken,
    Done,
    Failed,
    Blocked,
}

/// A unit that can never run because something upstream failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedUnit {
    pub id: UnitId,
    /// Failed root first, ending with the direct dependency of `id`.
    pub cause: Vec<UnitId>,
}

impl BlockedUnit {
    pub fn reason(&self) -> String {
        let chain: Vec<&str> = self.cause.iter().map(|c| c.as_str()).collect();
        match chain.as_slice() {
            [root] => format!("dependency {} failed", root),
            [root, rest @ ..] => format!("dependency {} failed (via {})", root, rest.join(" -> ")),
            [] => "upstream failure".to_string(),
        }
    }
}

/// A unit that is neither finished nor ready, and what it still waits on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUnit {
    pub id: UnitId,
    pub waiting_on: Vec<UnitId>,
}

/// Incrementally maintained set of units ready to run.
///
/// Built once from a validated graph; each completion decrements the
/// remaining-dependency count of its dependents and pushes newly ready
/// units onto a priority heap, so no layer is ever re-sorted.
#[derive(Debug, Clone)]
pub struct ReadyQueue {
    ids: Vec<UnitId>,
    priorities: Vec<i64>,
    index: HashMap<UnitId, usize>,
    adjacency: Vec<Vec<usize>>,
    dependencies: Vec<Vec<usize>>,
    remaining: Vec<usize>,
    slots: Vec<Slot>,
    heap: BinaryHeap<ReadyKey>,
}

impl ReadyQueue {
    fn new(graph: &WorkGraph, completed: &HashSet<UnitId>) -> Self {
        let adjacency = graph.adjacency();
        let remaining = graph.remaining_dependencies(completed);
        let dependencies = graph
            .units
            .iter()
            .map(|u| {
                u.dependencies
                    .iter()
                    .filter_map(|d| graph.index.get(d).copied())
                    .collect()
            })
            .collect();

        let mut queue = Self {
            ids: graph.units.iter().map(|u| u.id.clone()).collect(),
            priorities: graph.units.iter().map(|u| u.priority).collect(),
            index: graph.index.clone(),
            adjacency,
            dependencies,
            remaining,
            slots: vec![Slot::Waiting; graph.units.len()],
            heap: BinaryHeap::new(),
        };
        for i in 0..queue.ids.len() {
            if completed.contains(&queue.ids[i]) {
                queue.slots[i] = Slot::Done;
            } else if queue.remaining[i] == 0 {
                queue.push_ready(i);
            }
        }
        queue
    }

    fn push_ready(&mut self, i: usize) {
        self.slots[i] = Slot::Ready;
        self.heap.push(Reverse((self.priorities[i], i)));
    }

    /// Take the highest-priority ready unit.
    pub fn pop(&mut self) -> Option<UnitId> {
        self.pop_where(|_| true)
    }

    /// Take the highest-priority ready unit accepted by `admit`.
    ///
    /// Rejected units stay queued with their original order.
    pub fn pop_where(&mut self, mut admit: impl FnMut(&UnitId) -> bool) -> Option<UnitId> {
        let mut skipped = Vec::new();
        let mut found = None;
        while let Some(key) = self.heap.pop() {
            let Reverse((_, i)) = key;
            if self.slots[i] != Slot::Ready {
                continue;
            }
            if admit(&self.ids[i]) {
                self.slots[i] = Slot::Taken;
                found = Some(self.ids[i].clone());
                break;
            }
            skipped.push(key);
        }
        self.heap.extend(skipped);
        found
    }

    /// Put a taken unit back (used for retries).
    pub fn requeue(&mut self, id: &UnitId) {
        if let Some(&i) = self.index.get(id) {
            if self.slots[i] == Slot::Taken {
                self.push_ready(i);
            }
        }
    }

    /// Record a completion; returns units that became ready.
    pub fn complete(&mut self, id: &UnitId) -> Vec<UnitId> {
        let Some(&i) = self.index.get(id) else {
            return Vec::new();
        };
        if self.slots[i] == Slot::Done {
            return Vec::new();
        }
        self.slots[i] = Slot::Done;
        let mut newly_ready = Vec::new();
        for dependent in self.adjacency[i].clone() {
            self.remaining[dependent] = self.remaining[dependent].saturating_sub(1);
            if self.remaining[dependent] == 0 && self.slots[dependent] == Slot::Waiting {
                self.push_ready(dependent);
                newly_ready.push(self.ids[dependent].clone());
            }
        }
        newly_ready
    }

    /// Record a failure; every transitive dependent becomes blocked.
    ///
    /// Returns the newly blocked units with their cause chain.
    pub fn fail(&mut self, id: &UnitId) -> Vec<BlockedUnit> {
        let Some(&root) = self.index.get(id) else {
            return Vec::new();
        };
        self.slots[root] = Slot::Failed;

        let mut blocked = Vec::new();
        let mut parent: HashMap<usize, usize> = HashMap::new();
        let mut queue = VecDeque::from([root]);
        while let Some(node) = queue.pop_front() {
            for &dependent in &self.adjacency[node] {
                if matches!(
                    self.slots[dependent],
                    Slot::Done | Slot::Failed | Slot::Blocked | Slot::Taken
                ) {
                    continue;
                }
                self.slots[dependent] = Slot::Blocked;
                parent.insert(dependent, node);
                queue.push_back(dependent);

                let mut cause = Vec::new();
                let mut cursor = node;
                loop {
                    cause.push(self.ids[cursor].clone());
                    match parent.get(&cursor) {
                        Some(&p) => cursor = p,
                        None => break,
                    }
                }
                cause.reverse();
                blocked.push(BlockedUnit {
                    id: self.ids[dependent].clone(),
                    cause,
                });
            }
        }
        blocked
    }

    /// Mark every unfinished unit as no longer schedulable (cancellation).
    ///
    /// Returns the ids that had not started.
    pub fn drain_unstarted(&mut self) -> Vec<UnitId> {
        self.heap.clear();
        let mut drained = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot, Slot::Waiting | Slot::Ready) {
                *slot = Slot::Blocked;
                drained.push(self.ids[i].clone());
            }
        }
        drained
    }

    pub fn has_ready(&self) -> bool {
        self.slots.iter().any(|s| *s == Slot::Ready)
    }

    pub fn ready_count(&self) -> usize {
        self.slots.iter().filter(|s| **s == Slot::Ready).count()
    }

    /// Units that have neither finished nor been blocked.
    pub fn unresolved(&self) -> Vec<PendingUnit> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Slot::Waiting | Slot::Ready | Slot::Taken))
            .map(|(i, _)| PendingUnit {
                id: self.ids[i].clone(),
                waiting_on: self.dependencies[i]
                    .iter()
                    .filter(|&&d| self.slots[d] != Slot::Done)
                    .map(|&d| self.ids[d].clone())
                    .collect(),
            })
            .collect()
    }

    /// True once every unit is done, failed, or blocked.
    pub fn is_settled(&self) -> bool {
        self.slots
            .iter()
            .all(|s| matches!(s, Slot::Done | Slot::Failed | Slot::Blocked))
    }
}
