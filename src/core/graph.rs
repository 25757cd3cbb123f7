//! Dependency graph construction.
//!
//! `GraphBuilder` turns a flat task list into a `DependencyGraph`: explicit
//! `depends_on` edges plus whatever the configured inference strategies
//! contribute. Nodes are task ids and every edge points from the dependent
//! task to its prerequisite.

use crate::config::InferenceSettings;
use crate::core::inference::{DependencyStrategy, FileStrategy, KeywordStrategy, PhaseStrategy};
use crate::core::task::{Task, TaskId};
use crate::error::GraphError;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// Where a dependency edge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Declared in the task's `depends_on`.
    Explicit,
    /// One task consumes a file another creates.
    File,
    /// Keyword precedence between task categories.
    Logical,
    /// Foundation, implementation and integration phases.
    Architectural,
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EdgeKind::Explicit => "explicit",
            EdgeKind::File => "file",
            EdgeKind::Logical => "logical",
            EdgeKind::Architectural => "architectural",
        };
        write!(f, "{}", name)
    }
}

/// A directed dependency: `from` depends on `to`.
///
/// Only blocking edges constrain layering. Non-blocking edges are kept for
/// reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: TaskId,
    pub to: TaskId,
    pub kind: EdgeKind,
    pub blocking: bool,
    pub description: String,
}

impl DependencyEdge {
    pub fn new(from: TaskId, to: TaskId, kind: EdgeKind, blocking: bool, description: String) -> Self {
        Self {
            from,
            to,
            kind,
            blocking,
            description,
        }
    }
}

/// A file written by more than one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConflict {
    pub path: String,
    pub tasks: Vec<TaskId>,
}

/// The validated dependency graph over a task set.
#[derive(Clone)]
pub struct DependencyGraph {
    graph: DiGraph<TaskId, DependencyEdge>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    fn add_task(&mut self, id: TaskId) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&id) {
            return index;
        }
        let index = self.graph.add_node(id.clone());
        self.task_index.insert(id, index);
        index
    }

    /// Insert an edge, collapsing duplicates between the same pair.
    ///
    /// The first edge seen wins unless a later one is blocking and the
    /// existing one is not.
    fn insert_edge(&mut self, edge: DependencyEdge) -> Result<(), GraphError> {
        let (from, to) = match (self.task_index.get(&edge.from), self.task_index.get(&edge.to)) {
            (Some(&from), Some(&to)) => (from, to),
            _ => {
                return Err(GraphError::UnknownTask {
                    from: edge.from,
                    to: edge.to,
                })
            }
        };
        if from == to {
            return Ok(());
        }

        match self.graph.find_edge(from, to) {
            Some(existing) => self.upgrade_edge(existing, edge),
            None => {
                self.graph.add_edge(from, to, edge);
            }
        }
        Ok(())
    }

    fn upgrade_edge(&mut self, existing: EdgeIndex, edge: DependencyEdge) {
        if let Some(weight) = self.graph.edge_weight_mut(existing) {
            if edge.blocking && !weight.blocking {
                *weight = edge;
            }
        }
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Task ids in insertion order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.graph.node_weights().cloned().collect()
    }

    pub fn edges(&self) -> Vec<&DependencyEdge> {
        self.graph.edge_weights().collect()
    }

    pub fn blocking_edges(&self) -> Vec<&DependencyEdge> {
        self.graph.edge_weights().filter(|e| e.blocking).collect()
    }

    /// Every task that `id` depends on, blocking or not.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing, false)
    }

    /// Every task that depends on `id`.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming, false)
    }

    /// Prerequisites that must complete before `id` may start.
    pub fn blocking_dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing, true)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction, blocking_only: bool) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .edges_directed(index, direction)
            .filter(|e| !blocking_only || e.weight().blocking)
            .map(|e| {
                let other = match direction {
                    Direction::Outgoing => e.target(),
                    Direction::Incoming => e.source(),
                };
                self.graph[other].clone()
            })
            .collect();
        ids.sort();
        ids
    }

    /// Tasks with no dependencies of any kind.
    pub fn independent_tasks(&self) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter(|&i| self.graph.edges_directed(i, Direction::Outgoing).next().is_none())
            .map(|i| self.graph[i].clone())
            .collect()
    }

    /// Tasks nothing else depends on.
    pub fn leaf_tasks(&self) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter(|&i| self.graph.edges_directed(i, Direction::Incoming).next().is_none())
            .map(|i| self.graph[i].clone())
            .collect()
    }

    pub fn is_acyclic(&self) -> bool {
        self.find_cycle().is_none()
    }

    /// Find a cycle among blocking edges.
    ///
    /// Returns a closed path such as `[a, b, c, a]` where each task depends
    /// on the next.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut blocking: DiGraph<(), ()> = DiGraph::with_capacity(
            self.graph.node_count(),
            self.graph.edge_count(),
        );
        for _ in self.graph.node_indices() {
            blocking.add_node(());
        }
        for edge in self.graph.edge_references() {
            if edge.weight().blocking {
                blocking.add_edge(edge.source(), edge.target(), ());
            }
        }

        let component = tarjan_scc(&blocking)
            .into_iter()
            .find(|scc| scc.len() > 1)?;
        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let start = component.iter().copied().min()?;

        // BFS inside the component from `start` back to itself.
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut closing = None;
        while let Some(node) = queue.pop_front() {
            for next in blocking.neighbors(node) {
                if !members.contains(&next) {
                    continue;
                }
                if next == start {
                    closing = Some(node);
                    break;
                }
                if let std::collections::hash_map::Entry::Vacant(slot) = parent.entry(next) {
                    slot.insert(node);
                    queue.push_back(next);
                }
            }
            if closing.is_some() {
                break;
            }
        }

        let mut path = vec![start];
        let mut cursor = closing?;
        let mut reversed = Vec::new();
        while cursor != start {
            reversed.push(cursor);
            cursor = *parent.get(&cursor)?;
        }
        path.extend(reversed.into_iter().rev());
        path.push(start);

        Some(path.into_iter().map(|i| self.graph[i].clone()).collect())
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}

/// Builds a `DependencyGraph` from tasks and a set of inference strategies.
pub struct GraphBuilder {
    strategies: Vec<Box<dyn DependencyStrategy>>,
}

impl GraphBuilder {
    /// A builder that only honours explicit `depends_on` edges.
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// File, keyword and phase inference, in that order.
    pub fn with_default_strategies() -> Self {
        Self::new()
            .with_strategy(Box::new(FileStrategy))
            .with_strategy(Box::new(KeywordStrategy::default()))
            .with_strategy(Box::new(PhaseStrategy))
    }

    pub fn from_config(settings: &InferenceSettings) -> Self {
        let mut builder = Self::new();
        if settings.file {
            builder = builder.with_strategy(Box::new(FileStrategy));
        }
        if settings.keyword {
            builder = builder.with_strategy(Box::new(KeywordStrategy::default()));
        }
        if settings.phase {
            builder = builder.with_strategy(Box::new(PhaseStrategy));
        }
        builder
    }

    pub fn with_strategy(mut self, strategy: Box<dyn DependencyStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Validate the tasks and assemble the dependency graph.
    ///
    /// # Errors
    /// - `InvalidTask` or `DuplicateTask` for a malformed task set
    /// - `UnknownTask` when a strategy produces an edge outside the set
    /// - `CircularDependency` when blocking edges form a cycle
    pub fn build(&self, tasks: &[Task]) -> Result<DependencyGraph, GraphError> {
        let mut graph = DependencyGraph::new();

        for task in tasks {
            task.validate()?;
            if graph.contains(&task.id) {
                return Err(GraphError::DuplicateTask(task.id.clone()));
            }
            graph.add_task(task.id.clone());
        }

        for task in tasks {
            for dep in &task.depends_on {
                if !graph.contains(dep) {
                    warn!(task_id = %task.id, dependency = %dep, "Dropping dependency on unknown task");
                    continue;
                }
                graph.insert_edge(DependencyEdge::new(
                    task.id.clone(),
                    dep.clone(),
                    EdgeKind::Explicit,
                    true,
                    format!("{} depends on {}", task.id, dep),
                ))?;
            }
        }

        for strategy in &self.strategies {
            let inferred = strategy.infer(tasks);
            debug!(strategy = strategy.name(), edges = inferred.len(), "Inferred dependencies");
            for edge in inferred {
                graph.insert_edge(edge)?;
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            return Err(GraphError::CircularDependency { cycle });
        }

        debug!(
            tasks = graph.task_count(),
            edges = graph.edge_count(),
            "Built dependency graph"
        );
        Ok(graph)
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// List files that more than one task writes.
///
/// A task writes a file when its description mentions creating, writing or
/// implementing it.
pub fn detect_conflicts(tasks: &[Task]) -> Vec<FileConflict> {
    let mut writers: BTreeMap<&str, Vec<TaskId>> = BTreeMap::new();
    for task in tasks {
        for (path, description) in &task.context.file_locations {
            let description = description.to_lowercase();
            if ["creat", "writ", "implement"]
                .iter()
                .any(|verb| description.contains(verb))
            {
                writers.entry(path.as_str()).or_default().push(task.id.clone());
            }
        }
    }

    writers
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(path, tasks)| FileConflict {
            path: path.to_string(),
            tasks,
        })
        .collect()
}
