//! Execution layering.
//!
//! Converts a validated `DependencyGraph` into ordered execution layers with
//! Kahn's algorithm over blocking edges. Every layer is the complete ready
//! frontier at that step, so all of its tasks can run concurrently.

use crate::core::graph::{DependencyGraph, GraphBuilder};
use crate::core::task::{Task, TaskId};
use crate::error::GraphError;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

/// One batch of tasks that may run concurrently.
#[derive(Debug, Clone)]
pub struct ExecutionLayer {
    pub index: usize,
    pub tasks: Vec<Task>,
    /// Longest task estimate in the layer, in minutes.
    pub estimated_duration_minutes: u32,
    /// Blocking prerequisites, from earlier layers, of the tasks in this layer.
    pub dependencies_satisfied: Vec<TaskId>,
}

impl ExecutionLayer {
    fn new(index: usize, tasks: Vec<Task>, graph: &DependencyGraph) -> Self {
        let estimated_duration_minutes = tasks
            .iter()
            .map(Task::duration_minutes)
            .max()
            .unwrap_or(0);
        let dependencies_satisfied: BTreeSet<TaskId> = tasks
            .iter()
            .flat_map(|t| graph.blocking_dependencies_of(&t.id))
            .collect();

        Self {
            index,
            tasks,
            estimated_duration_minutes,
            dependencies_satisfied: dependencies_satisfied.into_iter().collect(),
        }
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// A dependency graph plus its layers and derived metrics.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    pub dependency_graph: DependencyGraph,
    pub layers: Vec<ExecutionLayer>,
    pub total_tasks: usize,
    /// Mean tasks per layer, capped at `total_tasks`.
    pub parallelization_factor: f64,
    /// Sum of layer durations, in minutes.
    pub estimated_duration_minutes: u64,
}

/// Timing view of a single layer.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledLayer {
    pub index: usize,
    pub task_ids: Vec<TaskId>,
    pub task_count: usize,
    pub estimated_duration_minutes: u32,
    pub start_minutes: u64,
    pub end_minutes: u64,
    pub dependencies_satisfied: Vec<TaskId>,
}

/// Serializable schedule with cumulative start and end offsets.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSchedule {
    pub total_layers: usize,
    pub total_tasks: usize,
    pub parallelization_factor: f64,
    pub estimated_duration_minutes: u64,
    pub layers: Vec<ScheduledLayer>,
}

/// Structural checks on a built execution graph.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphValidation {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl ExecutionGraph {
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_tasks == 0
    }

    /// Index of the layer holding `id`.
    pub fn layer_of(&self, id: &TaskId) -> Option<usize> {
        self.layers
            .iter()
            .find(|layer| layer.tasks.iter().any(|t| &t.id == id))
            .map(|layer| layer.index)
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.layers
            .iter()
            .flat_map(|layer| layer.tasks.iter())
            .find(|t| &t.id == id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.layers.iter().flat_map(|layer| layer.tasks.iter())
    }

    /// Tasks that sit alone in their layer.
    pub fn sequential_tasks(&self) -> Vec<TaskId> {
        self.layers
            .iter()
            .filter(|layer| layer.len() == 1)
            .flat_map(|layer| layer.task_ids())
            .collect()
    }

    /// Tasks that share their layer with at least one other task.
    pub fn parallel_tasks(&self) -> Vec<TaskId> {
        self.layers
            .iter()
            .filter(|layer| layer.len() > 1)
            .flat_map(|layer| layer.task_ids())
            .collect()
    }

    /// Fraction of tasks that run alongside another task.
    pub fn parallel_share(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.parallel_tasks().len() as f64 / self.total_tasks as f64
    }

    pub fn schedule(&self) -> ExecutionSchedule {
        let mut cursor = 0u64;
        let layers = self
            .layers
            .iter()
            .map(|layer| {
                let start = cursor;
                cursor += u64::from(layer.estimated_duration_minutes);
                ScheduledLayer {
                    index: layer.index,
                    task_ids: layer.task_ids(),
                    task_count: layer.len(),
                    estimated_duration_minutes: layer.estimated_duration_minutes,
                    start_minutes: start,
                    end_minutes: cursor,
                    dependencies_satisfied: layer.dependencies_satisfied.clone(),
                }
            })
            .collect();

        ExecutionSchedule {
            total_layers: self.layers.len(),
            total_tasks: self.total_tasks,
            parallelization_factor: self.parallelization_factor,
            estimated_duration_minutes: self.estimated_duration_minutes,
            layers,
        }
    }

    /// Re-check layer membership and report parallelization quality.
    ///
    /// The efficiency thresholds apply to [`parallel_share`](Self::parallel_share).
    pub fn validate(&self) -> GraphValidation {
        let mut validation = GraphValidation {
            is_valid: true,
            ..Default::default()
        };

        if let Some(cycle) = self.dependency_graph.find_cycle() {
            validation.issues.push(format!(
                "Cycle detected: {}",
                cycle.iter().map(TaskId::as_str).collect::<Vec<_>>().join(" -> ")
            ));
        }

        let mut seen = HashSet::new();
        for task in self.tasks() {
            if !seen.insert(task.id.clone()) {
                validation
                    .issues
                    .push(format!("Task {} appears in multiple layers", task.id));
            }
        }
        for id in self.dependency_graph.task_ids() {
            if !seen.contains(&id) {
                validation
                    .issues
                    .push(format!("Task {} is missing from execution layers", id));
            }
        }

        for layer in &self.layers {
            for task in &layer.tasks {
                for dep in self.dependency_graph.blocking_dependencies_of(&task.id) {
                    if self.layer_of(&dep).map_or(true, |l| l >= layer.index) {
                        validation.issues.push(format!(
                            "Task {} is not layered after its dependency {}",
                            task.id, dep
                        ));
                    }
                }
            }
        }

        let share = self.parallel_share();
        if self.total_tasks > 0 && share < 0.5 {
            validation.warnings.push(format!(
                "Low parallelization ({:.0}% of tasks share a layer), consider reducing dependencies",
                share * 100.0
            ));
        } else if share >= 0.8 {
            validation.recommendations.push(format!(
                "Excellent parallelization ({:.0}% of tasks share a layer)",
                share * 100.0
            ));
        }

        validation.is_valid = validation.issues.is_empty();
        validation
    }
}

/// Layer `tasks` according to the blocking edges of `graph`.
///
/// Within a layer tasks are ordered longest first, then by priority, then by
/// id, which keeps the output deterministic.
///
/// # Errors
/// - `InvalidTask` when the graph references a task missing from `tasks`
/// - `NoReadyFrontier` when tasks remain but none is ready
pub fn layer(graph: DependencyGraph, tasks: &[Task]) -> Result<ExecutionGraph, GraphError> {
    let lookup: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();
    let ids = graph.task_ids();

    let mut in_degree: HashMap<TaskId, usize> = HashMap::with_capacity(ids.len());
    for id in &ids {
        if !lookup.contains_key(id) {
            return Err(GraphError::InvalidTask {
                task_id: id.to_string(),
                reason: "present in the graph but not in the task list".to_string(),
            });
        }
        in_degree.insert(id.clone(), graph.blocking_dependencies_of(id).len());
    }

    let mut layers: Vec<ExecutionLayer> = Vec::new();
    let mut remaining: BTreeSet<TaskId> = ids.iter().cloned().collect();

    while !remaining.is_empty() {
        let frontier: Vec<TaskId> = remaining
            .iter()
            .filter(|id| in_degree.get(*id).copied() == Some(0))
            .cloned()
            .collect();

        if frontier.is_empty() {
            return Err(GraphError::NoReadyFrontier {
                remaining: remaining.into_iter().collect(),
            });
        }

        for id in &frontier {
            remaining.remove(id);
            for dependent in graph.dependents_of(id) {
                let blocks = graph.blocking_dependencies_of(&dependent).contains(id);
                if let (true, Some(degree)) = (blocks, in_degree.get_mut(&dependent)) {
                    *degree = degree.saturating_sub(1);
                }
            }
        }

        let mut batch: Vec<Task> = frontier
            .iter()
            .filter_map(|id| lookup.get(id).map(|t| (*t).clone()))
            .collect();
        batch.sort_by(|a, b| {
            (Reverse(a.duration_minutes()), Reverse(a.priority), &a.id).cmp(&(
                Reverse(b.duration_minutes()),
                Reverse(b.priority),
                &b.id,
            ))
        });

        debug!(layer = layers.len(), tasks = batch.len(), "Formed execution layer");
        layers.push(ExecutionLayer::new(layers.len(), batch, &graph));
    }

    let total_tasks = ids.len();
    let parallelization_factor = if layers.is_empty() {
        0.0
    } else {
        let placed: usize = layers.iter().map(ExecutionLayer::len).sum();
        (placed as f64 / layers.len() as f64).min(total_tasks as f64)
    };
    let estimated_duration_minutes = layers
        .iter()
        .map(|l| u64::from(l.estimated_duration_minutes))
        .sum();

    info!(
        tasks = total_tasks,
        layers = layers.len(),
        parallelization_factor,
        "Built execution graph"
    );

    Ok(ExecutionGraph {
        dependency_graph: graph,
        layers,
        total_tasks,
        parallelization_factor,
        estimated_duration_minutes,
    })
}

/// Build and layer the graph using explicit dependencies only.
pub fn build_graph(tasks: &[Task]) -> Result<ExecutionGraph, GraphError> {
    build_graph_with(&GraphBuilder::new(), tasks)
}

/// Build and layer the graph with the given builder's inference strategies.
pub fn build_graph_with(builder: &GraphBuilder, tasks: &[Task]) -> Result<ExecutionGraph, GraphError> {
    let graph = builder.build(tasks)?;
    layer(graph, tasks)
}
