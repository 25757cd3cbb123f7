//! Core scheduling model.
//!
//! Tasks, the dependency graph built over them, the pluggable heuristics
//! that infer implicit dependencies, and the layering engine that turns a
//! validated graph into ordered parallel batches.

pub mod graph;
pub mod inference;
pub mod layering;
pub mod task;

pub use graph::{detect_conflicts, DependencyEdge, DependencyGraph, EdgeKind, FileConflict, GraphBuilder};
pub use inference::{DependencyStrategy, FileStrategy, KeywordStrategy, PhaseStrategy};
pub use layering::{
    build_graph, build_graph_with, layer, ExecutionGraph, ExecutionLayer, ExecutionSchedule,
    GraphValidation, ScheduledLayer,
};
pub use task::{load_tasks, QualityRequirements, Task, TaskContext, TaskId};
