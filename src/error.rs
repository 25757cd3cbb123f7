use thiserror::Error;

use crate::core::task::TaskId;
use crate::orchestration::pool::WorkerId;
use crate::orchestration::session::SessionId;

/// Errors raised while building or layering the dependency graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Invalid task {task_id}: {reason}")]
    InvalidTask { task_id: String, reason: String },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Invalid dependency: {from} -> {to} references a task outside the task set")]
    UnknownTask { from: TaskId, to: TaskId },

    #[error("Circular dependency detected: {}", format_cycle(.cycle))]
    CircularDependency { cycle: Vec<TaskId> },

    #[error("Cannot create execution layers, no ready tasks among: {}", format_ids(.remaining))]
    NoReadyFrontier { remaining: Vec<TaskId> },
}

/// Errors raised by the worker pool coordinator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("No workers available (capacity: {capacity}, busy: {busy})")]
    Exhausted { capacity: usize, busy: usize },

    #[error("Worker pool has no workers")]
    Empty,

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Worker {worker_id} is not assigned to session {session_id}")]
    NotAssigned {
        worker_id: WorkerId,
        session_id: SessionId,
    },
}

/// Errors describing a broken orchestration invariant or a bad control request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestrationError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Dependency not satisfied: task {task_id} depends on {dependency} which has not completed")]
    UnsatisfiedDependency { task_id: TaskId, dependency: TaskId },

    #[error("Execution graph contains no tasks")]
    EmptyGraph,
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("No home directory")]
    NoHomeDir,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Orchestration error: {0}")]
    Orchestration(#[from] OrchestrationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_ids(ids: &[TaskId]) -> String {
    ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
}
