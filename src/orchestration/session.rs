//! Execution session state with transition validation.
//!
//! A `Session` tracks one run of an `ExecutionGraph`. State changes go
//! through `transition`, which enforces the lifecycle:
//!
//! Initializing -> Ready -> Executing <-> Paused -> Completed | Failed
//!
//! Any non-terminal state may move to Cancelled.

use crate::core::layering::ExecutionGraph;
use crate::core::task::TaskId;
use crate::error::OrchestrationError;
use crate::orchestration::monitor::ExecutionMetrics;
use crate::orchestration::result::{TaskResult, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Initializing,
    Ready,
    Executing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    pub fn can_transition(&self, target: SessionState) -> bool {
        if target == SessionState::Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, target),
            (SessionState::Initializing, SessionState::Ready)
                | (SessionState::Ready, SessionState::Executing)
                | (SessionState::Executing, SessionState::Paused)
                | (SessionState::Paused, SessionState::Executing)
                | (SessionState::Executing, SessionState::Completed)
                | (SessionState::Executing, SessionState::Failed)
                | (SessionState::Paused, SessionState::Failed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Executing => "executing",
            SessionState::Paused => "paused",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// A record of a state transition with timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub state: SessionState,
    pub entered_at: DateTime<Utc>,
}

/// Mutable bookkeeping for one run.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub graph: Arc<ExecutionGraph>,
    state: SessionState,
    pub started_at: DateTime<Utc>,
    pub current_layer: usize,
    pub completed: HashSet<TaskId>,
    pub failed: HashSet<TaskId>,
    pub running: HashSet<TaskId>,
    results: HashMap<TaskId, TaskResult>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metadata: HashMap<String, String>,
    state_history: Vec<StateHistoryEntry>,
}

impl Session {
    pub fn new(id: SessionId, graph: Arc<ExecutionGraph>) -> Self {
        Self {
            id,
            graph,
            state: SessionState::Initializing,
            started_at: Utc::now(),
            current_layer: 0,
            completed: HashSet::new(),
            failed: HashSet::new(),
            running: HashSet::new(),
            results: HashMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            metadata: HashMap::new(),
            state_history: vec![StateHistoryEntry {
                state: SessionState::Initializing,
                entered_at: Utc::now(),
            }],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `target`, recording it in the history.
    pub fn transition(&mut self, target: SessionState) -> Result<(), OrchestrationError> {
        if !self.state.can_transition(target) {
            return Err(OrchestrationError::InvalidTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }
        self.state = target;
        self.state_history.push(StateHistoryEntry {
            state: target,
            entered_at: Utc::now(),
        });
        Ok(())
    }

    pub fn state_history(&self) -> &[StateHistoryEntry] {
        &self.state_history
    }

    pub fn mark_running(&mut self, task_id: &TaskId) {
        self.running.insert(task_id.clone());
    }

    /// Store the final result for a task.
    ///
    /// Returns `false` and keeps the first result if the task already has one.
    pub fn record_result(&mut self, result: TaskResult) -> bool {
        if self.results.contains_key(&result.task_id) {
            return false;
        }
        self.running.remove(&result.task_id);
        if result.is_successful() {
            self.completed.insert(result.task_id.clone());
        } else if result.status != TaskStatus::Cancelled {
            self.failed.insert(result.task_id.clone());
        }
        self.results.insert(result.task_id.clone(), result);
        true
    }

    pub fn result(&self, task_id: &TaskId) -> Option<&TaskResult> {
        self.results.get(task_id)
    }

    pub fn has_result(&self, task_id: &TaskId) -> bool {
        self.results.contains_key(task_id)
    }

    /// Results in layer order, then within-layer order.
    pub fn ordered_results(&self) -> Vec<TaskResult> {
        self.graph
            .tasks()
            .filter_map(|t| self.results.get(&t.id).cloned())
            .collect()
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.graph.total_tasks == 0 {
            return 0.0;
        }
        (self.completed.len() + self.failed.len()) as f64 / self.graph.total_tasks as f64 * 100.0
    }

    pub fn snapshot(&self, metrics: Option<ExecutionMetrics>) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            state: self.state,
            current_layer: self.current_layer,
            total_layers: self.graph.layer_count(),
            total_tasks: self.graph.total_tasks,
            completed_tasks: self.completed.len(),
            failed_tasks: self.failed.len(),
            running_tasks: self.running.len(),
            elapsed_secs: (Utc::now() - self.started_at).num_milliseconds().max(0) as f64 / 1000.0,
            progress_percentage: self.progress_percentage(),
            metrics,
        }
    }
}

/// Point-in-time view returned by `Orchestrator::status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub state: SessionState,
    pub current_layer: usize,
    pub total_layers: usize,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub running_tasks: usize,
    pub elapsed_secs: f64,
    pub progress_percentage: f64,
    pub metrics: Option<ExecutionMetrics>,
}
