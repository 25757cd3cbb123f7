//! Session lifecycle events and the external status hook.

use crate::core::task::TaskId;
use crate::orchestration::pool::WorkerId;
use crate::orchestration::result::TaskResult;
use crate::orchestration::session::SessionId;
use async_trait::async_trait;
use serde::Serialize;

/// Broadcast to every orchestrator subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    SessionStarted {
        session_id: SessionId,
        total_tasks: usize,
        total_layers: usize,
    },
    LayerStarted {
        session_id: SessionId,
        index: usize,
        task_count: usize,
    },
    LayerCompleted {
        session_id: SessionId,
        index: usize,
        success_rate: f64,
    },
    TaskStarted {
        session_id: SessionId,
        task_id: TaskId,
        worker_id: Option<WorkerId>,
    },
    TaskCompleted {
        session_id: SessionId,
        result: Box<TaskResult>,
    },
    TaskFailed {
        session_id: SessionId,
        result: Box<TaskResult>,
    },
    SessionCompleted {
        session_id: SessionId,
        successful_tasks: usize,
        total_tasks: usize,
        duration_secs: f64,
    },
    SessionFailed {
        session_id: SessionId,
        successful_tasks: usize,
        failed_tasks: usize,
        cancelled_tasks: usize,
        errors: Vec<String>,
    },
    SessionPaused {
        session_id: SessionId,
    },
    SessionResumed {
        session_id: SessionId,
    },
    SessionCancelled {
        session_id: SessionId,
    },
}

impl ExecutionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionEvent::SessionStarted { .. } => "session_started",
            ExecutionEvent::LayerStarted { .. } => "layer_started",
            ExecutionEvent::LayerCompleted { .. } => "layer_completed",
            ExecutionEvent::TaskStarted { .. } => "task_started",
            ExecutionEvent::TaskCompleted { .. } => "task_completed",
            ExecutionEvent::TaskFailed { .. } => "task_failed",
            ExecutionEvent::SessionCompleted { .. } => "session_completed",
            ExecutionEvent::SessionFailed { .. } => "session_failed",
            ExecutionEvent::SessionPaused { .. } => "session_paused",
            ExecutionEvent::SessionResumed { .. } => "session_resumed",
            ExecutionEvent::SessionCancelled { .. } => "session_cancelled",
        }
    }

    pub fn session_id(&self) -> SessionId {
        match self {
            ExecutionEvent::SessionStarted { session_id, .. }
            | ExecutionEvent::LayerStarted { session_id, .. }
            | ExecutionEvent::LayerCompleted { session_id, .. }
            | ExecutionEvent::TaskStarted { session_id, .. }
            | ExecutionEvent::TaskCompleted { session_id, .. }
            | ExecutionEvent::TaskFailed { session_id, .. }
            | ExecutionEvent::SessionCompleted { session_id, .. }
            | ExecutionEvent::SessionFailed { session_id, .. }
            | ExecutionEvent::SessionPaused { session_id }
            | ExecutionEvent::SessionResumed { session_id }
            | ExecutionEvent::SessionCancelled { session_id } => *session_id,
        }
    }
}

/// Status pushed to an external tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalStatus {
    Doing,
    Done,
}

/// Optional hook notified when tasks start and finish.
///
/// Failures are logged and never affect execution.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn notify(&self, task_id: &TaskId, status: ExternalStatus) -> Result<(), String>;
}
