//! Task and session execution results, plus the serializable report.

use crate::core::task::TaskId;
use crate::orchestration::pool::WorkerId;
use crate::orchestration::quality::{QualityGate, QualityResult};
use crate::orchestration::session::{SessionId, SessionState};
use crate::orchestration::worker::Artifacts;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum errors and warnings carried into a report.
const REPORT_ISSUE_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Why a task did not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorDetail {
    WorkerError { message: String },
    QualityGateFailure { failed_gates: Vec<QualityGate> },
    PoolExhausted { message: String },
    Timeout { timeout_secs: u64 },
    Panicked { message: String },
    Cancelled,
}

impl ErrorDetail {
    /// Retryable failures: worker errors, panics and timeouts.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorDetail::WorkerError { .. } | ErrorDetail::Panicked { .. } | ErrorDetail::Timeout { .. }
        )
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetail::WorkerError { message } => write!(f, "worker error: {}", message),
            ErrorDetail::QualityGateFailure { failed_gates } => {
                let names: Vec<String> = failed_gates.iter().map(ToString::to_string).collect();
                write!(f, "quality gates failed: {}", names.join(", "))
            }
            ErrorDetail::PoolExhausted { message } => write!(f, "no worker available: {}", message),
            ErrorDetail::Timeout { timeout_secs } => write!(f, "timed out after {}s", timeout_secs),
            ErrorDetail::Panicked { message } => write!(f, "worker panicked: {}", message),
            ErrorDetail::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker_id: Option<WorkerId>,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default)]
    pub summary: String,
    pub quality: Option<QualityResult>,
    pub error: Option<ErrorDetail>,
    /// Execution attempts, including the first.
    pub attempts: u32,
}

impl TaskResult {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            worker_id: None,
            artifacts: Artifacts::default(),
            summary: String::new(),
            quality: None,
            error: None,
            attempts: 0,
        }
    }

    /// A task that was never attempted.
    pub fn cancelled(task_id: TaskId) -> Self {
        let mut result = Self::new(task_id);
        result.finish(TaskStatus::Cancelled, Some(ErrorDetail::Cancelled));
        result
    }

    pub(crate) fn finish(&mut self, status: TaskStatus, error: Option<ErrorDetail>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<Duration> {
        self.finished_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }

    /// Completed, with no failed quality gate.
    pub fn is_successful(&self) -> bool {
        self.status == TaskStatus::Completed
            && self.quality.as_ref().map_or(true, QualityResult::all_gates_passed)
    }

    fn breakdown(&self) -> TaskBreakdown {
        TaskBreakdown {
            task_id: self.task_id.clone(),
            status: self.status,
            duration_secs: self.duration().map(|d| d.as_secs_f64()),
            successful: self.is_successful(),
            artifacts_created: self.artifacts.implementation.len() + self.artifacts.tests.len(),
            quality_score: self.quality.as_ref().map(|q| q.score),
            attempts: self.attempts,
            error: self.error.as_ref().map(ToString::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelStats {
    pub total_layers: usize,
    pub layers_executed: usize,
    pub parallelization_factor: f64,
    pub average_tasks_per_layer: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityDistribution {
    pub excellent: usize,
    pub good: usize,
    pub fair: usize,
    pub poor: usize,
}

/// Aggregate quality statistics over every task that was validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySummary {
    pub validated_tasks: usize,
    pub average_score: f64,
    pub all_gates_pass_rate: f64,
    pub tdd_pass_rate: f64,
    pub security_pass_rate: f64,
    pub tasks_with_all_gates_passed: usize,
    pub distribution: QualityDistribution,
}

impl QualitySummary {
    /// `None` when no task carries a quality result.
    pub fn from_results(results: &[TaskResult]) -> Option<Self> {
        let validated: Vec<&QualityResult> = results.iter().filter_map(|r| r.quality.as_ref()).collect();
        if validated.is_empty() {
            return None;
        }
        let n = validated.len() as f64;
        let rate = |pred: &dyn Fn(&QualityResult) -> bool| validated.iter().filter(|q| pred(q)).count() as f64 / n;

        let mut distribution = QualityDistribution::default();
        for q in &validated {
            match q.score {
                s if s >= 0.9 => distribution.excellent += 1,
                s if s >= 0.7 => distribution.good += 1,
                s if s >= 0.5 => distribution.fair += 1,
                _ => distribution.poor += 1,
            }
        }
        let tasks_with_all_gates_passed = validated.iter().filter(|q| q.all_gates_passed()).count();

        Some(Self {
            validated_tasks: validated.len(),
            average_score: validated.iter().map(|q| q.score).sum::<f64>() / n,
            all_gates_pass_rate: tasks_with_all_gates_passed as f64 / n,
            tdd_pass_rate: rate(&|q| q.tdd.meets_requirements),
            security_pass_rate: rate(&|q| q.security.meets_requirements),
            tasks_with_all_gates_passed,
            distribution,
        })
    }
}

/// Final outcome of a session run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub session_id: SessionId,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    /// Results in layer order.
    pub task_results: Vec<TaskResult>,
    pub parallel_stats: ParallelStats,
    pub quality_summary: Option<QualitySummary>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    pub(crate) fn tally(&mut self) {
        self.successful_tasks = self.task_results.iter().filter(|r| r.is_successful()).count();
        self.failed_tasks = self
            .task_results
            .iter()
            .filter(|r| r.status == TaskStatus::Failed)
            .count();
        self.cancelled_tasks = self
            .task_results
            .iter()
            .filter(|r| r.status == TaskStatus::Cancelled)
            .count();
        self.quality_summary = QualitySummary::from_results(&self.task_results);
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }

    /// Fraction of tasks that succeeded, in [0, 1].
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.successful_tasks as f64 / self.total_tasks as f64
    }

    pub fn average_task_duration(&self) -> Option<Duration> {
        let durations: Vec<Duration> = self.task_results.iter().filter_map(TaskResult::duration).collect();
        if durations.is_empty() {
            return None;
        }
        Some(durations.iter().sum::<Duration>() / durations.len() as u32)
    }

    /// Speedup over a sequential baseline, e.g. 3.0 for three times faster.
    pub fn parallel_efficiency(&self, sequential_baseline: Duration) -> Option<f64> {
        let actual = self.duration().as_secs_f64();
        if sequential_baseline.is_zero() || actual <= 0.0 {
            return None;
        }
        Some(sequential_baseline.as_secs_f64() / actual)
    }

    pub fn is_successful(&self) -> bool {
        self.failed_tasks == 0 && self.successful_tasks == self.total_tasks && self.errors.is_empty()
    }

    pub fn result_for(&self, task_id: &TaskId) -> Option<&TaskResult> {
        self.task_results.iter().find(|r| &r.task_id == task_id)
    }

    pub fn report(&self) -> ExecutionReport {
        ExecutionReport {
            overview: ReportOverview {
                session_id: self.session_id,
                state: self.state,
                duration_secs: self.duration().as_secs_f64(),
                total_tasks: self.total_tasks,
                success_rate: self.success_rate(),
                successful_tasks: self.successful_tasks,
                failed_tasks: self.failed_tasks,
                cancelled_tasks: self.cancelled_tasks,
            },
            performance: ReportPerformance {
                average_task_duration_secs: self.average_task_duration().map(|d| d.as_secs_f64()),
                parallel_stats: self.parallel_stats.clone(),
            },
            quality: self.quality_summary.clone(),
            issues: ReportIssues {
                total_errors: self.errors.len(),
                total_warnings: self.warnings.len(),
                errors: self.errors.iter().take(REPORT_ISSUE_LIMIT).cloned().collect(),
                warnings: self.warnings.iter().take(REPORT_ISSUE_LIMIT).cloned().collect(),
            },
            tasks: self.task_results.iter().map(TaskResult::breakdown).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportOverview {
    pub session_id: SessionId,
    pub state: SessionState,
    pub duration_secs: f64,
    pub total_tasks: usize,
    pub success_rate: f64,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportPerformance {
    pub average_task_duration_secs: Option<f64>,
    pub parallel_stats: ParallelStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportIssues {
    pub total_errors: usize,
    pub total_warnings: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskBreakdown {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub duration_secs: Option<f64>,
    pub successful: bool,
    pub artifacts_created: usize,
    pub quality_score: Option<f64>,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub overview: ReportOverview,
    pub performance: ReportPerformance,
    pub quality: Option<QualitySummary>,
    pub issues: ReportIssues,
    pub tasks: Vec<TaskBreakdown>,
}
