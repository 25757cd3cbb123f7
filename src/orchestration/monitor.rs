//! Execution monitor.
//!
//! Each monitored session gets a sampling loop that snapshots
//! `ExecutionMetrics` into a bounded history and evaluates threshold alerts.
//! Task lifecycle events feed per-task timelines, raise failure alerts and
//! schedule a one-shot long-running check.
//!
//! Alerts go to the session's alert log, the broadcast channel, every
//! registered callback, and the log at `warn`. A callback that errors or
//! panics is logged and skipped.

use crate::config::MonitoringSettings;
use crate::core::task::TaskId;
use crate::orchestration::pool::WorkerId;
use crate::orchestration::session::SessionId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ALERT_CHANNEL_CAPACITY: usize = 256;

/// Completion rate at or above which a finished session counts as successful.
const SUCCESSFUL_SESSION_COMPLETION: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowCompletionRate,
    HighFailureRate,
    LowWorkerUtilization,
    TaskFailure,
    LongRunningTask,
}

impl AlertKind {
    pub fn severity(&self) -> AlertSeverity {
        match self {
            AlertKind::HighFailureRate | AlertKind::TaskFailure => AlertSeverity::High,
            AlertKind::LowCompletionRate | AlertKind::LowWorkerUtilization | AlertKind::LongRunningTask => {
                AlertSeverity::Medium
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Medium,
    High,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Medium => write!(f, "medium"),
            AlertSeverity::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub session_id: SessionId,
    pub task_id: Option<TaskId>,
    pub message: String,
    /// The measurement that tripped the alert.
    pub value: f64,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    fn new(kind: AlertKind, session_id: SessionId, message: String, value: f64) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            session_id,
            task_id: None,
            message,
            value,
            raised_at: Utc::now(),
        }
    }

    fn for_task(mut self, task_id: &TaskId) -> Self {
        self.task_id = Some(task_id.clone());
        self
    }
}

/// Alert callback. Errors are logged, never propagated.
pub type AlertCallback = Arc<dyn Fn(&Alert) -> Result<(), String> + Send + Sync>;

/// Task lifecycle events fed by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Started { worker_id: Option<WorkerId> },
    Completed,
    Failed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineStatus {
    Running,
    Completed,
    Failed,
}

/// One task's observed lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskTimeline {
    pub task_id: TaskId,
    pub worker_id: Option<WorkerId>,
    pub status: TimelineStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub error: Option<String>,
}

/// Point-in-time execution metrics for a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionMetrics {
    pub session_id: SessionId,
    pub sampled_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub running_tasks: usize,
    pub pending_tasks: usize,
    pub tasks_per_minute: f64,
    pub average_task_duration_secs: Option<f64>,
    pub completion_rate: f64,
    /// Distinct workers that have taken a task in this session.
    pub active_workers: usize,
    /// Running tasks per active worker, capped at 1.
    pub worker_utilization: f64,
    pub quality_gates_passed: usize,
    pub quality_gates_failed: usize,
}

impl ExecutionMetrics {
    pub fn failure_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.failed_tasks as f64 / self.total_tasks as f64
    }
}

/// Statistics across every session this monitor has tracked.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GlobalMetrics {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub successful_sessions: usize,
    pub failed_sessions: usize,
    pub total_tasks_executed: usize,
    pub average_session_duration_secs: f64,
}

#[derive(Debug)]
struct TimelineEntry {
    worker_id: Option<WorkerId>,
    status: TimelineStatus,
    started: Instant,
    started_at: DateTime<Utc>,
    finished: Option<Instant>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl TimelineEntry {
    fn duration(&self) -> Option<Duration> {
        self.finished.map(|end| end.duration_since(self.started))
    }
}

struct SessionMonitor {
    total_tasks: usize,
    started: Instant,
    timelines: HashMap<TaskId, TimelineEntry>,
    /// Insertion order of `timelines`.
    order: Vec<TaskId>,
    alerts: Vec<Alert>,
    history: VecDeque<ExecutionMetrics>,
    /// Threshold alerts currently tripped; each fires once until it clears.
    tripped: HashSet<AlertKind>,
    quality_passed: usize,
    quality_failed: usize,
    cancel: CancellationToken,
}

impl SessionMonitor {
    fn new(total_tasks: usize, history_capacity: usize) -> Self {
        Self {
            total_tasks,
            started: Instant::now(),
            timelines: HashMap::new(),
            order: Vec::new(),
            alerts: Vec::new(),
            history: VecDeque::with_capacity(history_capacity),
            tripped: HashSet::new(),
            quality_passed: 0,
            quality_failed: 0,
            cancel: CancellationToken::new(),
        }
    }

    fn metrics(&self, session_id: SessionId) -> ExecutionMetrics {
        let elapsed = self.started.elapsed().as_secs_f64();
        let count = |status: TimelineStatus| self.timelines.values().filter(|t| t.status == status).count();
        let completed = count(TimelineStatus::Completed);
        let failed = count(TimelineStatus::Failed);
        let running = count(TimelineStatus::Running);

        let durations: Vec<f64> = self
            .timelines
            .values()
            .filter(|t| t.status == TimelineStatus::Completed)
            .filter_map(|t| t.duration().map(|d| d.as_secs_f64()))
            .collect();
        let active_workers = self
            .timelines
            .values()
            .filter_map(|t| t.worker_id)
            .collect::<HashSet<_>>()
            .len();

        ExecutionMetrics {
            session_id,
            sampled_at: Utc::now(),
            elapsed_secs: elapsed,
            total_tasks: self.total_tasks,
            completed_tasks: completed,
            failed_tasks: failed,
            running_tasks: running,
            pending_tasks: self.total_tasks.saturating_sub(completed + failed + running),
            tasks_per_minute: if elapsed > 0.0 { completed as f64 / elapsed * 60.0 } else { 0.0 },
            average_task_duration_secs: (!durations.is_empty())
                .then(|| durations.iter().sum::<f64>() / durations.len() as f64),
            completion_rate: if self.total_tasks > 0 {
                completed as f64 / self.total_tasks as f64
            } else {
                0.0
            },
            active_workers,
            worker_utilization: if active_workers > 0 {
                (running as f64 / active_workers as f64).min(1.0)
            } else {
                0.0
            },
            quality_gates_passed: self.quality_passed,
            quality_gates_failed: self.quality_failed,
        }
    }

    /// Raise each threshold alert on the sample where it first trips.
    fn evaluate(&mut self, settings: &MonitoringSettings, metrics: &ExecutionMetrics) -> Vec<Alert> {
        let session_id = metrics.session_id;
        let checks = [
            (
                AlertKind::LowCompletionRate,
                metrics.completion_rate < settings.min_completion_rate
                    && metrics.elapsed_secs > settings.min_completion_elapsed_secs as f64,
                metrics.completion_rate,
                format!(
                    "Completion rate {:.1}% below threshold",
                    metrics.completion_rate * 100.0
                ),
            ),
            (
                AlertKind::HighFailureRate,
                metrics.failure_rate() > settings.max_failure_rate,
                metrics.failure_rate(),
                format!("Failure rate {:.1}% exceeds threshold", metrics.failure_rate() * 100.0),
            ),
            (
                AlertKind::LowWorkerUtilization,
                metrics.worker_utilization < settings.min_worker_utilization && metrics.active_workers > 0,
                metrics.worker_utilization,
                format!(
                    "Worker utilization {:.1}% below threshold",
                    metrics.worker_utilization * 100.0
                ),
            ),
        ];

        let mut raised = Vec::new();
        for (kind, tripped, value, message) in checks {
            if !tripped {
                self.tripped.remove(&kind);
            } else if self.tripped.insert(kind) {
                raised.push(Alert::new(kind, session_id, message, value));
            }
        }
        self.alerts.extend(raised.iter().cloned());
        raised
    }
}

struct MonitorInner {
    settings: MonitoringSettings,
    sessions: RwLock<HashMap<SessionId, SessionMonitor>>,
    global: Mutex<GlobalMetrics>,
    callbacks: RwLock<Vec<AlertCallback>>,
    alert_tx: broadcast::Sender<Alert>,
}

/// Cheaply cloneable handle to the shared monitor state.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl Monitor {
    pub fn new(settings: MonitoringSettings) -> Self {
        let (alert_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(MonitorInner {
                settings,
                sessions: RwLock::new(HashMap::new()),
                global: Mutex::new(GlobalMetrics::default()),
                callbacks: RwLock::new(Vec::new()),
                alert_tx,
            }),
        }
    }

    pub fn settings(&self) -> &MonitoringSettings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.inner.alert_tx.subscribe()
    }

    pub async fn register_callback<F>(&self, callback: F)
    where
        F: Fn(&Alert) -> Result<(), String> + Send + Sync + 'static,
    {
        self.inner.callbacks.write().await.push(Arc::new(callback));
    }

    /// Begin tracking a session and spawn its sampling loop.
    ///
    /// Starting an already-tracked session is a no-op.
    pub async fn start_session(&self, session_id: SessionId, total_tasks: usize) {
        let cancel = {
            let mut sessions = self.inner.sessions.write().await;
            if sessions.contains_key(&session_id) {
                return;
            }
            let monitor = SessionMonitor::new(total_tasks, self.inner.settings.history_capacity);
            let cancel = monitor.cancel.clone();
            sessions.insert(session_id, monitor);
            cancel
        };
        {
            let mut global = self.inner.global.lock().await;
            global.total_sessions += 1;
            global.active_sessions += 1;
        }

        info!(session = %session_id.short(), total_tasks, "Monitoring started");
        self.spawn_sampler(session_id, cancel);
    }

    fn spawn_sampler(&self, session_id: SessionId, cancel: CancellationToken) {
        let monitor = self.clone();
        let period = Duration::from_secs(self.inner.settings.interval_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(session = %session_id.short(), "Monitor sampler cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        monitor.sample(session_id).await;
                    }
                }
            }
        });
    }

    async fn sample(&self, session_id: SessionId) {
        let alerts = {
            let mut sessions = self.inner.sessions.write().await;
            let Some(session) = sessions.get_mut(&session_id) else {
                return;
            };
            let metrics = session.metrics(session_id);
            if session.history.len() >= self.inner.settings.history_capacity {
                session.history.pop_front();
            }
            session.history.push_back(metrics.clone());
            session.evaluate(&self.inner.settings, &metrics)
        };
        for alert in alerts {
            self.fire(alert).await;
        }
    }

    /// Feed a task lifecycle event. Unknown sessions are ignored.
    pub async fn record_task_event(&self, session_id: SessionId, task_id: &TaskId, event: TaskEvent) {
        let mut alert = None;
        let mut long_running_check = None;
        {
            let mut sessions = self.inner.sessions.write().await;
            let Some(session) = sessions.get_mut(&session_id) else {
                return;
            };

            match event {
                TaskEvent::Started { worker_id } => {
                    if !session.timelines.contains_key(task_id) {
                        session.order.push(task_id.clone());
                    }
                    session.timelines.insert(
                        task_id.clone(),
                        TimelineEntry {
                            worker_id,
                            status: TimelineStatus::Running,
                            started: Instant::now(),
                            started_at: Utc::now(),
                            finished: None,
                            finished_at: None,
                            error: None,
                        },
                    );
                    long_running_check = Some(session.cancel.clone());
                }
                TaskEvent::Completed => {
                    if let Some(entry) = session.timelines.get_mut(task_id) {
                        entry.status = TimelineStatus::Completed;
                        entry.finished = Some(Instant::now());
                        entry.finished_at = Some(Utc::now());
                    }
                }
                TaskEvent::Failed { error } => {
                    // Tasks can fail before a worker is assigned.
                    if !session.timelines.contains_key(task_id) {
                        session.order.push(task_id.clone());
                    }
                    let now = Instant::now();
                    let entry = session.timelines.entry(task_id.clone()).or_insert_with(|| TimelineEntry {
                        worker_id: None,
                        status: TimelineStatus::Running,
                        started: now,
                        started_at: Utc::now(),
                        finished: None,
                        finished_at: None,
                        error: None,
                    });
                    entry.status = TimelineStatus::Failed;
                    entry.finished = Some(now);
                    entry.finished_at = Some(Utc::now());
                    entry.error = Some(error.clone());
                    let failure = Alert::new(
                        AlertKind::TaskFailure,
                        session_id,
                        format!("Task {} failed: {}", task_id, error),
                        1.0,
                    )
                    .for_task(task_id);
                    session.alerts.push(failure.clone());
                    alert = Some(failure);
                }
            }
        }

        if let Some(alert) = alert {
            self.fire(alert).await;
        }
        if let Some(cancel) = long_running_check {
            self.spawn_long_running_check(session_id, task_id.clone(), cancel);
        }
    }

    /// Count one quality validation outcome.
    pub async fn record_quality(&self, session_id: SessionId, passed: bool) {
        if let Some(session) = self.inner.sessions.write().await.get_mut(&session_id) {
            if passed {
                session.quality_passed += 1;
            } else {
                session.quality_failed += 1;
            }
        }
    }

    fn spawn_long_running_check(&self, session_id: SessionId, task_id: TaskId, cancel: CancellationToken) {
        let monitor = self.clone();
        let deadline = Instant::now() + Duration::from_secs(self.inner.settings.max_task_duration_secs);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    monitor.check_long_running(session_id, &task_id).await;
                }
            }
        });
    }

    async fn check_long_running(&self, session_id: SessionId, task_id: &TaskId) {
        let alert = {
            let mut sessions = self.inner.sessions.write().await;
            let Some(session) = sessions.get_mut(&session_id) else {
                return;
            };
            let Some(entry) = session.timelines.get(task_id) else {
                return;
            };
            if entry.status != TimelineStatus::Running {
                return;
            }
            let running_for = entry.started.elapsed().as_secs_f64();
            let alert = Alert::new(
                AlertKind::LongRunningTask,
                session_id,
                format!("Task {} running for {:.1} seconds", task_id, running_for),
                running_for,
            )
            .for_task(task_id);
            session.alerts.push(alert.clone());
            alert
        };
        self.fire(alert).await;
    }

    async fn fire(&self, alert: Alert) {
        warn!(
            session = %alert.session_id.short(),
            kind = ?alert.kind,
            severity = %alert.severity,
            "ALERT: {}",
            alert.message
        );
        let _ = self.inner.alert_tx.send(alert.clone());

        let callbacks = self.inner.callbacks.read().await.clone();
        for callback in callbacks {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(&alert))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Alert callback failed"),
                Err(_) => error!("Alert callback panicked"),
            }
        }
    }

    /// Stop tracking a session and fold it into the global statistics.
    ///
    /// Returns the final metrics, or `None` for an unknown session.
    pub async fn stop_session(&self, session_id: SessionId) -> Option<ExecutionMetrics> {
        let session = self.inner.sessions.write().await.remove(&session_id)?;
        session.cancel.cancel();
        let final_metrics = session.metrics(session_id);

        let mut global = self.inner.global.lock().await;
        global.active_sessions = global.active_sessions.saturating_sub(1);
        if final_metrics.completion_rate >= SUCCESSFUL_SESSION_COMPLETION {
            global.successful_sessions += 1;
        } else {
            global.failed_sessions += 1;
        }
        global.total_tasks_executed += final_metrics.completed_tasks;
        let finished = (global.successful_sessions + global.failed_sessions) as f64;
        global.average_session_duration_secs +=
            (final_metrics.elapsed_secs - global.average_session_duration_secs) / finished;

        info!(
            session = %session_id.short(),
            completed = final_metrics.completed_tasks,
            failed = final_metrics.failed_tasks,
            "Monitoring stopped"
        );
        Some(final_metrics)
    }

    pub async fn session_metrics(&self, session_id: SessionId) -> Option<ExecutionMetrics> {
        self.inner
            .sessions
            .read()
            .await
            .get(&session_id)
            .map(|s| s.metrics(session_id))
    }

    pub async fn session_alerts(&self, session_id: SessionId) -> Vec<Alert> {
        self.inner
            .sessions
            .read()
            .await
            .get(&session_id)
            .map(|s| s.alerts.clone())
            .unwrap_or_default()
    }

    /// Task timelines in the order tasks started.
    pub async fn timeline(&self, session_id: SessionId) -> Vec<TaskTimeline> {
        let sessions = self.inner.sessions.read().await;
        let Some(session) = sessions.get(&session_id) else {
            return Vec::new();
        };
        session
            .order
            .iter()
            .filter_map(|id| {
                session.timelines.get(id).map(|entry| TaskTimeline {
                    task_id: id.clone(),
                    worker_id: entry.worker_id,
                    status: entry.status,
                    started_at: entry.started_at,
                    finished_at: entry.finished_at,
                    duration_secs: entry.duration().map(|d| d.as_secs_f64()),
                    error: entry.error.clone(),
                })
            })
            .collect()
    }

    /// Sampled metrics, oldest first.
    pub async fn history(&self, session_id: SessionId) -> Vec<ExecutionMetrics> {
        self.inner
            .sessions
            .read()
            .await
            .get(&session_id)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn global_metrics(&self) -> GlobalMetrics {
        self.inner.global.lock().await.clone()
    }

    pub async fn is_monitoring(&self, session_id: SessionId) -> bool {
        self.inner.sessions.read().await.contains_key(&session_id)
    }
}
