//! Session orchestrator.
//!
//! Runs an `ExecutionGraph` layer by layer. Every task in a layer is fanned
//! out with `join_all` and admission is bounded by a per-session semaphore
//! sized to the pool's capacity. A layer must fully finish before the next
//! one starts.

use crate::config::ExecutionConfig;
use crate::core::layering::{ExecutionGraph, ExecutionLayer};
use crate::core::task::{Task, TaskId};
use crate::error::{OrchestrationError, PoolError};
use crate::orchestration::events::{ExecutionEvent, ExternalStatus, StatusSink};
use crate::orchestration::monitor::{Monitor, TaskEvent};
use crate::orchestration::pool::{WorkerLease, WorkerPool};
use crate::orchestration::quality::QualityGateEngine;
use crate::orchestration::result::{ErrorDetail, ExecutionResult, ParallelStats, TaskResult, TaskStatus};
use crate::orchestration::session::{Session, SessionId, SessionSnapshot, SessionState};
use crate::orchestration::worker::WorkerOutput;
use crate::Result;
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Use this id instead of generating one, so callers can control the
    /// session while `run` is in flight.
    pub session_id: Option<SessionId>,
    pub metadata: HashMap<String, String>,
}

impl RunOptions {
    pub fn with_session_id(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone)]
struct SessionEntry {
    session: Arc<RwLock<Session>>,
    pause_tx: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
}

enum LayerOutcome {
    Continue,
    /// Stop the layer loop. `executed` is whether this layer's tasks ran.
    Stop { executed: bool },
}

/// Everything a running task needs from its session.
struct SessionContext {
    id: SessionId,
    graph: Arc<ExecutionGraph>,
    session: Arc<RwLock<Session>>,
    pause_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
}

pub struct Orchestrator {
    pool: Arc<WorkerPool>,
    config: ExecutionConfig,
    quality: Option<QualityGateEngine>,
    monitor: Option<Monitor>,
    status_sink: Option<Arc<dyn StatusSink>>,
    sessions: Arc<RwLock<HashMap<SessionId, SessionEntry>>>,
    events: broadcast::Sender<ExecutionEvent>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("quality", &self.quality.is_some())
            .field("monitor", &self.monitor.is_some())
            .field("status_sink", &self.status_sink.is_some())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(pool: Arc<WorkerPool>, config: ExecutionConfig) -> Self {
        let quality = config
            .quality
            .enabled
            .then(|| QualityGateEngine::new(config.quality.clone()));
        let monitor = config
            .monitoring
            .enabled
            .then(|| Monitor::new(config.monitoring.clone()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            pool,
            config,
            quality,
            monitor,
            status_sink: None,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    /// Replace the monitor built from config, e.g. to share one across orchestrators.
    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn monitor(&self) -> Option<&Monitor> {
        self.monitor.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ExecutionEvent) {
        debug!(event = event.kind(), session = %event.session_id().short(), "Execution event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Execute every task in `graph`.
    ///
    /// Task failures, early stops, dependency violations and cancellation are
    /// all reported through the returned `ExecutionResult`.
    ///
    /// # Errors
    /// - `EmptyGraph` when the graph has no tasks
    /// - `PoolError::Empty` when the pool has no workers
    pub async fn run(&self, graph: ExecutionGraph, options: RunOptions) -> Result<ExecutionResult> {
        if graph.is_empty() {
            return Err(OrchestrationError::EmptyGraph.into());
        }
        if self.pool.worker_count().await == 0 {
            return Err(PoolError::Empty.into());
        }

        let graph = Arc::new(graph);
        let session_id = options.session_id.unwrap_or_default();
        let mut session = Session::new(session_id, Arc::clone(&graph));
        session.metadata = options.metadata;
        session.transition(SessionState::Ready)?;

        let (pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let session = Arc::new(RwLock::new(session));
        self.sessions.write().await.insert(
            session_id,
            SessionEntry {
                session: Arc::clone(&session),
                pause_tx: Arc::new(pause_tx),
                cancel: cancel.clone(),
            },
        );

        let capacity = self.pool.total_capacity().await.max(1);
        info!(
            session = %session_id.short(),
            tasks = graph.total_tasks,
            layers = graph.layer_count(),
            capacity,
            "Starting execution session"
        );
        self.emit(ExecutionEvent::SessionStarted {
            session_id,
            total_tasks: graph.total_tasks,
            total_layers: graph.layer_count(),
        });
        if let Some(monitor) = &self.monitor {
            monitor.start_session(session_id, graph.total_tasks).await;
        }

        let ctx = SessionContext {
            id: session_id,
            graph: Arc::clone(&graph),
            session,
            pause_rx,
            cancel,
            permits: Arc::new(Semaphore::new(capacity)),
        };

        let executing = ctx.session.write().await.transition(SessionState::Executing).is_ok();
        let mut layers_executed = 0;
        if executing {
            for layer in &graph.layers {
                match self.run_layer(&ctx, layer).await {
                    LayerOutcome::Continue => layers_executed += 1,
                    LayerOutcome::Stop { executed } => {
                        layers_executed += usize::from(executed);
                        break;
                    }
                }
            }
        }

        Ok(self.finish(&ctx, layers_executed).await)
    }

    async fn run_layer(&self, ctx: &SessionContext, layer: &ExecutionLayer) -> LayerOutcome {
        if !wait_while_paused(ctx).await {
            return LayerOutcome::Stop { executed: false };
        }

        {
            let mut session = ctx.session.write().await;
            if let Some(violation) = unsatisfied_dependency(&session, layer) {
                error!(session = %ctx.id.short(), layer = layer.index, %violation, "Dependency check failed");
                session.errors.push(violation.to_string());
                return LayerOutcome::Stop { executed: false };
            }
            session.current_layer = layer.index;
        }

        let pending: Vec<&Task> = {
            let session = ctx.session.read().await;
            layer
                .tasks
                .iter()
                .filter(|t| !session.completed.contains(&t.id))
                .collect()
        };
        info!(session = %ctx.id.short(), layer = layer.index, tasks = pending.len(), "Executing layer");
        self.emit(ExecutionEvent::LayerStarted {
            session_id: ctx.id,
            index: layer.index,
            task_count: pending.len(),
        });

        let outcomes = join_all(pending.iter().map(|task| async move {
            let outcome = AssertUnwindSafe(self.run_task(ctx, task)).catch_unwind().await;
            (*task, outcome)
        }))
        .await;

        for (task, outcome) in outcomes {
            if let Err(panic) = outcome {
                let message = panic_message(panic.as_ref());
                error!(task_id = %task.id, %message, "Task execution panicked");
                let mut result = TaskResult::new(task.id.clone());
                result.finish(TaskStatus::Failed, Some(ErrorDetail::Panicked { message }));
                self.finalize(ctx, result).await;
            }
        }

        let success_rate = {
            let session = ctx.session.read().await;
            let succeeded = layer.tasks.iter().filter(|t| session.completed.contains(&t.id)).count();
            succeeded as f64 / layer.len().max(1) as f64
        };
        info!(session = %ctx.id.short(), layer = layer.index, success_rate, "Layer complete");
        self.emit(ExecutionEvent::LayerCompleted {
            session_id: ctx.id,
            index: layer.index,
            success_rate,
        });

        if ctx.cancel.is_cancelled() {
            return LayerOutcome::Stop { executed: true };
        }
        let threshold = self.config.execution.continuation_threshold;
        if success_rate < threshold {
            let message = format!(
                "Layer {} success rate {:.0}% below continuation threshold {:.0}%, stopping",
                layer.index,
                success_rate * 100.0,
                threshold * 100.0
            );
            warn!(session = %ctx.id.short(), "{}", message);
            ctx.session.write().await.warnings.push(message);
            return LayerOutcome::Stop { executed: true };
        }
        LayerOutcome::Continue
    }

    async fn run_task(&self, ctx: &SessionContext, task: &Task) {
        let permit = tokio::select! {
            permit = Arc::clone(&ctx.permits).acquire_owned() => permit.ok(),
            _ = ctx.cancel.cancelled() => None,
        };
        let Some(_permit) = permit else {
            self.finalize(ctx, TaskResult::cancelled(task.id.clone())).await;
            return;
        };
        if !wait_while_paused(ctx).await {
            self.finalize(ctx, TaskResult::cancelled(task.id.clone())).await;
            return;
        }

        let mut result = TaskResult::new(task.id.clone());
        result.status = TaskStatus::Running;
        ctx.session.write().await.mark_running(&task.id);

        let lease = loop {
            match self.pool.acquire(&ctx.id, task).await {
                Ok(lease) => break lease,
                // Lost a race with pause; the session's workers come back on resume.
                Err(PoolError::Exhausted { .. }) if *ctx.pause_rx.borrow() => {
                    if !wait_while_paused(ctx).await {
                        self.finalize(ctx, TaskResult::cancelled(task.id.clone())).await;
                        return;
                    }
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "No worker for task");
                    result.finish(
                        TaskStatus::Failed,
                        Some(ErrorDetail::PoolExhausted { message: e.to_string() }),
                    );
                    self.finalize(ctx, result).await;
                    return;
                }
            }
        };
        result.worker_id = Some(lease.worker_id);

        self.emit(ExecutionEvent::TaskStarted {
            session_id: ctx.id,
            task_id: task.id.clone(),
            worker_id: Some(lease.worker_id),
        });
        if let Some(monitor) = &self.monitor {
            monitor
                .record_task_event(ctx.id, &task.id, TaskEvent::Started { worker_id: Some(lease.worker_id) })
                .await;
        }
        self.notify_sink(&task.id, ExternalStatus::Doing).await;

        let started = Instant::now();
        let outcome = self.execute_with_retry(ctx, &lease, task, &mut result).await;

        match outcome {
            Ok((output, execution_time)) => {
                result.artifacts = output.artifacts.clone();
                result.summary = output.summary.clone();
                match &self.quality {
                    Some(engine) => {
                        let quality = engine.validate(task, &output, execution_time).await;
                        if let Some(monitor) = &self.monitor {
                            monitor.record_quality(ctx.id, quality.all_gates_passed()).await;
                        }
                        let failed_gates = quality.failed_gates();
                        result.quality = Some(quality);
                        if failed_gates.is_empty() {
                            result.finish(TaskStatus::Completed, None);
                        } else {
                            warn!(task_id = %task.id, ?failed_gates, "Quality gates failed");
                            result.finish(
                                TaskStatus::Failed,
                                Some(ErrorDetail::QualityGateFailure { failed_gates }),
                            );
                        }
                    }
                    None => result.finish(TaskStatus::Completed, None),
                }
            }
            Err(detail) => result.finish(TaskStatus::Failed, Some(detail)),
        }

        let success = result.status == TaskStatus::Completed;
        if let Err(e) = self.pool.release(&lease, Some((success, started.elapsed()))).await {
            // Expected after a cancel dropped the assignment.
            debug!(task_id = %task.id, error = %e, "Worker release skipped");
        }

        self.finalize(ctx, result).await;
    }

    /// Execute until success or the retry budget runs out.
    ///
    /// Returns the successful output with the duration of its attempt.
    async fn execute_with_retry(
        &self,
        ctx: &SessionContext,
        lease: &WorkerLease,
        task: &Task,
        result: &mut TaskResult,
    ) -> std::result::Result<(WorkerOutput, Duration), ErrorDetail> {
        let settings = &self.config.execution;
        let max_attempts = if settings.auto_retry_failed_tasks {
            settings.max_retries + 1
        } else {
            1
        };

        loop {
            result.attempts += 1;
            let attempt_started = Instant::now();
            let detail = match self.execute_once(lease, task).await {
                Ok(output) if output.success => return Ok((output, attempt_started.elapsed())),
                Ok(output) => ErrorDetail::WorkerError {
                    message: output
                        .error
                        .unwrap_or_else(|| "worker reported failure".to_string()),
                },
                Err(detail) => detail,
            };

            let retry = detail.is_retryable() && result.attempts < max_attempts && !ctx.cancel.is_cancelled();
            if !retry {
                warn!(task_id = %task.id, attempts = result.attempts, error = %detail, "Task failed");
                return Err(detail);
            }
            warn!(
                task_id = %task.id,
                attempt = result.attempts,
                max_attempts,
                error = %detail,
                "Task attempt failed, retrying"
            );
            if !wait_while_paused(ctx).await {
                return Err(detail);
            }
        }
    }

    async fn execute_once(&self, lease: &WorkerLease, task: &Task) -> std::result::Result<WorkerOutput, ErrorDetail> {
        let call = AssertUnwindSafe(lease.worker().execute(task)).catch_unwind();
        let timeout_secs = self.config.execution.task_timeout_secs;

        let outcome = if timeout_secs > 0 {
            match tokio::time::timeout(Duration::from_secs(timeout_secs), call).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(ErrorDetail::Timeout { timeout_secs }),
            }
        } else {
            call.await
        };

        match outcome {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(failure)) => Err(ErrorDetail::WorkerError {
                message: failure.to_string(),
            }),
            Err(panic) => Err(ErrorDetail::Panicked {
                message: panic_message(panic.as_ref()),
            }),
        }
    }

    /// Record a task's final result and fan it out to events, monitor and sink.
    async fn finalize(&self, ctx: &SessionContext, result: TaskResult) {
        if !ctx.session.write().await.record_result(result.clone()) {
            warn!(task_id = %result.task_id, "Task already has a result, ignoring");
            return;
        }

        match result.status {
            TaskStatus::Completed => {
                debug!(task_id = %result.task_id, attempts = result.attempts, "Task completed");
                if let Some(monitor) = &self.monitor {
                    monitor.record_task_event(ctx.id, &result.task_id, TaskEvent::Completed).await;
                }
                self.notify_sink(&result.task_id, ExternalStatus::Done).await;
                self.emit(ExecutionEvent::TaskCompleted {
                    session_id: ctx.id,
                    result: Box::new(result),
                });
            }
            TaskStatus::Failed => {
                if let Some(monitor) = &self.monitor {
                    let error = result
                        .error
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default();
                    monitor
                        .record_task_event(ctx.id, &result.task_id, TaskEvent::Failed { error })
                        .await;
                }
                self.emit(ExecutionEvent::TaskFailed {
                    session_id: ctx.id,
                    result: Box::new(result),
                });
            }
            _ => debug!(task_id = %result.task_id, status = %result.status, "Task not executed"),
        }
    }

    async fn notify_sink(&self, task_id: &TaskId, status: ExternalStatus) {
        if let Some(sink) = &self.status_sink {
            if let Err(e) = sink.notify(task_id, status).await {
                warn!(task_id = %task_id, ?status, error = %e, "Status sink notification failed");
            }
        }
    }

    /// Close out the session: fill in unattempted tasks, settle the final
    /// state, and release everything the session held.
    async fn finish(&self, ctx: &SessionContext, layers_executed: usize) -> ExecutionResult {
        let graph = &ctx.graph;
        let mut execution = {
            let mut session = ctx.session.write().await;
            for task in graph.tasks() {
                if !session.has_result(&task.id) {
                    session.record_result(TaskResult::cancelled(task.id.clone()));
                }
            }

            let mut execution = ExecutionResult {
                session_id: ctx.id,
                state: session.state(),
                started_at: session.started_at,
                finished_at: Utc::now(),
                total_tasks: graph.total_tasks,
                successful_tasks: 0,
                failed_tasks: 0,
                cancelled_tasks: 0,
                task_results: session.ordered_results(),
                parallel_stats: ParallelStats {
                    total_layers: graph.layer_count(),
                    layers_executed,
                    parallelization_factor: graph.parallelization_factor,
                    average_tasks_per_layer: graph.total_tasks as f64 / graph.layer_count().max(1) as f64,
                },
                quality_summary: None,
                errors: session.errors.clone(),
                warnings: session.warnings.clone(),
            };
            execution.tally();

            if !session.state().is_terminal() {
                let target = if execution.successful_tasks == execution.total_tasks && execution.errors.is_empty() {
                    SessionState::Completed
                } else {
                    SessionState::Failed
                };
                if session.state() == SessionState::Paused && target == SessionState::Completed {
                    let _ = session.transition(SessionState::Executing);
                }
                if let Err(e) = session.transition(target) {
                    error!(session = %ctx.id.short(), error = %e, "Could not settle session state");
                }
            }
            execution.state = session.state();
            execution
        };
        execution.finished_at = Utc::now();

        info!(
            session = %ctx.id.short(),
            state = %execution.state,
            successful = execution.successful_tasks,
            failed = execution.failed_tasks,
            cancelled = execution.cancelled_tasks,
            "Execution session finished"
        );
        if execution.state == SessionState::Completed {
            self.emit(ExecutionEvent::SessionCompleted {
                session_id: ctx.id,
                successful_tasks: execution.successful_tasks,
                total_tasks: execution.total_tasks,
                duration_secs: execution.duration().as_secs_f64(),
            });
        } else {
            self.emit(ExecutionEvent::SessionFailed {
                session_id: ctx.id,
                successful_tasks: execution.successful_tasks,
                failed_tasks: execution.failed_tasks,
                cancelled_tasks: execution.cancelled_tasks,
                errors: execution.errors.clone(),
            });
        }

        if let Some(monitor) = &self.monitor {
            monitor.stop_session(ctx.id).await;
        }
        self.pool.cleanup_session(&ctx.id).await;
        self.sessions.write().await.remove(&ctx.id);
        execution
    }

    async fn entry(&self, id: &SessionId) -> Result<SessionEntry> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestrationError::SessionNotFound(*id).into())
    }

    /// Pause an executing session. Returns `false` if it is not executing.
    pub async fn pause(&self, id: &SessionId) -> Result<bool> {
        let entry = self.entry(id).await?;
        {
            let mut session = entry.session.write().await;
            if session.state() != SessionState::Executing {
                return Ok(false);
            }
            session.transition(SessionState::Paused)?;
        }
        entry.pause_tx.send_replace(true);
        let paused = self.pool.pause_session(id).await;
        info!(session = %id.short(), paused_workers = paused, "Session paused");
        self.emit(ExecutionEvent::SessionPaused { session_id: *id });
        Ok(true)
    }

    /// Resume a paused session. Returns `false` if it is not paused.
    pub async fn resume(&self, id: &SessionId) -> Result<bool> {
        let entry = self.entry(id).await?;
        {
            let mut session = entry.session.write().await;
            if session.state() != SessionState::Paused {
                return Ok(false);
            }
            session.transition(SessionState::Executing)?;
        }
        let resumed = self.pool.resume_session(id).await;
        entry.pause_tx.send_replace(false);
        info!(session = %id.short(), resumed_workers = resumed, "Session resumed");
        self.emit(ExecutionEvent::SessionResumed { session_id: *id });
        Ok(true)
    }

    /// Cancel a session. Tasks not yet started are skipped; in-flight
    /// executions run to completion. Returns `false` if already finished.
    pub async fn cancel(&self, id: &SessionId) -> Result<bool> {
        let entry = self.entry(id).await?;
        {
            let mut session = entry.session.write().await;
            if session.state().is_terminal() {
                return Ok(false);
            }
            session.transition(SessionState::Cancelled)?;
            session.running.clear();
        }
        entry.cancel.cancel();
        let freed = self.pool.cancel_session(id).await;
        if let Some(monitor) = &self.monitor {
            monitor.stop_session(*id).await;
        }
        info!(session = %id.short(), freed_assignments = freed, "Session cancelled");
        self.emit(ExecutionEvent::SessionCancelled { session_id: *id });
        Ok(true)
    }

    pub async fn status(&self, id: &SessionId) -> Option<SessionSnapshot> {
        let entry = self.entry(id).await.ok()?;
        let metrics = match &self.monitor {
            Some(monitor) => monitor.session_metrics(*id).await,
            None => None,
        };
        let snapshot = entry.session.read().await.snapshot(metrics);
        Some(snapshot)
    }

    pub async fn active_sessions(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().copied().collect()
    }
}

/// Block while the session is paused. Returns `false` once cancelled.
async fn wait_while_paused(ctx: &SessionContext) -> bool {
    let mut rx = ctx.pause_rx.clone();
    loop {
        if ctx.cancel.is_cancelled() {
            return false;
        }
        if !*rx.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => return false,
            changed = rx.changed() => {
                if changed.is_err() {
                    return true;
                }
            }
        }
    }
}

/// First blocking prerequisite of `layer` that has not completed.
fn unsatisfied_dependency(session: &Session, layer: &ExecutionLayer) -> Option<OrchestrationError> {
    layer.tasks.iter().find_map(|task| {
        session
            .graph
            .dependency_graph
            .blocking_dependencies_of(&task.id)
            .into_iter()
            .find(|dep| !session.completed.contains(dep))
            .map(|dependency| OrchestrationError::UnsatisfiedDependency {
                task_id: task.id.clone(),
                dependency,
            })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
