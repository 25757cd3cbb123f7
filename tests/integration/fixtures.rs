//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scriptable mock worker with a concurrency probe
//! - Orchestrator harnesses over a pool of mock workers
//! - Predefined task sets

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use stratum::config::ExecutionConfig;
use stratum::core::{Task, TaskId};
use stratum::orchestration::{
    Artifacts, ExecutionEvent, ExternalStatus, Orchestrator, QualityEvidence, StatusSink, Worker,
    WorkerCapabilities, WorkerFailure, WorkerOutput, WorkerPool,
};

/// Parse a task id, panicking on invalid input.
pub fn tid(s: &str) -> TaskId {
    TaskId::parse(s).expect("valid task id")
}

/// A task with a title derived from its id.
pub fn task(id: &str) -> Task {
    Task::new(tid(id), &format!("Task {}", id))
}

/// A task depending on each of `deps`.
pub fn task_after(id: &str, deps: &[&str]) -> Task {
    deps.iter()
        .fold(task(id), |t, dep| t.with_dependency(tid(dep)))
}

/// Diamond: a -> {b, c} -> d.
pub fn diamond_tasks() -> Vec<Task> {
    vec![
        task("a"),
        task_after("b", &["a"]),
        task_after("c", &["a"]),
        task_after("d", &["b", "c"]),
    ]
}

/// Linear chain t0 -> t1 -> ... -> t{n-1}.
pub fn chain_tasks(n: usize) -> Vec<Task> {
    (0..n)
        .map(|i| {
            let id = format!("t{}", i);
            if i == 0 {
                task(&id)
            } else {
                task_after(&id, &[&format!("t{}", i - 1)])
            }
        })
        .collect()
}

/// `n` tasks with no dependencies.
pub fn independent_tasks(n: usize) -> Vec<Task> {
    (0..n).map(|i| task(&format!("task-{}", i))).collect()
}

/// Tracks how many executions overlap and which tasks ran.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
    executions: Mutex<Vec<TaskId>>,
}

impl ConcurrencyProbe {
    /// Highest number of simultaneous executions observed.
    pub fn max_concurrency(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> Vec<TaskId> {
        self.executions.lock().unwrap().clone()
    }

    /// How many times `task_id` was executed.
    pub fn count(&self, task_id: &TaskId) -> usize {
        self.executions().iter().filter(|t| *t == task_id).count()
    }
}

/// Marks one execution in flight until dropped.
struct ProbeGuard(Arc<ConcurrencyProbe>);

impl ProbeGuard {
    fn enter(probe: &Arc<ConcurrencyProbe>, task_id: &TaskId) -> Self {
        let now = probe.current.fetch_add(1, Ordering::SeqCst) + 1;
        probe.max.fetch_max(now, Ordering::SeqCst);
        probe.executions.lock().unwrap().push(task_id.clone());
        Self(Arc::clone(probe))
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Worker whose behaviour is scripted per task id.
pub struct MockWorker {
    delay: Duration,
    fail: HashSet<TaskId>,
    panic: HashSet<TaskId>,
    coverage: HashMap<TaskId, f64>,
    categories: Vec<String>,
    probe: Arc<ConcurrencyProbe>,
}

impl MockWorker {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail: HashSet::new(),
            panic: HashSet::new(),
            coverage: HashMap::new(),
            categories: Vec::new(),
            probe: Arc::new(ConcurrencyProbe::default()),
        }
    }

    /// Return an error for every execution of `id`.
    pub fn failing(mut self, id: &str) -> Self {
        self.fail.insert(tid(id));
        self
    }

    /// Panic during every execution of `id`.
    pub fn panicking(mut self, id: &str) -> Self {
        self.panic.insert(tid(id));
        self
    }

    /// Report `percentage` test coverage for `id`.
    pub fn with_coverage(mut self, id: &str, percentage: f64) -> Self {
        self.coverage.insert(tid(id), percentage);
        self
    }

    /// Declare the task categories this worker handles.
    pub fn with_categories(mut self, categories: &[&str]) -> Self {
        self.categories = categories.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn probe(&self) -> Arc<ConcurrencyProbe> {
        Arc::clone(&self.probe)
    }
}

#[async_trait]
impl Worker for MockWorker {
    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> WorkerCapabilities {
        if self.categories.is_empty() {
            return WorkerCapabilities::default();
        }
        WorkerCapabilities::default().with_categories(self.categories.iter().cloned())
    }

    async fn execute(&self, task: &Task) -> Result<WorkerOutput, WorkerFailure> {
        let _guard = ProbeGuard::enter(&self.probe, &task.id);
        tokio::time::sleep(self.delay).await;

        if self.panic.contains(&task.id) {
            panic!("mock worker panicked on {}", task.id);
        }
        if self.fail.contains(&task.id) {
            return Err(WorkerFailure::new(format!("mock failure on {}", task.id)));
        }

        let coverage = self.coverage.get(&task.id).copied().unwrap_or(100.0);
        Ok(WorkerOutput::success(format!("Completed {}", task.id))
            .with_artifacts(Artifacts {
                implementation: vec![format!("src/{}.rs", task.id)],
                tests: vec![format!("tests/{}.rs", task.id)],
                documentation: vec![],
            })
            .with_evidence(QualityEvidence::clean().with_coverage(coverage)))
    }
}

/// Default config with monitoring off and a single attempt per task.
pub fn test_config() -> ExecutionConfig {
    let mut config = ExecutionConfig::default();
    config.monitoring.enabled = false;
    config.execution.auto_retry_failed_tasks = false;
    config
}

/// An orchestrator over `workers` slots all backed by the same mock.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub pool: Arc<WorkerPool>,
    pub probe: Arc<ConcurrencyProbe>,
}

impl Harness {
    pub async fn new(workers: usize, worker: MockWorker, config: ExecutionConfig) -> Self {
        let probe = worker.probe();
        let worker: Arc<dyn Worker> = Arc::new(worker);
        let pool = Arc::new(WorkerPool::with_workers(vec![worker; workers]).await);
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&pool), config));
        Self {
            orchestrator,
            pool,
            probe,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        let orchestrator = Orchestrator::new(Arc::clone(&self.pool), self.orchestrator.config().clone())
            .with_status_sink(sink);
        self.orchestrator = Arc::new(orchestrator);
        self
    }
}

/// Drain every event currently buffered in `rx`.
pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Status sink that records every notification.
#[derive(Default)]
pub struct RecordingSink {
    pub calls: Mutex<Vec<(TaskId, ExternalStatus)>>,
    pub fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(TaskId, ExternalStatus)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn notify(&self, task_id: &TaskId, status: ExternalStatus) -> Result<(), String> {
        self.calls.lock().unwrap().push((task_id.clone(), status));
        if self.fail {
            return Err("tracker unavailable".to_string());
        }
        Ok(())
    }
}
