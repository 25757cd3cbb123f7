//! Worker pool coordinator.
//!
//! The `WorkerPool` owns every worker's lifecycle and hands out leases to
//! sessions. All bookkeeping lives behind a single mutex, so acquire and
//! release are serialized across every session sharing the pool. Acquire
//! never waits: a full pool is reported as `PoolError::Exhausted`.

use crate::core::task::{Task, TaskId};
use crate::error::PoolError;
use crate::orchestration::session::SessionId;
use crate::orchestration::worker::Worker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique identifier for a pooled worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Initializing,
    /// Has spare capacity.
    Idle,
    /// Running at full capacity.
    Busy,
    Paused,
    Error,
    Shutdown,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Initializing => "initializing",
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Paused => "paused",
            WorkerState::Error => "error",
            WorkerState::Shutdown => "shutdown",
        };
        write!(f, "{}", name)
    }
}

/// Running performance counters for one worker. Reported only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_duration_secs: f64,
    pub average_duration_secs: f64,
    pub success_rate: f64,
    pub last_task_at: Option<DateTime<Utc>>,
}

impl WorkerMetrics {
    fn record(&mut self, success: bool, duration: Duration) {
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        let total = (self.tasks_completed + self.tasks_failed) as f64;
        self.total_duration_secs += duration.as_secs_f64();
        self.average_duration_secs = self.total_duration_secs / total;
        self.success_rate = self.tasks_completed as f64 / total;
        self.last_task_at = Some(Utc::now());
    }
}

/// Proof that a worker is assigned to a session's task.
///
/// Hand it back through [`WorkerPool::release`] when the task finishes.
#[derive(Clone)]
pub struct WorkerLease {
    pub worker_id: WorkerId,
    pub session_id: SessionId,
    pub task_id: TaskId,
    worker: Arc<dyn Worker>,
}

impl WorkerLease {
    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker_id", &self.worker_id)
            .field("session_id", &self.session_id)
            .field("task_id", &self.task_id)
            .finish()
    }
}

/// Point-in-time view of a single worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub name: String,
    pub state: WorkerState,
    pub capacity: usize,
    pub load: usize,
    pub load_factor: f64,
    pub categories: Vec<String>,
    pub sessions: usize,
    pub metrics: WorkerMetrics,
}

/// Aggregate pool health.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total_workers: usize,
    /// Idle workers with spare capacity.
    pub available: usize,
    pub busy: usize,
    pub paused: usize,
    pub errored: usize,
    pub total_capacity: usize,
    pub current_load: usize,
    pub workers: Vec<WorkerSnapshot>,
}

struct Slot {
    id: WorkerId,
    worker: Arc<dyn Worker>,
    state: WorkerState,
    capacity: usize,
    categories: Vec<String>,
    current: Vec<(SessionId, TaskId)>,
    sessions: HashSet<SessionId>,
    /// Sessions that have paused this worker.
    paused_for: HashSet<SessionId>,
    metrics: WorkerMetrics,
}

impl Slot {
    fn load(&self) -> usize {
        self.current.len()
    }

    fn load_factor(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        (self.load() as f64 / self.capacity as f64).min(1.0)
    }

    fn is_available(&self) -> bool {
        self.state == WorkerState::Idle && self.load() < self.capacity
    }

    /// Whether `session` may place another task here. A pause only blocks
    /// the sessions that requested it.
    fn accepts(&self, session: &SessionId) -> bool {
        matches!(self.state, WorkerState::Idle | WorkerState::Busy | WorkerState::Paused)
            && self.load() < self.capacity
            && !self.paused_for.contains(session)
    }

    fn is_live(&self) -> bool {
        matches!(self.state, WorkerState::Idle | WorkerState::Busy | WorkerState::Paused)
    }

    /// Paused while any session holds a pause, else Idle or Busy by load.
    fn settle(&mut self) {
        self.state = if !self.paused_for.is_empty() {
            WorkerState::Paused
        } else if self.load() >= self.capacity {
            WorkerState::Busy
        } else {
            WorkerState::Idle
        };
    }

    fn drop_session(&mut self, session: &SessionId) -> usize {
        let before = self.current.len();
        self.current.retain(|(s, _)| s != session);
        self.sessions.remove(session);
        before - self.current.len()
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            name: self.worker.name().to_string(),
            state: self.state,
            capacity: self.capacity,
            load: self.load(),
            load_factor: self.load_factor(),
            categories: self.categories.clone(),
            sessions: self.sessions.len(),
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Default)]
struct PoolState {
    /// Insertion order doubles as the acquire tie-breaker.
    slots: Vec<Slot>,
    assignments: HashMap<SessionId, HashSet<WorkerId>>,
}

impl PoolState {
    fn slot_mut(&mut self, id: &WorkerId) -> Result<&mut Slot, PoolError> {
        self.slots
            .iter_mut()
            .find(|s| &s.id == id)
            .ok_or(PoolError::WorkerNotFound(*id))
    }
}

/// Fixed set of workers shared by every session.
pub struct WorkerPool {
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Build a pool from a list of workers.
    pub async fn with_workers(workers: Vec<Arc<dyn Worker>>) -> Self {
        let pool = Self::new();
        for worker in workers {
            pool.add_worker(worker).await;
        }
        pool
    }

    /// Register a worker and bring it to `Idle`.
    ///
    /// A worker declaring zero capacity is kept in `Error` and never selected.
    pub async fn add_worker(&self, worker: Arc<dyn Worker>) -> WorkerId {
        let capabilities = worker.capabilities();
        let mut slot = Slot {
            id: WorkerId::new(),
            worker,
            state: WorkerState::Initializing,
            capacity: capabilities.capacity,
            categories: capabilities.categories,
            current: Vec::new(),
            sessions: HashSet::new(),
            paused_for: HashSet::new(),
            metrics: WorkerMetrics::default(),
        };

        if slot.capacity == 0 {
            warn!(worker_id = %slot.id.short(), name = slot.worker.name(), "Worker declares zero capacity");
            slot.state = WorkerState::Error;
        } else {
            slot.state = WorkerState::Idle;
        }

        let id = slot.id;
        info!(worker_id = %id.short(), name = slot.worker.name(), capacity = slot.capacity, "Worker added to pool");
        self.state.lock().await.slots.push(slot);
        id
    }

    /// Assign the least-loaded available worker to `task` for `session`.
    ///
    /// Workers that support the task are ranked first; any other worker
    /// with spare capacity is used before the pool reports exhaustion.
    ///
    /// # Errors
    /// - `Empty` when the pool has no workers at all
    /// - `Exhausted` when no eligible worker has spare capacity
    pub async fn acquire(&self, session: &SessionId, task: &Task) -> Result<WorkerLease, PoolError> {
        let mut state = self.state.lock().await;
        if state.slots.is_empty() {
            return Err(PoolError::Empty);
        }

        let any_supports = state.slots.iter().any(|s| s.worker.supports(task));
        if !any_supports {
            warn!(task_id = %task.id, "No worker declares support for task, ignoring capabilities");
        }

        let chosen = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.accepts(session))
            .map(|(index, s)| (index, s, s.worker.supports(task)))
            .min_by(|(ia, a, a_fits), (ib, b, b_fits)| {
                b_fits
                    .cmp(a_fits)
                    .then(a.load_factor().total_cmp(&b.load_factor()))
                    .then(ia.cmp(ib))
            })
            .map(|(index, _, fits)| (index, fits));

        let Some((index, fits)) = chosen else {
            let capacity = state.slots.iter().map(|s| s.capacity).sum();
            let busy = state.slots.iter().map(Slot::load).sum();
            debug!(task_id = %task.id, capacity, busy, "Worker pool exhausted");
            return Err(PoolError::Exhausted { capacity, busy });
        };
        if any_supports && !fits {
            debug!(task_id = %task.id, "Supporting workers full, using a non-matching worker");
        }

        let slot = &mut state.slots[index];
        slot.current.push((*session, task.id.clone()));
        slot.sessions.insert(*session);
        slot.settle();

        let lease = WorkerLease {
            worker_id: slot.id,
            session_id: *session,
            task_id: task.id.clone(),
            worker: Arc::clone(&slot.worker),
        };
        debug!(
            worker_id = %slot.id.short(),
            task_id = %task.id,
            load = slot.load(),
            state = %slot.state,
            "Worker acquired"
        );

        state
            .assignments
            .entry(*session)
            .or_default()
            .insert(lease.worker_id);
        Ok(lease)
    }

    /// Return a leased worker, optionally recording the outcome.
    ///
    /// `outcome` is `(success, duration)` of the finished task.
    pub async fn release(
        &self,
        lease: &WorkerLease,
        outcome: Option<(bool, Duration)>,
    ) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        let slot = state.slot_mut(&lease.worker_id)?;

        let position = slot
            .current
            .iter()
            .position(|(s, t)| s == &lease.session_id && t == &lease.task_id)
            .ok_or(PoolError::NotAssigned {
                worker_id: lease.worker_id,
                session_id: lease.session_id,
            })?;
        slot.current.remove(position);

        if let Some((success, duration)) = outcome {
            slot.metrics.record(success, duration);
        }

        let still_serving = slot.current.iter().any(|(s, _)| s == &lease.session_id);
        if !still_serving {
            slot.sessions.remove(&lease.session_id);
        }
        if slot.is_live() {
            slot.settle();
        }
        debug!(worker_id = %slot.id.short(), task_id = %lease.task_id, state = %slot.state, "Worker released");

        if !still_serving {
            if let Some(workers) = state.assignments.get_mut(&lease.session_id) {
                workers.remove(&lease.worker_id);
                if workers.is_empty() {
                    state.assignments.remove(&lease.session_id);
                }
            }
        }
        Ok(())
    }

    /// Pause every worker currently serving `session`. Returns how many paused.
    ///
    /// Other sessions keep using a paused worker's spare capacity.
    pub async fn pause_session(&self, session: &SessionId) -> usize {
        let mut state = self.state.lock().await;
        let mut paused = 0;
        for slot in state.slots.iter_mut() {
            if slot.sessions.contains(session) && slot.is_live() && slot.paused_for.insert(*session) {
                slot.settle();
                paused += 1;
            }
        }
        debug!(session_id = %session.short(), paused, "Paused session workers");
        paused
    }

    /// Undo [`pause_session`](Self::pause_session). Returns how many resumed.
    pub async fn resume_session(&self, session: &SessionId) -> usize {
        let mut state = self.state.lock().await;
        let mut resumed = 0;
        for slot in state.slots.iter_mut() {
            if slot.paused_for.remove(session) {
                if slot.is_live() {
                    slot.settle();
                }
                resumed += 1;
            }
        }
        debug!(session_id = %session.short(), resumed, "Resumed session workers");
        resumed
    }

    /// Drop all of a session's assignments and free its workers.
    pub async fn cancel_session(&self, session: &SessionId) -> usize {
        let mut state = self.state.lock().await;
        let mut freed = 0;
        for slot in state.slots.iter_mut() {
            let touched = slot.paused_for.remove(session) | slot.sessions.contains(session);
            freed += slot.drop_session(session);
            if touched && slot.is_live() {
                slot.settle();
            }
        }
        state.assignments.remove(session);
        info!(session_id = %session.short(), freed, "Cancelled session assignments");
        freed
    }

    /// Drop a finished session's leftover bookkeeping without touching worker state.
    pub async fn cleanup_session(&self, session: &SessionId) {
        let mut state = self.state.lock().await;
        let mut leftover = 0;
        for slot in state.slots.iter_mut() {
            leftover += slot.drop_session(session);
            // A stale pause would otherwise pin the worker.
            if slot.paused_for.remove(session) && slot.is_live() {
                slot.settle();
            }
        }
        state.assignments.remove(session);
        if leftover > 0 {
            warn!(session_id = %session.short(), leftover, "Session finished with assignments outstanding");
        }
    }

    /// Workers currently assigned to `session`.
    pub async fn session_workers(&self, session: &SessionId) -> Vec<WorkerId> {
        let state = self.state.lock().await;
        let mut ids: Vec<WorkerId> = state
            .assignments
            .get(session)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_by_key(|id| id.0);
        ids
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let count = |wanted: WorkerState| state.slots.iter().filter(|s| s.state == wanted).count();

        PoolStatus {
            total_workers: state.slots.len(),
            available: state.slots.iter().filter(|s| s.is_available()).count(),
            busy: count(WorkerState::Busy),
            paused: count(WorkerState::Paused),
            errored: count(WorkerState::Error),
            total_capacity: state.slots.iter().map(|s| s.capacity).sum(),
            current_load: state.slots.iter().map(Slot::load).sum(),
            workers: state.slots.iter().map(Slot::snapshot).collect(),
        }
    }

    /// Combined capacity of workers that can take tasks.
    pub async fn total_capacity(&self) -> usize {
        let state = self.state.lock().await;
        state
            .slots
            .iter()
            .filter(|s| !matches!(s.state, WorkerState::Error | WorkerState::Shutdown))
            .map(|s| s.capacity)
            .sum()
    }

    pub async fn worker_count(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    pub async fn load_factor(&self, id: &WorkerId) -> Option<f64> {
        let state = self.state.lock().await;
        state.slots.iter().find(|s| &s.id == id).map(Slot::load_factor)
    }

    pub async fn metrics(&self, id: &WorkerId) -> Option<WorkerMetrics> {
        let state = self.state.lock().await;
        state.slots.iter().find(|s| &s.id == id).map(|s| s.metrics.clone())
    }

    /// Move every worker to `Shutdown` and clear all assignments.
    pub async fn shutdown_all(&self) {
        let mut state = self.state.lock().await;
        for slot in state.slots.iter_mut() {
            slot.current.clear();
            slot.sessions.clear();
            slot.paused_for.clear();
            slot.state = WorkerState::Shutdown;
        }
        state.assignments.clear();
        info!(workers = state.slots.len(), "Worker pool shut down");
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}
