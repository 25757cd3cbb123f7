//! Orchestration layer.
//!
//! Runs an [`ExecutionGraph`](crate::core::ExecutionGraph) layer by layer on
//! a shared worker pool, validating each result against the quality gates
//! and reporting progress to the monitor and event subscribers.

pub mod events;
pub mod monitor;
pub mod orchestrator;
pub mod pool;
pub mod quality;
pub mod result;
pub mod session;
pub mod worker;

pub use events::{ExecutionEvent, ExternalStatus, StatusSink};
pub use monitor::{
    Alert, AlertCallback, AlertKind, AlertSeverity, ExecutionMetrics, GlobalMetrics, Monitor,
    TaskEvent, TaskTimeline, TimelineStatus,
};
pub use orchestrator::{Orchestrator, RunOptions};
pub use pool::{PoolStatus, WorkerId, WorkerLease, WorkerMetrics, WorkerPool, WorkerSnapshot, WorkerState};
pub use quality::{GateStatus, QualityGate, QualityGateEngine, QualityResult};
pub use result::{
    ErrorDetail, ExecutionReport, ExecutionResult, ParallelStats, QualitySummary, TaskResult,
    TaskStatus,
};
pub use session::{Session, SessionId, SessionSnapshot, SessionState};
pub use worker::{
    Artifacts, QualityEvidence, SimulatedWorker, Worker, WorkerCapabilities, WorkerFailure,
    WorkerOutput,
};
