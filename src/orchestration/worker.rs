//! Worker contract.
//!
//! A worker performs the actual work of a task. The orchestrator only sees
//! the `WorkerOutput` it returns, including the raw quality evidence the
//! gates validate. Errors and panics from `execute` both become task
//! failures.

use crate::core::task::Task;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error returned by a worker that could not complete a task.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct WorkerFailure(pub String);

impl WorkerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Static description of what a worker can take on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    /// Task categories this worker handles. `general` matches anything.
    pub categories: Vec<String>,
    /// Maximum number of tasks the worker runs concurrently.
    pub capacity: usize,
}

impl Default for WorkerCapabilities {
    fn default() -> Self {
        Self {
            categories: vec!["general".to_string()],
            capacity: 1,
        }
    }
}

impl WorkerCapabilities {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    /// A task matches when it has no categories, or shares one with the worker.
    pub fn matches(&self, task: &Task) -> bool {
        task.categories.is_empty()
            || self.categories.iter().any(|c| c == "general")
            || task.categories.iter().any(|c| self.categories.contains(c))
    }
}

/// Files produced by a task execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default)]
    pub implementation: Vec<String>,
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default)]
    pub documentation: Vec<String>,
}

impl Artifacts {
    pub fn is_empty(&self) -> bool {
        self.implementation.is_empty() && self.tests.is_empty() && self.documentation.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub total: u32,
    pub passing: u32,
    pub failing: u32,
    pub execution_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    pub percentage: f64,
    pub total_lines: u32,
    pub covered_lines: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityScan {
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub tool: Option<String>,
    #[serde(default)]
    pub findings: Vec<String>,
    pub input_validation: bool,
    pub secure_coding: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
    pub memory_mb: f64,
    pub cpu_percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeAnalysis {
    pub static_analysis_passed: bool,
    pub type_check_passed: bool,
    pub lint_passed: bool,
    pub style_violations: u32,
    pub complexity: f64,
    pub documentation_coverage: f64,
}

/// Raw measurements reported by a worker. Missing sections mean the worker
/// collected no evidence of that kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityEvidence {
    pub tests: Option<TestRun>,
    pub coverage: Option<Coverage>,
    pub tdd_followed: Option<bool>,
    pub security: Option<SecurityScan>,
    pub benchmark: Option<Benchmark>,
    pub analysis: Option<CodeAnalysis>,
}

impl QualityEvidence {
    /// Evidence that satisfies every gate at default thresholds.
    pub fn clean() -> Self {
        Self {
            tests: Some(TestRun {
                total: 12,
                passing: 12,
                failing: 0,
                execution_secs: 0.4,
            }),
            coverage: Some(Coverage {
                percentage: 100.0,
                total_lines: 200,
                covered_lines: 200,
            }),
            tdd_followed: Some(true),
            security: Some(SecurityScan {
                tool: Some("simulated".to_string()),
                input_validation: true,
                secure_coding: true,
                ..Default::default()
            }),
            benchmark: Some(Benchmark {
                memory_mb: 64.0,
                cpu_percentage: 20.0,
            }),
            analysis: Some(CodeAnalysis {
                static_analysis_passed: true,
                type_check_passed: true,
                lint_passed: true,
                style_violations: 0,
                complexity: 4.0,
                documentation_coverage: 90.0,
            }),
        }
    }

    /// Clean evidence with the given coverage percentage.
    pub fn with_coverage(mut self, percentage: f64) -> Self {
        let coverage = self.coverage.get_or_insert_with(Coverage::default);
        coverage.percentage = percentage;
        coverage.covered_lines = (f64::from(coverage.total_lines) * percentage / 100.0) as u32;
        self
    }
}

/// What a worker hands back after executing a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub success: bool,
    pub artifacts: Artifacts,
    pub summary: String,
    pub error: Option<String>,
    pub evidence: QualityEvidence,
}

impl WorkerOutput {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            ..Default::default()
        }
    }

    /// A completed run that reports failure without raising.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_artifacts(mut self, artifacts: Artifacts) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_evidence(mut self, evidence: QualityEvidence) -> Self {
        self.evidence = evidence;
        self
    }
}

/// An execution unit borrowed from the pool.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Short display name used in logs and pool status.
    fn name(&self) -> &str {
        "worker"
    }

    async fn execute(&self, task: &Task) -> Result<WorkerOutput, WorkerFailure>;

    /// Advisory capability check used when picking a worker.
    fn supports(&self, task: &Task) -> bool {
        self.capabilities().matches(task)
    }

    fn capabilities(&self) -> WorkerCapabilities {
        WorkerCapabilities::default()
    }
}

/// Worker that sleeps for a scaled version of each task's estimate and
/// reports clean evidence.
#[derive(Debug, Clone)]
pub struct SimulatedWorker {
    name: String,
    /// Wall-clock time per estimated minute.
    time_scale: Duration,
    capabilities: WorkerCapabilities,
}

impl SimulatedWorker {
    pub fn new(name: impl Into<String>, time_scale: Duration) -> Self {
        Self {
            name: name.into(),
            time_scale,
            capabilities: WorkerCapabilities::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: WorkerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

#[async_trait]
impl Worker for SimulatedWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, task: &Task) -> Result<WorkerOutput, WorkerFailure> {
        let delay = self.time_scale.saturating_mul(task.duration_minutes());
        debug!(worker = %self.name, task_id = %task.id, ?delay, "Simulating task");
        tokio::time::sleep(delay).await;

        let implementation: Vec<String> = task.context.file_locations.keys().cloned().collect();
        let artifacts = Artifacts {
            implementation: if implementation.is_empty() {
                vec![format!("src/{}.rs", task.id)]
            } else {
                implementation
            },
            tests: vec![format!("tests/{}_test.rs", task.id)],
            documentation: Vec::new(),
        };

        Ok(WorkerOutput::success(format!("Completed {}", task.title))
            .with_artifacts(artifacts)
            .with_evidence(QualityEvidence::clean()))
    }

    fn capabilities(&self) -> WorkerCapabilities {
        self.capabilities.clone()
    }
}
