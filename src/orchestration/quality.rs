//! Quality gate pipeline.
//!
//! Four independent validators read a task's `WorkerOutput` and produce a
//! status, metrics and a bucketed component score each. The aggregate
//! `QualityResult` fails when any gate fails. A successful worker run with a
//! failing aggregate is downgraded to a task failure by the orchestrator.

use crate::config::QualitySettings;
use crate::core::task::{Task, TaskId};
use crate::orchestration::worker::WorkerOutput;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    Failed,
    /// Passed without enough evidence to be sure.
    Warning,
    /// Not enforced for this task.
    Skipped,
}

impl GateStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, GateStatus::Failed)
    }
}

/// The four gates, named as they appear in failure details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityGate {
    Tdd,
    Security,
    Performance,
    CodeQuality,
}

impl std::fmt::Display for QualityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QualityGate::Tdd => "tdd",
            QualityGate::Security => "security",
            QualityGate::Performance => "performance",
            QualityGate::CodeQuality => "code_quality",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TddValidation {
    pub status: GateStatus,
    pub test_artifacts: usize,
    pub tests_executed: u32,
    pub tests_passing: u32,
    pub tests_failing: u32,
    pub test_execution_secs: f64,
    pub coverage_percentage: f64,
    pub required_coverage: f64,
    pub tdd_followed: Option<bool>,
    pub meets_requirements: bool,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl TddValidation {
    pub fn score(&self) -> f64 {
        if self.meets_requirements {
            1.0
        } else if self.coverage_percentage >= 80.0 {
            0.8
        } else if self.coverage_percentage >= 60.0 {
            0.6
        } else {
            0.3
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityValidation {
    pub status: GateStatus,
    pub scan_performed: bool,
    pub scan_passed: bool,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub tool: Option<String>,
    pub findings: Vec<String>,
    pub input_validation: bool,
    pub secure_coding: bool,
    pub meets_requirements: bool,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl SecurityValidation {
    pub fn score(&self) -> f64 {
        if self.meets_requirements {
            1.0
        } else if self.high == 0 {
            0.7
        } else {
            0.3
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceValidation {
    pub status: GateStatus,
    pub enforced: bool,
    pub benchmark_executed: bool,
    pub execution_time_secs: f64,
    pub memory_mb: Option<f64>,
    pub cpu_percentage: Option<f64>,
    pub meets_requirements: bool,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl PerformanceValidation {
    pub fn score(&self) -> f64 {
        let mut factors = vec![time_bucket(self.execution_time_secs)];
        if let Some(memory) = self.memory_mb {
            factors.push(memory_bucket(memory));
        }
        factors.push(if self.meets_requirements { 1.0 } else { 0.5 });
        factors.iter().sum::<f64>() / factors.len() as f64
    }
}

fn time_bucket(secs: f64) -> f64 {
    if secs <= 1.0 {
        1.0
    } else if secs <= 10.0 {
        0.8
    } else if secs <= 60.0 {
        0.6
    } else {
        0.4
    }
}

fn memory_bucket(mb: f64) -> f64 {
    if mb <= 100.0 {
        1.0
    } else if mb <= 500.0 {
        0.8
    } else if mb <= 1000.0 {
        0.6
    } else {
        0.4
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeQualityValidation {
    pub status: GateStatus,
    pub analysis_performed: bool,
    pub static_analysis_passed: bool,
    pub type_check_passed: bool,
    pub lint_passed: bool,
    pub style_violations: u32,
    pub complexity: f64,
    pub documentation_coverage: f64,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Score given to a code quality gate with nothing to measure.
const UNMEASURED_CODE_QUALITY_SCORE: f64 = 0.5;

impl CodeQualityValidation {
    pub fn score(&self) -> f64 {
        if !self.analysis_performed {
            return UNMEASURED_CODE_QUALITY_SCORE;
        }
        let flag = |ok: bool| if ok { 1.0 } else { 0.0 };
        let complexity = if self.complexity <= 5.0 {
            1.0
        } else if self.complexity <= 10.0 {
            0.7
        } else if self.complexity <= 20.0 {
            0.4
        } else {
            0.1
        };
        let docs = if self.documentation_coverage >= 80.0 {
            1.0
        } else if self.documentation_coverage >= 60.0 {
            0.7
        } else if self.documentation_coverage >= 40.0 {
            0.4
        } else {
            0.1
        };
        (flag(self.static_analysis_passed)
            + flag(self.type_check_passed)
            + flag(self.lint_passed)
            + complexity
            + docs)
            / 5.0
    }
}

/// Aggregate verdict over the four gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityResult {
    pub task_id: TaskId,
    pub overall_status: GateStatus,
    pub tdd: TddValidation,
    pub security: SecurityValidation,
    pub performance: PerformanceValidation,
    pub code_quality: CodeQualityValidation,
    /// Mean of the four component scores, in [0, 1].
    pub score: f64,
    pub critical_issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub validation_duration_secs: f64,
}

impl QualityResult {
    fn assemble(
        task_id: TaskId,
        tdd: TddValidation,
        security: SecurityValidation,
        performance: PerformanceValidation,
        code_quality: CodeQualityValidation,
        validation_duration: Duration,
    ) -> Self {
        let statuses = [tdd.status, security.status, performance.status, code_quality.status];
        let overall_status = if statuses.iter().any(GateStatus::is_failed) {
            GateStatus::Failed
        } else {
            GateStatus::Passed
        };
        let score = (tdd.score() + security.score() + performance.score() + code_quality.score()) / 4.0;

        let mut critical_issues = Vec::new();
        if tdd.tests_failing > 0 {
            critical_issues.push(format!("{} tests are failing", tdd.tests_failing));
        }
        if security.high > 0 {
            critical_issues.push(format!("{} high-severity security vulnerabilities", security.high));
        }
        if !performance.meets_requirements {
            critical_issues.push("Performance requirements not met".to_string());
        }
        if code_quality.analysis_performed && !code_quality.static_analysis_passed {
            critical_issues.push("Static analysis failed".to_string());
        }

        let mut recommendations: Vec<String> = Vec::new();
        for rec in tdd
            .recommendations
            .iter()
            .chain(&security.recommendations)
            .chain(&performance.recommendations)
            .chain(&code_quality.recommendations)
        {
            if !recommendations.contains(rec) {
                recommendations.push(rec.clone());
            }
        }
        if recommendations.is_empty() {
            recommendations.push("Quality gates passed, maintain current standards".to_string());
        }

        Self {
            task_id,
            overall_status,
            tdd,
            security,
            performance,
            code_quality,
            score,
            critical_issues,
            recommendations,
            validation_duration_secs: validation_duration.as_secs_f64(),
        }
    }

    /// Gates whose status is `Failed`, in fixed gate order.
    pub fn failed_gates(&self) -> Vec<QualityGate> {
        [
            (QualityGate::Tdd, self.tdd.status),
            (QualityGate::Security, self.security.status),
            (QualityGate::Performance, self.performance.status),
            (QualityGate::CodeQuality, self.code_quality.status),
        ]
        .into_iter()
        .filter(|(_, status)| status.is_failed())
        .map(|(gate, _)| gate)
        .collect()
    }

    pub fn all_gates_passed(&self) -> bool {
        self.overall_status != GateStatus::Failed
    }

    pub fn gate_status(&self, gate: QualityGate) -> GateStatus {
        match gate {
            QualityGate::Tdd => self.tdd.status,
            QualityGate::Security => self.security.status,
            QualityGate::Performance => self.performance.status,
            QualityGate::CodeQuality => self.code_quality.status,
        }
    }
}

/// Runs the four validators over a task's output.
#[derive(Debug, Clone, Default)]
pub struct QualityGateEngine {
    settings: QualitySettings,
}

impl QualityGateEngine {
    pub fn new(settings: QualitySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &QualitySettings {
        &self.settings
    }

    pub async fn validate(&self, task: &Task, output: &WorkerOutput, execution_time: Duration) -> QualityResult {
        let started = Instant::now();

        let (tdd, security, performance, code_quality) = tokio::join!(
            async { self.validate_tdd(task, output) },
            async { self.validate_security(output) },
            async { self.validate_performance(task, output, execution_time) },
            async { self.validate_code_quality(output) },
        );

        let result = QualityResult::assemble(
            task.id.clone(),
            tdd,
            security,
            performance,
            code_quality,
            started.elapsed(),
        );
        info!(
            task_id = %task.id,
            status = ?result.overall_status,
            score = result.score,
            "Quality validation complete"
        );
        result
    }

    fn validate_tdd(&self, task: &Task, output: &WorkerOutput) -> TddValidation {
        let evidence = &output.evidence;
        let required_coverage = task.quality.min_coverage.unwrap_or(self.settings.min_coverage);
        let mut v = TddValidation {
            status: GateStatus::Passed,
            test_artifacts: output.artifacts.tests.len(),
            tests_executed: 0,
            tests_passing: 0,
            tests_failing: 0,
            test_execution_secs: 0.0,
            coverage_percentage: 0.0,
            required_coverage,
            tdd_followed: evidence.tdd_followed,
            meets_requirements: false,
            issues: Vec::new(),
            recommendations: Vec::new(),
        };

        if output.artifacts.tests.is_empty() {
            v.status = GateStatus::Failed;
            v.issues.push("No test files created".to_string());
            return v;
        }

        match &evidence.tests {
            Some(run) => {
                v.tests_executed = run.total;
                v.tests_passing = run.passing;
                v.tests_failing = run.failing;
                v.test_execution_secs = run.execution_secs;
                if run.failing > 0 {
                    v.status = GateStatus::Failed;
                    v.issues.push(format!("{} tests are failing", run.failing));
                }
                if run.total == 0 {
                    v.status = GateStatus::Failed;
                    v.issues.push("No tests were executed".to_string());
                }
            }
            None => {
                v.status = GateStatus::Failed;
                v.issues.push("No test execution evidence".to_string());
            }
        }

        v.coverage_percentage = evidence.coverage.as_ref().map_or(0.0, |c| c.percentage);
        if v.coverage_percentage < required_coverage {
            v.status = GateStatus::Failed;
            v.issues.push(format!(
                "Test coverage {:.1}% below required {:.1}%",
                v.coverage_percentage, required_coverage
            ));
        }

        if task.quality.red_green_refactor && evidence.tdd_followed == Some(false) {
            v.status = GateStatus::Failed;
            v.issues.push("Red-Green-Refactor cycle not followed".to_string());
        }

        if v.coverage_percentage < 90.0 {
            v.recommendations
                .push("Increase test coverage with additional test cases".to_string());
        }
        if (v.tests_executed as usize) < task.test_cases.len() {
            v.recommendations
                .push("Implement all specified test cases".to_string());
        }

        v.meets_requirements = v.status == GateStatus::Passed;
        debug!(task_id = %task.id, status = ?v.status, coverage = v.coverage_percentage, "TDD gate");
        v
    }

    fn validate_security(&self, output: &WorkerOutput) -> SecurityValidation {
        let mut v = SecurityValidation {
            status: GateStatus::Passed,
            scan_performed: false,
            scan_passed: true,
            high: 0,
            medium: 0,
            low: 0,
            tool: None,
            findings: Vec::new(),
            input_validation: true,
            secure_coding: true,
            meets_requirements: true,
            issues: Vec::new(),
            recommendations: Vec::new(),
        };

        if output.artifacts.implementation.is_empty() {
            return v;
        }

        let Some(scan) = &output.evidence.security else {
            v.status = GateStatus::Warning;
            v.scan_passed = false;
            v.input_validation = false;
            v.secure_coding = false;
            v.meets_requirements = false;
            v.issues.push("No security scan evidence".to_string());
            v.recommendations.push("Run a vulnerability scan over implementation files".to_string());
            return v;
        };

        v.scan_performed = true;
        v.high = scan.high;
        v.medium = scan.medium;
        v.low = scan.low;
        v.tool = scan.tool.clone();
        v.findings = scan.findings.clone();
        v.input_validation = scan.input_validation;
        v.secure_coding = scan.secure_coding;

        if scan.high > 0 {
            v.status = GateStatus::Failed;
            v.scan_passed = false;
            v.issues.push(format!("{} high-severity vulnerabilities", scan.high));
        }
        if scan.medium > self.settings.max_medium_severity {
            v.recommendations
                .push("Address medium severity vulnerabilities".to_string());
        }
        if !scan.input_validation {
            v.recommendations
                .push("Implement comprehensive input validation".to_string());
        }
        if !scan.secure_coding {
            v.recommendations
                .push("Review code against secure coding practices".to_string());
        }

        v.meets_requirements = v.high == 0 && v.scan_passed && v.input_validation && v.secure_coding;
        v
    }

    fn validate_performance(&self, task: &Task, output: &WorkerOutput, execution_time: Duration) -> PerformanceValidation {
        let benchmark = output.evidence.benchmark.as_ref();
        let mut v = PerformanceValidation {
            status: GateStatus::Skipped,
            enforced: task.quality.benchmark,
            benchmark_executed: benchmark.is_some(),
            execution_time_secs: execution_time.as_secs_f64(),
            memory_mb: benchmark.map(|b| b.memory_mb),
            cpu_percentage: benchmark.map(|b| b.cpu_percentage),
            meets_requirements: true,
            issues: Vec::new(),
            recommendations: Vec::new(),
        };

        if v.enforced {
            v.status = GateStatus::Passed;
            let max_time = self.settings.max_execution_time_secs;
            if v.execution_time_secs > max_time {
                v.status = GateStatus::Failed;
                v.issues.push(format!(
                    "Execution time {:.1}s exceeds maximum {:.0}s",
                    v.execution_time_secs, max_time
                ));
            }
            if let Some(memory) = v.memory_mb {
                let max_memory = self.settings.max_memory_mb;
                if memory > max_memory {
                    v.status = GateStatus::Failed;
                    v.issues.push(format!(
                        "Memory usage {:.1}MB exceeds maximum {:.0}MB",
                        memory, max_memory
                    ));
                }
            }
            v.meets_requirements = v.status != GateStatus::Failed;
        }

        if v.execution_time_secs > 60.0 {
            v.recommendations
                .push("Consider performance optimization for long-running operations".to_string());
        }
        v
    }

    fn validate_code_quality(&self, output: &WorkerOutput) -> CodeQualityValidation {
        let mut v = CodeQualityValidation {
            status: GateStatus::Warning,
            analysis_performed: false,
            static_analysis_passed: false,
            type_check_passed: false,
            lint_passed: false,
            style_violations: 0,
            complexity: 0.0,
            documentation_coverage: 0.0,
            issues: Vec::new(),
            recommendations: Vec::new(),
        };

        let analysis = match &output.evidence.analysis {
            Some(analysis) if !output.artifacts.implementation.is_empty() => analysis,
            _ => {
                v.issues.push("No code analysis evidence".to_string());
                return v;
            }
        };

        v.analysis_performed = true;
        v.static_analysis_passed = analysis.static_analysis_passed;
        v.type_check_passed = analysis.type_check_passed;
        v.lint_passed = analysis.lint_passed;
        v.style_violations = analysis.style_violations;
        v.complexity = analysis.complexity;
        v.documentation_coverage = analysis.documentation_coverage;

        let checks = [
            (analysis.static_analysis_passed, "Static analysis failed"),
            (analysis.type_check_passed, "Type checking failed"),
            (analysis.lint_passed, "Linting failed"),
        ];
        for (passed, message) in checks {
            if !passed {
                v.issues.push(message.to_string());
            }
        }
        v.status = if v.issues.is_empty() {
            GateStatus::Passed
        } else {
            GateStatus::Failed
        };

        if analysis.style_violations > 0 {
            v.recommendations.push(format!(
                "Fix {} code style violations",
                analysis.style_violations
            ));
        }
        if analysis.complexity > self.settings.max_complexity {
            v.recommendations
                .push("Reduce code complexity by refactoring complex methods".to_string());
        }
        if analysis.documentation_coverage < self.settings.min_documentation_coverage {
            v.recommendations
                .push("Increase documentation coverage".to_string());
        }
        v
    }
}
