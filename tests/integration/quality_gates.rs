//! Quality gate tests through the orchestrator.
//!
//! Gate logic itself is unit tested next to the engine; these tests check
//! how gate verdicts shape task results and session summaries.

use std::time::Duration;

use stratum::core::{build_graph, QualityRequirements};
use stratum::orchestration::{ErrorDetail, GateStatus, QualityGate, RunOptions, SessionState, TaskStatus};

use crate::fixtures::{independent_tasks, task, test_config, tid, Harness, MockWorker};

/// Test: Clean runs produce a perfect summary
/// Given three tasks with clean evidence
/// When the session completes
/// Then every task is validated with an excellent score
#[tokio::test]
async fn test_quality_summary_for_clean_run() {
    let harness = Harness::new(3, MockWorker::new(Duration::from_millis(5)), test_config()).await;
    let graph = build_graph(&independent_tasks(3)).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();
    let summary = result.quality_summary.as_ref().unwrap();

    assert_eq!(summary.validated_tasks, 3);
    assert_eq!(summary.tasks_with_all_gates_passed, 3);
    assert!((summary.average_score - 1.0).abs() < 1e-9);
    assert_eq!(summary.distribution.excellent, 3);
    for r in &result.task_results {
        let quality = r.quality.as_ref().unwrap();
        assert_eq!(quality.overall_status, GateStatus::Passed);
    }
}

/// Test: Task-level coverage minimum overrides the configured default
/// Given a task requiring 75% and a worker reporting 80%
/// When the task runs
/// Then it completes
#[tokio::test]
async fn test_task_coverage_override() {
    let worker = MockWorker::new(Duration::from_millis(5)).with_coverage("lenient", 80.0);
    let harness = Harness::new(1, worker, test_config()).await;
    let lenient = task("lenient").with_quality(QualityRequirements {
        min_coverage: Some(75.0),
        ..Default::default()
    });
    let graph = build_graph(&[lenient]).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();
    let r = result.result_for(&tid("lenient")).unwrap();

    assert_eq!(r.status, TaskStatus::Completed);
    let quality = r.quality.as_ref().unwrap();
    assert_eq!(quality.tdd.required_coverage, 75.0);
    assert!(quality.tdd.meets_requirements);
    assert!(quality
        .tdd
        .recommendations
        .iter()
        .any(|r| r.contains("Increase test coverage")));
}

/// Test: Disabled gates leave results unvalidated
/// Given quality.enabled = false and a worker reporting 50% coverage
/// When the task runs
/// Then it completes with no quality result
#[tokio::test]
async fn test_disabled_quality_gates() {
    let mut config = test_config();
    config.quality.enabled = false;
    let worker = MockWorker::new(Duration::from_millis(5)).with_coverage("a", 50.0);
    let harness = Harness::new(1, worker, config).await;
    let graph = build_graph(&[task("a")]).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert!(result.task_results[0].quality.is_none());
    assert!(result.quality_summary.is_none());
}

/// Test: Enforced performance ceiling
/// Given a benchmarked task and a 10ms execution ceiling
/// When the worker takes 50ms
/// Then the performance gate fails the task
#[tokio::test]
async fn test_performance_gate_enforced_for_benchmarked_task() {
    let mut config = test_config();
    config.quality.max_execution_time_secs = 0.01;
    let harness = Harness::new(1, MockWorker::new(Duration::from_millis(50)), config).await;
    let benchmarked = task("bench").with_quality(QualityRequirements {
        benchmark: true,
        ..Default::default()
    });
    let graph = build_graph(&[benchmarked, task("plain")]).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();

    let bench = result.result_for(&tid("bench")).unwrap();
    assert_eq!(bench.status, TaskStatus::Failed);
    assert_eq!(
        bench.error,
        Some(ErrorDetail::QualityGateFailure {
            failed_gates: vec![QualityGate::Performance]
        })
    );

    let plain = result.result_for(&tid("plain")).unwrap();
    assert_eq!(plain.status, TaskStatus::Completed);
    assert_eq!(
        plain.quality.as_ref().unwrap().gate_status(QualityGate::Performance),
        GateStatus::Skipped
    );

    let summary = result.quality_summary.unwrap();
    assert_eq!(summary.validated_tasks, 2);
    assert!((summary.all_gates_pass_rate - 0.5).abs() < 1e-9);
}
