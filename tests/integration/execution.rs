//! End-to-end session execution tests.
//!
//! These tests drive the orchestrator through complete runs and verify
//! ordering, failure handling, retries, timeouts and session control.

use std::sync::Arc;
use std::time::Duration;

use stratum::core::build_graph;
use stratum::orchestration::{
    ErrorDetail, ExecutionEvent, ExternalStatus, RunOptions, SessionId, SessionState, TaskStatus,
};

use crate::fixtures::{
    chain_tasks, diamond_tasks, drain_events, independent_tasks, task, task_after, test_config, tid,
    Harness, MockWorker, RecordingSink,
};

/// Test: Diamond graph runs to completion
/// Given a -> {b, c} -> d and two workers
/// When the session runs
/// Then every task completes and d starts only after b and c finish
#[tokio::test]
async fn test_diamond_runs_in_layer_order() {
    let harness = Harness::new(2, MockWorker::new(Duration::from_millis(20)), test_config()).await;
    let graph = build_graph(&diamond_tasks()).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert!(result.is_successful());
    assert_eq!(result.successful_tasks, 4);
    assert_eq!(result.parallel_stats.layers_executed, 3);

    let order: Vec<_> = result.task_results.iter().map(|r| r.task_id.clone()).collect();
    assert_eq!(order[0], tid("a"));
    assert_eq!(order[3], tid("d"));

    let d = result.result_for(&tid("d")).unwrap();
    for dep in ["b", "c"] {
        let finished = result.result_for(&tid(dep)).unwrap().finished_at.unwrap();
        assert!(d.started_at >= finished, "d started before {} finished", dep);
    }
    assert_eq!(harness.probe.executions().len(), 4);
}

/// Test: Lifecycle events are broadcast in order
/// Given a chain of two tasks and a subscriber
/// When the session runs
/// Then events go session_started, layer events per layer, session_completed
#[tokio::test]
async fn test_events_follow_session_lifecycle() {
    let harness = Harness::new(1, MockWorker::new(Duration::from_millis(5)), test_config()).await;
    let mut rx = harness.orchestrator.subscribe();
    let graph = build_graph(&chain_tasks(2)).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();
    let events = drain_events(&mut rx);
    let kinds: Vec<&str> = events.iter().map(ExecutionEvent::kind).collect();

    assert_eq!(
        kinds,
        vec![
            "session_started",
            "layer_started",
            "task_started",
            "task_completed",
            "layer_completed",
            "layer_started",
            "task_started",
            "task_completed",
            "layer_completed",
            "session_completed",
        ]
    );
    assert!(events.iter().all(|e| e.session_id() == result.session_id));
}

/// Test: Coverage below the requirement downgrades a successful run
/// Given a worker that reports 80% coverage against the default 95%
/// When the task executes successfully
/// Then the task fails with a quality gate failure naming tdd
#[tokio::test]
async fn test_low_coverage_fails_tdd_gate() {
    let worker = MockWorker::new(Duration::from_millis(5)).with_coverage("a", 80.0);
    let harness = Harness::new(1, worker, test_config()).await;
    let graph = build_graph(&[task("a")]).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();
    let a = result.result_for(&tid("a")).unwrap();

    assert_eq!(a.status, TaskStatus::Failed);
    let error = a.error.as_ref().unwrap();
    assert!(matches!(error, ErrorDetail::QualityGateFailure { .. }));
    assert!(error.to_string().contains("tdd"));
    assert_eq!(a.attempts, 1, "quality failures are never retried");
    assert_eq!(result.state, SessionState::Failed);

    let report = result.report();
    assert_eq!(report.overview.failed_tasks, 1);
    assert!(report.quality.is_some());
}

/// Test: Early stop below the continuation threshold
/// Given a first layer where one of two tasks fails
/// When the layer success rate (50%) is below 80%
/// Then later layers never run and their tasks are cancelled
#[tokio::test]
async fn test_early_stop_cancels_remaining_layers() {
    let worker = MockWorker::new(Duration::from_millis(5)).failing("b");
    let harness = Harness::new(2, worker, test_config()).await;
    let tasks = vec![task("a"), task("b"), task_after("c", &["a"])];
    let graph = build_graph(&tasks).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();

    assert_eq!(result.state, SessionState::Failed);
    assert_eq!(result.result_for(&tid("a")).unwrap().status, TaskStatus::Completed);
    assert_eq!(result.result_for(&tid("b")).unwrap().status, TaskStatus::Failed);
    assert_eq!(result.result_for(&tid("c")).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(result.parallel_stats.layers_executed, 1);
    assert!(result.warnings.iter().any(|w| w.contains("continuation threshold")));
    assert_eq!(harness.probe.count(&tid("c")), 0);
}

/// Test: Failed dependency blocks its dependents
/// Given a zero continuation threshold so the loop keeps going
/// When a prerequisite fails
/// Then the next layer is refused with an unsatisfied dependency error
#[tokio::test]
async fn test_unsatisfied_dependency_stops_session() {
    let mut config = test_config();
    config.execution.continuation_threshold = 0.0;
    let worker = MockWorker::new(Duration::from_millis(5)).failing("a");
    let harness = Harness::new(1, worker, config).await;
    let graph = build_graph(&[task("a"), task_after("b", &["a"])]).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();

    assert_eq!(result.state, SessionState::Failed);
    assert_eq!(result.result_for(&tid("b")).unwrap().status, TaskStatus::Cancelled);
    assert!(result.errors.iter().any(|e| e.contains("b") && e.contains("a")));
    assert_eq!(harness.probe.count(&tid("b")), 0);
}

/// Test: Worker errors are retried up to the budget
/// Given auto retry with max_retries = 2 and an always-failing task
/// When it runs
/// Then it is attempted three times and reported as a worker error
#[tokio::test]
async fn test_retry_budget_exhausted() {
    let mut config = test_config();
    config.execution.auto_retry_failed_tasks = true;
    config.execution.max_retries = 2;
    let worker = MockWorker::new(Duration::from_millis(1)).failing("a");
    let harness = Harness::new(1, worker, config).await;
    let graph = build_graph(&[task("a")]).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();
    let a = result.result_for(&tid("a")).unwrap();

    assert_eq!(a.attempts, 3);
    assert_eq!(harness.probe.count(&tid("a")), 3);
    assert_eq!(
        a.error,
        Some(ErrorDetail::WorkerError {
            message: "mock failure on a".into()
        })
    );
}

/// Test: A panicking worker fails only its own task
/// Given two tasks in one layer where one worker call panics
/// When the layer runs
/// Then the panic becomes a failed result and the sibling completes
#[tokio::test]
async fn test_worker_panic_is_contained() {
    let worker = MockWorker::new(Duration::from_millis(5)).panicking("boom");
    let harness = Harness::new(2, worker, test_config()).await;
    let graph = build_graph(&[task("ok"), task("boom")]).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();

    assert_eq!(result.result_for(&tid("ok")).unwrap().status, TaskStatus::Completed);
    let boom = result.result_for(&tid("boom")).unwrap();
    assert_eq!(boom.status, TaskStatus::Failed);
    match &boom.error {
        Some(ErrorDetail::Panicked { message }) => assert!(message.contains("boom")),
        other => panic!("expected panic detail, got {:?}", other),
    }
    assert_eq!(harness.pool.status().await.current_load, 0);
}

/// Test: Hard timeout on a hung worker
/// Given task_timeout_secs = 1 and a worker that takes 10 seconds
/// When the task runs on a paused clock
/// Then it fails with a timeout and the worker is released
#[tokio::test(start_paused = true)]
async fn test_task_timeout() {
    let mut config = test_config();
    config.execution.task_timeout_secs = 1;
    let harness = Harness::new(1, MockWorker::new(Duration::from_secs(10)), config).await;
    let graph = build_graph(&[task("slow")]).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();
    let slow = result.result_for(&tid("slow")).unwrap();

    assert_eq!(slow.status, TaskStatus::Failed);
    assert_eq!(slow.error, Some(ErrorDetail::Timeout { timeout_secs: 1 }));
    assert_eq!(harness.pool.status().await.current_load, 0);
}

/// Test: Pause mid-layer then resume
/// Given one worker and three independent tasks
/// When the session is paused while the first task runs, then resumed
/// Then no task runs while paused and none runs twice
#[tokio::test]
async fn test_pause_resume_no_double_execution() {
    let harness = Harness::new(1, MockWorker::new(Duration::from_millis(50)), test_config()).await;
    let graph = build_graph(&independent_tasks(3)).unwrap();
    let session_id = SessionId::new();

    let orchestrator = Arc::clone(&harness.orchestrator);
    let run = tokio::spawn(async move {
        orchestrator
            .run(graph, RunOptions::default().with_session_id(session_id))
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(harness.orchestrator.pause(&session_id).await.unwrap());
    assert!(!harness.orchestrator.pause(&session_id).await.unwrap(), "already paused");

    // Let the in-flight task finish, then check nothing new starts.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let snapshot = harness.orchestrator.status(&session_id).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Paused);
    assert_eq!(snapshot.completed_tasks, 1);
    assert_eq!(harness.probe.executions().len(), 1);

    assert!(harness.orchestrator.resume(&session_id).await.unwrap());
    let result = run.await.unwrap().unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert_eq!(result.successful_tasks, 3);
    for task in independent_tasks(3) {
        assert_eq!(harness.probe.count(&task.id), 1, "{} ran more than once", task.id);
    }
}

/// Test: Cancel a running session
/// Given a chain of three tasks
/// When the session is cancelled during the first task
/// Then the in-flight task finishes and the rest are cancelled
#[tokio::test]
async fn test_cancel_skips_unstarted_tasks() {
    let harness = Harness::new(1, MockWorker::new(Duration::from_millis(60)), test_config()).await;
    let graph = build_graph(&chain_tasks(3)).unwrap();
    let session_id = SessionId::new();
    let mut rx = harness.orchestrator.subscribe();

    let orchestrator = Arc::clone(&harness.orchestrator);
    let run = tokio::spawn(async move {
        orchestrator
            .run(graph, RunOptions::default().with_session_id(session_id))
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(harness.orchestrator.cancel(&session_id).await.unwrap());
    let snapshot = harness.orchestrator.status(&session_id).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Cancelled);
    assert_eq!(snapshot.running_tasks, 0);
    let result = run.await.unwrap().unwrap();

    assert_eq!(result.state, SessionState::Cancelled);
    assert_eq!(result.result_for(&tid("t0")).unwrap().status, TaskStatus::Completed);
    assert_eq!(result.cancelled_tasks, 2);
    assert_eq!(harness.probe.executions(), vec![tid("t0")]);
    assert!(harness.orchestrator.active_sessions().await.is_empty());
    assert!(harness.orchestrator.cancel(&session_id).await.is_err(), "session is gone");

    let kinds: Vec<&str> = drain_events(&mut rx).iter().map(ExecutionEvent::kind).collect();
    assert!(kinds.contains(&"session_cancelled"));
    assert_eq!(kinds.last(), Some(&"session_failed"));
}

/// Test: External status sink sees Doing then Done
/// Given a recording sink
/// When two tasks complete
/// Then each task is reported Doing and then Done
#[tokio::test]
async fn test_status_sink_notified() {
    let sink = Arc::new(RecordingSink::default());
    let harness = Harness::new(2, MockWorker::new(Duration::from_millis(5)), test_config())
        .await
        .with_sink(sink.clone());
    let graph = build_graph(&independent_tasks(2)).unwrap();

    harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();

    let calls = sink.calls();
    assert_eq!(calls.len(), 4);
    for task in independent_tasks(2) {
        let statuses: Vec<ExternalStatus> = calls
            .iter()
            .filter(|(id, _)| *id == task.id)
            .map(|(_, status)| *status)
            .collect();
        assert_eq!(statuses, vec![ExternalStatus::Doing, ExternalStatus::Done]);
    }
}

/// Test: A failing status sink does not affect execution
#[tokio::test]
async fn test_failing_sink_is_ignored() {
    let sink = Arc::new(RecordingSink::failing());
    let harness = Harness::new(1, MockWorker::new(Duration::from_millis(5)), test_config())
        .await
        .with_sink(sink.clone());
    let graph = build_graph(&[task("a")]).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert_eq!(sink.calls().len(), 2);
}
