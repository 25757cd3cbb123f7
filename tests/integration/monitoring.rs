//! Execution monitor tests through the orchestrator.
//!
//! These tests verify alerts, live session metrics and the global
//! statistics kept across sessions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use stratum::config::ExecutionConfig;
use stratum::core::build_graph;
use stratum::orchestration::{
    Alert, AlertKind, Monitor, Orchestrator, RunOptions, SessionId, Worker, WorkerPool,
};

use crate::fixtures::{independent_tasks, task, test_config, tid, Harness, MockWorker};

fn monitored_config() -> ExecutionConfig {
    let mut config = test_config();
    config.monitoring.enabled = true;
    config
}

fn drain_alerts(rx: &mut tokio::sync::broadcast::Receiver<Alert>) -> Vec<Alert> {
    let mut alerts = Vec::new();
    while let Ok(alert) = rx.try_recv() {
        alerts.push(alert);
    }
    alerts
}

/// Test: Task failures raise a high-severity alert
/// Given a session where one of two tasks fails
/// When the session finishes
/// Then a task_failure alert names the failed task and the session counts as failed
#[tokio::test]
async fn test_task_failure_alert_and_global_stats() {
    let worker = MockWorker::new(Duration::from_millis(5)).failing("bad");
    let harness = Harness::new(2, worker, monitored_config()).await;
    let monitor = harness.orchestrator.monitor().unwrap().clone();
    let mut rx = monitor.subscribe();
    let graph = build_graph(&[task("good"), task("bad")]).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();

    let failures: Vec<Alert> = drain_alerts(&mut rx)
        .into_iter()
        .filter(|a| a.kind == AlertKind::TaskFailure)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].task_id, Some(tid("bad")));
    assert_eq!(failures[0].session_id, result.session_id);

    assert!(!monitor.is_monitoring(result.session_id).await);
    let global = monitor.global_metrics().await;
    assert_eq!(global.total_sessions, 1);
    assert_eq!(global.active_sessions, 0);
    assert_eq!(global.failed_sessions, 1);
    assert_eq!(global.total_tasks_executed, 1);
}

/// Test: Live status carries monitor metrics
/// Given one worker and two tasks
/// When status is queried while the first task runs
/// Then the snapshot includes running metrics
#[tokio::test]
async fn test_status_includes_live_metrics() {
    let harness = Harness::new(1, MockWorker::new(Duration::from_millis(80)), monitored_config()).await;
    let graph = build_graph(&independent_tasks(2)).unwrap();
    let session_id = SessionId::new();

    let orchestrator = Arc::clone(&harness.orchestrator);
    let run = tokio::spawn(async move {
        orchestrator
            .run(graph, RunOptions::default().with_session_id(session_id))
            .await
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    let snapshot = harness.orchestrator.status(&session_id).await.unwrap();
    let metrics = snapshot.metrics.expect("monitor metrics");
    assert_eq!(metrics.total_tasks, 2);
    assert_eq!(metrics.running_tasks, 1);
    assert_eq!(metrics.active_workers, 1);
    assert_eq!(harness.orchestrator.active_sessions().await, vec![session_id]);

    let result = run.await.unwrap().unwrap();
    assert!(result.is_successful());
    assert!(harness.orchestrator.status(&session_id).await.is_none());
}

/// Test: Long-running tasks are flagged
/// Given max_task_duration_secs = 1 and a task that takes 3 seconds
/// When it runs on a paused clock
/// Then one long_running_task alert reaches callbacks
#[tokio::test(start_paused = true)]
async fn test_long_running_task_alert() {
    let mut config = monitored_config();
    config.monitoring.max_task_duration_secs = 1;
    config.execution.task_timeout_secs = 0;
    let harness = Harness::new(1, MockWorker::new(Duration::from_secs(3)), config).await;
    let monitor = harness.orchestrator.monitor().unwrap().clone();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    monitor
        .register_callback(move |alert: &Alert| {
            sink.lock().unwrap().push(alert.kind);
            Ok(())
        })
        .await;

    let graph = build_graph(&[task("slow")]).unwrap();
    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();

    assert!(result.is_successful());
    let kinds = seen.lock().unwrap().clone();
    assert_eq!(kinds, vec![AlertKind::LongRunningTask]);
}

/// Test: A shared monitor aggregates across orchestrators
/// Given two orchestrators sharing one monitor
/// When each runs a successful session
/// Then the global statistics count both
#[tokio::test]
async fn test_shared_monitor_global_metrics() {
    let config = monitored_config();
    let monitor = Monitor::new(config.monitoring.clone());

    for name in ["first", "second"] {
        let worker: Arc<dyn Worker> = Arc::new(MockWorker::new(Duration::from_millis(5)));
        let pool = Arc::new(WorkerPool::with_workers(vec![worker]).await);
        let orchestrator = Orchestrator::new(pool, config.clone()).with_monitor(monitor.clone());
        let graph = build_graph(&[task(name)]).unwrap();
        let result = orchestrator.run(graph, RunOptions::default()).await.unwrap();
        assert!(result.is_successful());
    }

    let global = monitor.global_metrics().await;
    assert_eq!(global.total_sessions, 2);
    assert_eq!(global.successful_sessions, 2);
    assert_eq!(global.total_tasks_executed, 2);
    assert_eq!(global.active_sessions, 0);
}
