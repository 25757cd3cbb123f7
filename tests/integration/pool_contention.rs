//! Worker pool contention tests.
//!
//! The pool never blocks; the orchestrator queues tasks behind a semaphore
//! sized to pool capacity.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use stratum::core::build_graph;
use stratum::error::PoolError;
use stratum::orchestration::{Orchestrator, RunOptions, SessionId, SessionState, Worker, WorkerPool};
use tokio_test::{assert_err, assert_ok};

use crate::fixtures::{independent_tasks, task, test_config, tid, Harness, MockWorker};

/// Test: Two workers, three ready tasks
/// Given a pool of two workers and one layer of three tasks
/// When the layer runs
/// Then exactly two run at once and the third waits for a release
#[tokio::test]
async fn test_two_workers_three_tasks_queue() {
    let harness = Harness::new(2, MockWorker::new(Duration::from_millis(40)), test_config()).await;
    let graph = build_graph(&independent_tasks(3)).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert_eq!(result.successful_tasks, 3);
    assert_eq!(harness.probe.max_concurrency(), 2);

    let workers: HashSet<_> = result.task_results.iter().filter_map(|r| r.worker_id).collect();
    assert_eq!(workers.len(), 2);

    // The queued task started no earlier than the first finisher.
    let mut finishes: Vec<_> = result.task_results.iter().filter_map(|r| r.finished_at).collect();
    finishes.sort();
    let last_start = result.task_results.iter().map(|r| r.started_at).max().unwrap();
    assert!(last_start >= finishes[0]);
}

/// Test: Capacity bounds a wide layer
/// Given eight independent tasks and three workers
/// When the layer runs
/// Then concurrency never exceeds three
#[tokio::test]
async fn test_concurrency_bounded_by_capacity() {
    let harness = Harness::new(3, MockWorker::new(Duration::from_millis(15)), test_config()).await;
    let graph = build_graph(&independent_tasks(8)).unwrap();

    let result = harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();

    assert!(result.is_successful());
    assert_eq!(harness.probe.max_concurrency(), 3);
    assert_eq!(harness.probe.executions().len(), 8);

    let status = harness.pool.status().await;
    assert_eq!(status.current_load, 0);
    assert_eq!(status.available, 3);
}

/// Test: Acquire fails fast when the pool is full
/// Given a single-worker pool already leased out
/// When a second acquire is attempted
/// Then it returns Exhausted instead of blocking
#[tokio::test]
async fn test_acquire_never_blocks() {
    let worker: Arc<dyn Worker> = Arc::new(MockWorker::new(Duration::ZERO));
    let pool = WorkerPool::with_workers(vec![worker]).await;
    let session = SessionId::new();

    let lease = assert_ok!(pool.acquire(&session, &task("a")).await);
    let err = assert_err!(pool.acquire(&session, &task("b")).await);
    assert_eq!(err, PoolError::Exhausted { capacity: 1, busy: 1 });

    assert_ok!(pool.release(&lease, Some((true, Duration::from_millis(5)))).await);
    assert_ok!(pool.acquire(&session, &task("b")).await);

    let metrics = pool.metrics(&lease.worker_id).await.unwrap();
    assert_eq!(metrics.tasks_completed, 1);
}

/// Test: Worker metrics reflect task outcomes
/// Given a run with one failing task
/// When the session finishes
/// Then the pool records one success and one failure
#[tokio::test]
async fn test_pool_metrics_after_run() {
    let worker = MockWorker::new(Duration::from_millis(5)).failing("bad");
    let harness = Harness::new(1, worker, test_config()).await;
    let graph = build_graph(&[task("good"), task("bad")]).unwrap();

    harness.orchestrator.run(graph, RunOptions::default()).await.unwrap();

    let status = harness.pool.status().await;
    let metrics = &status.workers[0].metrics;
    assert_eq!(metrics.tasks_completed, 1);
    assert_eq!(metrics.tasks_failed, 1);
    assert!((metrics.success_rate - 0.5).abs() < 1e-9);
}

/// Test: Capability matching is a preference, not a filter
/// Given an api worker and a database worker, one slot each
/// When a layer holds two api tasks
/// Then the database worker takes the second task and the session completes
#[tokio::test]
async fn test_capability_mismatch_still_uses_free_workers() {
    let api: Arc<dyn Worker> =
        Arc::new(MockWorker::new(Duration::from_millis(20)).with_categories(&["api"]));
    let database: Arc<dyn Worker> =
        Arc::new(MockWorker::new(Duration::from_millis(20)).with_categories(&["database"]));
    let pool = Arc::new(WorkerPool::with_workers(vec![api, database]).await);
    let orchestrator = Orchestrator::new(Arc::clone(&pool), test_config());
    let graph = build_graph(&[
        task("a").with_category("api"),
        task("b").with_category("api"),
    ])
    .unwrap();

    let result = orchestrator.run(graph, RunOptions::default()).await.unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert!(result.result_for(&tid("b")).unwrap().error.is_none());
    let workers: HashSet<_> = result.task_results.iter().filter_map(|r| r.worker_id).collect();
    assert_eq!(workers.len(), 2);
}
