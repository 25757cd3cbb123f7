//! Dependency graph and layering tests.
//!
//! These tests build execution graphs from task sets, including task files
//! on disk, and verify layer membership, ordering and schedule offsets.

use stratum::core::{
    build_graph, build_graph_with, detect_conflicts, load_tasks, EdgeKind, GraphBuilder, TaskId,
};
use stratum::error::GraphError;

use crate::fixtures::{chain_tasks, diamond_tasks, independent_tasks, task, task_after, tid};

fn layer_ids(graph: &stratum::core::ExecutionGraph) -> Vec<Vec<TaskId>> {
    graph.layers.iter().map(|l| l.task_ids()).collect()
}

/// Test: Mixed dependencies
/// Given B depends on A, D depends on B and C, C independent
/// When the graph is layered
/// Then layers are [{A, C}, {B}, {D}] with factor 4/3
#[test]
fn test_layers_for_mixed_dependencies() {
    let tasks = vec![
        task("A"),
        task_after("B", &["A"]),
        task("C"),
        task_after("D", &["B", "C"]),
    ];

    let graph = build_graph(&tasks).unwrap();

    assert_eq!(
        layer_ids(&graph),
        vec![vec![tid("A"), tid("C")], vec![tid("B")], vec![tid("D")]]
    );
    assert!((graph.parallelization_factor - 4.0 / 3.0).abs() < 1e-9);
    assert!(graph.validate().is_valid);
}

/// Test: Diamond layering
#[test]
fn test_diamond_layers() {
    let graph = build_graph(&diamond_tasks()).unwrap();

    let sizes: Vec<usize> = graph.layers.iter().map(|l| l.len()).collect();
    assert_eq!(sizes, vec![1, 2, 1]);
    assert_eq!(graph.layer_of(&tid("d")), Some(2));
    assert_eq!(graph.sequential_tasks(), vec![tid("a"), tid("d")]);
}

/// Test: Independent tasks share one layer
#[test]
fn test_independent_tasks_single_layer() {
    let graph = build_graph(&independent_tasks(5)).unwrap();

    assert_eq!(graph.layer_count(), 1);
    assert_eq!(graph.parallelization_factor, 5.0);
    assert_eq!(graph.parallel_share(), 1.0);
}

/// Test: Schedule offsets accumulate layer durations
/// Given a chain with estimates of 10, 20 and 30 minutes
/// When the schedule is computed
/// Then layers run back to back for 60 minutes
#[test]
fn test_chain_schedule_offsets() {
    let tasks: Vec<_> = chain_tasks(3)
        .into_iter()
        .zip([10, 20, 30])
        .map(|(t, minutes)| t.with_duration(minutes))
        .collect();

    let schedule = build_graph(&tasks).unwrap().schedule();

    let offsets: Vec<(u64, u64)> = schedule
        .layers
        .iter()
        .map(|l| (l.start_minutes, l.end_minutes))
        .collect();
    assert_eq!(offsets, vec![(0, 10), (10, 30), (30, 60)]);
    assert_eq!(schedule.estimated_duration_minutes, 60);
    assert_eq!(schedule.layers[2].dependencies_satisfied, vec![tid("t1")]);
}

/// Test: Cycles are rejected before layering
#[test]
fn test_cycle_rejected() {
    let tasks = vec![
        task_after("a", &["c"]),
        task_after("b", &["a"]),
        task_after("c", &["b"]),
    ];

    match build_graph(&tasks) {
        Err(GraphError::CircularDependency { cycle }) => {
            assert!(cycle.len() >= 3);
            assert_eq!(cycle.first(), cycle.last());
        }
        other => panic!("expected a cycle error, got {:?}", other.map(|g| g.total_tasks)),
    }
}

/// Test: Duplicate ids are rejected
#[test]
fn test_duplicate_task_rejected() {
    let err = build_graph(&[task("a"), task("a")]).unwrap_err();
    assert_eq!(err, GraphError::DuplicateTask(tid("a")));
}

/// Test: File inference orders creators before consumers
/// Given one task creating a file and another reading it, with no explicit edge
/// When the graph is built with default strategies
/// Then the reader lands in a later layer
#[test]
fn test_file_inference_adds_edge() {
    let tasks = vec![
        task("reader").with_file("src/model.rs", "read the model types"),
        task("writer").with_file("src/model.rs", "create the model types"),
    ];

    let explicit_only = build_graph(&tasks).unwrap();
    assert_eq!(explicit_only.layer_count(), 1);

    let inferred = build_graph_with(&GraphBuilder::with_default_strategies(), &tasks).unwrap();
    assert_eq!(inferred.layer_count(), 2);
    assert_eq!(inferred.layer_of(&tid("writer")), Some(0));
    assert!(inferred
        .dependency_graph
        .edges()
        .iter()
        .any(|e| e.kind == EdgeKind::File && e.from == tid("reader")));
}

/// Test: Overlapping writers are reported
#[test]
fn test_detect_conflicts() {
    let tasks = vec![
        task("one").with_file("src/lib.rs", "implement the public api"),
        task("two").with_file("src/lib.rs", "write module declarations"),
        task("three").with_file("src/lib.rs", "read exports"),
    ];

    let conflicts = detect_conflicts(&tasks);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].path, "src/lib.rs");
    assert_eq!(conflicts[0].tasks, vec![tid("one"), tid("two")]);
}

/// Test: Task files load and layer
/// Given a TOML task file on disk
/// When it is loaded and built
/// Then the declared dependencies produce two layers
#[test]
fn test_task_file_round_trip_to_graph() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plan.toml");
    std::fs::write(
        &path,
        r#"
[[tasks]]
id = "schema"
title = "Define schema"
estimated_duration_minutes = 15

[[tasks]]
id = "api"
title = "Build api"
depends_on = ["schema"]

[tasks.quality]
min_coverage = 90.0
"#,
    )
    .unwrap();

    let tasks = load_tasks(&path).unwrap();
    let graph = build_graph(&tasks).unwrap();

    assert_eq!(layer_ids(&graph), vec![vec![tid("schema")], vec![tid("api")]]);
    assert_eq!(graph.task(&tid("api")).unwrap().quality.min_coverage, Some(90.0));
}
