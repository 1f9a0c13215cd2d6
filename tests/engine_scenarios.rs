use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use graphflow_core::config::{AppConfig, RetryConfig};
use graphflow_core::error::{GraphflowError, ValidationError};
use graphflow_core::traits::{GraphStore, OperationLedger};
use graphflow_core::types::{GraphEvent, GraphExecutionState, GraphStatus, TaskProgress, TaskStatus};
use graphflow_engine::GraphEngine;
use graphflow_store::SqliteStore;
use graphflow_test_utils::{request_from_edges, scenario_a_edges, FlakyStore, MockScheduler};

struct Harness {
    engine: GraphEngine,
    scheduler: Arc<MockScheduler>,
    store: Arc<SqliteStore>,
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.retry = RetryConfig {
        max_retries: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
    };
    config
}

/// `graphs` backs the engine's graph state; `store` is its ledger and is
/// also what the test inspects directly.
fn build(config: AppConfig, store: Arc<SqliteStore>, graphs: Arc<dyn GraphStore>) -> Harness {
    let scheduler = Arc::new(MockScheduler::new());
    let engine = GraphEngine::new(&config, scheduler.clone(), graphs, store.clone());
    Harness {
        engine,
        scheduler,
        store,
    }
}

fn harness_on(store: Arc<SqliteStore>) -> Harness {
    build(config(), store.clone(), store)
}

fn flaky_harness() -> (Harness, Arc<FlakyStore>) {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let flaky = Arc::new(FlakyStore::new(store.clone()));
    (build(config(), store, flaky.clone()), flaky)
}

fn harness() -> Harness {
    harness_on(Arc::new(SqliteStore::in_memory().unwrap()))
}

fn ids(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Write a task's success straight to the store, as if the process died
/// right after recording it.
async fn mark_succeeded(store: &SqliteStore, graph_id: &str, task_id: &str) {
    let mut state = store.get("wf", graph_id).await.unwrap().unwrap();
    state.tasks.get_mut(task_id).unwrap().status = TaskStatus::Success;
    store.update(&state).await.unwrap();
}

impl Harness {
    async fn report(&self, graph_id: &str, task_id: &str, status: TaskStatus) {
        self.engine
            .report(TaskProgress::new(graph_id, task_id, status))
            .await;
    }

    async fn succeed(&self, graph_id: &str, tasks: &[&str]) {
        for task in tasks {
            self.report(graph_id, task, TaskStatus::Success).await;
        }
    }

    async fn state(&self, workflow_id: &str, graph_id: &str) -> GraphExecutionState {
        self.engine.status(workflow_id, graph_id).await.unwrap()
    }

    /// Task ids submitted since the last call.
    fn take_submitted(&self, graph_id: &str) -> Vec<String> {
        let submitted = self.scheduler.submitted_for(graph_id);
        self.scheduler.clear();
        submitted
    }
}

const SCENARIO_A_TASKS: [&str; 10] = ["1", "2", "3", "4", "5", "6", "7", "8", "9", "10"];

#[tokio::test]
async fn test_scenario_a_fan_out_fan_in() {
    let h = harness();
    let resp = h
        .engine
        .execute(request_from_edges("wf", &SCENARIO_A_TASKS, &scenario_a_edges()))
        .await
        .unwrap();
    let g = resp.graph_id.as_str();
    assert_eq!(resp.status, GraphStatus::Executing);

    let mut first = h.take_submitted(g);
    first.sort_by_key(|s| s.parse::<u32>().unwrap());
    assert_eq!(first, ids(&["1", "3", "5", "7", "9"]));

    // 2 needs both 1 and 3; nothing moves until the whole level is done.
    h.succeed(g, &["1", "5", "7", "9"]).await;
    assert!(h.take_submitted(g).is_empty());
    h.succeed(g, &["3"]).await;

    // 8 also depends on 10, which is only now being dispatched.
    assert_eq!(h.take_submitted(g), ids(&["10", "2", "4", "6"]));
    let state = h.state("wf", g).await;
    assert_eq!(state.task_status("8"), Some(TaskStatus::Waiting));

    h.succeed(g, &["2", "4", "6", "10"]).await;
    assert_eq!(h.take_submitted(g), ids(&["8"]));
    assert_eq!(h.state("wf", g).await.status, GraphStatus::Executing);

    h.succeed(g, &["8"]).await;
    let state = h.state("wf", g).await;
    assert_eq!(state.status, GraphStatus::Completed);
    assert!(state.all_succeeded());
    assert!(h.take_submitted(g).is_empty());

    let op = h.store.operation(&state.operation_id).await.unwrap().unwrap();
    assert!(op.done);
    assert!(op.error.is_none());
    assert!(h.engine.active_graphs().is_empty());
}

#[tokio::test]
async fn test_every_task_dispatched_exactly_once() {
    let h = harness();
    let resp = h
        .engine
        .execute(request_from_edges("wf", &SCENARIO_A_TASKS, &scenario_a_edges()))
        .await
        .unwrap();
    let g = resp.graph_id.as_str();

    for _ in 0..SCENARIO_A_TASKS.len() {
        let pending: Vec<String> = h
            .state("wf", g)
            .await
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queue)
            .map(|t| t.id.clone())
            .collect();
        for task in pending {
            h.report(g, &task, TaskStatus::Executing).await;
            h.report(g, &task, TaskStatus::Success).await;
        }
    }

    assert_eq!(h.state("wf", g).await.status, GraphStatus::Completed);
    for task in SCENARIO_A_TASKS {
        assert_eq!(h.scheduler.submission_count(task), 1, "task {}", task);
    }
}

#[tokio::test]
async fn test_scenario_b_task_error_fails_graph() {
    let h = harness();
    let resp = h
        .engine
        .execute(request_from_edges("wf", &["1", "2", "3"], &[("1", "2"), ("1", "3")]))
        .await
        .unwrap();
    let g = resp.graph_id.as_str();

    h.succeed(g, &["1"]).await;
    assert_eq!(h.take_submitted(g), ids(&["2", "3"]));

    h.engine
        .report(TaskProgress::new(g, "2", TaskStatus::Error).with_description("exit code 3"))
        .await;

    let state = h.state("wf", g).await;
    assert_eq!(state.status, GraphStatus::Failed);
    assert_eq!(state.failed_task_id.as_deref(), Some("2"));
    assert_eq!(state.failed_task_name.as_deref(), Some("task 2"));
    assert_eq!(state.error_description.as_deref(), Some("exit code 3"));
    assert_eq!(state.task_status("1"), Some(TaskStatus::Success));
    assert_eq!(state.task_status("3"), Some(TaskStatus::Error));
    assert_eq!(h.scheduler.stopped_ids(), ids(&["3"]));

    let op = h.store.operation(&state.operation_id).await.unwrap().unwrap();
    assert!(op.done);
    assert_eq!(op.error.as_deref(), Some("exit code 3"));

    // Late reports for a failed graph change nothing.
    h.succeed(g, &["3"]).await;
    assert_eq!(h.state("wf", g).await.task_status("3"), Some(TaskStatus::Error));
    assert!(h.take_submitted(g).is_empty());
}

#[tokio::test]
async fn test_scenario_c_explicit_stop() {
    let h = harness();
    let resp = h
        .engine
        .execute(request_from_edges("wf", &["a", "b", "c"], &[("a", "b")]))
        .await
        .unwrap();
    let g = resp.graph_id.as_str();

    h.report(g, "a", TaskStatus::Executing).await;
    h.succeed(g, &["c"]).await;

    let state = h.engine.stop("wf", g, "cancelled by user").await.unwrap();
    assert_eq!(state.status, GraphStatus::Failed);
    assert_eq!(state.error_description.as_deref(), Some("cancelled by user"));
    assert_eq!(state.task_status("a"), Some(TaskStatus::Error));
    assert_eq!(state.task_status("b"), Some(TaskStatus::Error));
    assert_eq!(state.task_status("c"), Some(TaskStatus::Success));
    assert_eq!(h.scheduler.stopped_ids(), ids(&["a", "b"]));
    assert!(h
        .scheduler
        .stops()
        .iter()
        .all(|s| s.graph_id == g && s.reason == "cancelled by user"));

    // Persisted before the call returned.
    assert_eq!(h.state("wf", g).await.status, GraphStatus::Failed);

    // Stopping again is a no-op.
    let again = h.engine.stop("wf", g, "twice").await.unwrap();
    assert_eq!(again.error_description.as_deref(), Some("cancelled by user"));
    assert_eq!(h.scheduler.stops().len(), 2);
}

#[tokio::test]
async fn test_scenario_d_cycles_dispatch_as_units() {
    let h = harness();
    let resp = h
        .engine
        .execute(request_from_edges(
            "wf",
            &["1", "2", "3", "4", "5"],
            &[("1", "2"), ("2", "1"), ("1", "3"), ("3", "4"), ("4", "5"), ("5", "3")],
        ))
        .await
        .unwrap();
    let g = resp.graph_id.as_str();

    assert_eq!(h.take_submitted(g), ids(&["1", "2"]));
    let state = h.state("wf", g).await;
    assert_eq!(state.tasks["1"].unit, state.tasks["2"].unit);
    assert_eq!(state.tasks["3"].unit, state.tasks["5"].unit);
    assert_ne!(state.tasks["1"].unit, state.tasks["3"].unit);

    h.succeed(g, &["1"]).await;
    assert!(h.take_submitted(g).is_empty());
    h.succeed(g, &["2"]).await;
    assert_eq!(h.take_submitted(g), ids(&["3", "4", "5"]));

    h.succeed(g, &["3", "4", "5"]).await;
    assert_eq!(h.state("wf", g).await.status, GraphStatus::Completed);
}

#[tokio::test]
async fn test_dependency_sets_are_inverse() {
    let h = harness();
    let resp = h
        .engine
        .execute(request_from_edges(
            "wf",
            &["1", "2", "3", "4", "5", "6"],
            &[("1", "2"), ("2", "1"), ("1", "3"), ("3", "4"), ("4", "3"), ("4", "5")],
        ))
        .await
        .unwrap();
    let state = h.state("wf", &resp.graph_id).await;

    for task in state.tasks.values() {
        for dep in &task.depends_on {
            assert!(state.tasks[dep].depended_by.contains(&task.id));
        }
        for dependent in &task.depended_by {
            assert!(state.tasks[dependent].depends_on.contains(&task.id));
        }
    }
    let expected: BTreeSet<String> = ids(&["1", "2", "3", "4"]).into_iter().collect();
    assert_eq!(state.tasks["5"].depends_on, expected);
    assert!(state.tasks["6"].depends_on.is_empty());
    assert!(state.tasks["1"].depends_on.contains("2"));
}

#[tokio::test]
async fn test_scenario_e_resume_after_restart() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let first = harness_on(store.clone());
    let resp = first
        .engine
        .execute(request_from_edges(
            "wf",
            &["a", "b", "c", "d"],
            &[("a", "c"), ("b", "c"), ("c", "d")],
        ))
        .await
        .unwrap();
    let g = resp.graph_id.clone();
    first.succeed(&g, &["a"]).await;
    first.report(&g, "b", TaskStatus::Executing).await;
    first.engine.shutdown();

    let second = harness_on(store);
    assert_eq!(second.engine.resume().await.unwrap(), 1);
    assert!(second.scheduler.submissions().is_empty());
    assert_eq!(second.engine.active_graphs(), vec![g.clone()]);

    second.succeed(&g, &["b"]).await;
    assert_eq!(second.take_submitted(&g), ids(&["c"]));
    second.succeed(&g, &["c"]).await;
    assert_eq!(second.take_submitted(&g), ids(&["d"]));
    second.succeed(&g, &["d"]).await;

    let state = second.state("wf", &g).await;
    assert_eq!(state.status, GraphStatus::Completed);
    assert_eq!(first.scheduler.submitted_for(&g), ids(&["a", "b"]));
}

#[tokio::test]
async fn test_resume_skips_finished_graphs() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let first = harness_on(store.clone());
    let resp = first
        .engine
        .execute(request_from_edges("wf", &["a"], &[]))
        .await
        .unwrap();
    first.succeed(&resp.graph_id, &["a"]).await;
    first.engine.shutdown();

    let second = harness_on(store);
    assert_eq!(second.engine.resume().await.unwrap(), 0);
}

#[tokio::test]
async fn test_stop_after_restart_without_resume() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let first = harness_on(store.clone());
    let resp = first
        .engine
        .execute(request_from_edges("wf", &["a", "b"], &[("a", "b")]))
        .await
        .unwrap();
    first.engine.shutdown();

    let second = harness_on(store);
    let state = second.engine.stop("wf", &resp.graph_id, "operator").await.unwrap();
    assert_eq!(state.status, GraphStatus::Failed);
    assert_eq!(second.scheduler.stopped_ids(), ids(&["a", "b"]));
}

#[tokio::test]
async fn test_idempotent_execute() {
    let h = harness();
    let mut request = request_from_edges("wf", &["a", "b"], &[("a", "b")]);
    request.idempotency_key = Some("submit-42".into());

    let first = h.engine.execute(request.clone()).await.unwrap();
    let second = h.engine.execute(request).await.unwrap();

    assert_eq!(first.graph_id, second.graph_id);
    assert_eq!(second.status, GraphStatus::Executing);
    assert_eq!(h.scheduler.submission_count("a"), 1);
    assert_eq!(h.engine.list("wf").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_validation_errors_have_no_side_effects() {
    let h = harness();

    let unknown_channel = {
        let mut request = request_from_edges("wf", &["a"], &[]);
        request.tasks[0] = request.tasks[0].clone().reads("x", "nowhere");
        request
    };
    let err = h.engine.execute(unknown_channel).await.unwrap_err();
    assert!(matches!(
        err,
        GraphflowError::Validation(ValidationError::UnknownChannel { .. })
    ));

    let mut empty = request_from_edges("wf", &["a"], &[]);
    empty.tasks.clear();
    let err = h.engine.execute(empty).await.unwrap_err();
    assert!(matches!(err, GraphflowError::Validation(ValidationError::NoTasks)));

    let mut unnamed = request_from_edges("wf", &["a"], &[]);
    unnamed.workflow_name = String::new();
    let err = h.engine.execute(unnamed).await.unwrap_err();
    assert!(matches!(
        err,
        GraphflowError::Validation(ValidationError::EmptyField("workflow_name"))
    ));

    assert!(h.scheduler.submissions().is_empty());
    assert!(h.engine.list("wf").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_dispatch_failures_are_retried() {
    let h = harness();
    h.scheduler.fail_next_submits(2);

    let resp = h
        .engine
        .execute(request_from_edges("wf", &["a"], &[]))
        .await
        .unwrap();
    assert_eq!(resp.status, GraphStatus::Executing);
    assert_eq!(h.scheduler.submission_count("a"), 1);
}

#[tokio::test]
async fn test_exhausted_dispatch_retries_fail_graph() {
    let h = harness();
    h.scheduler.fail_next_submits(10);

    let resp = h
        .engine
        .execute(request_from_edges("wf", &["a"], &[]))
        .await
        .unwrap();
    assert_eq!(resp.status, GraphStatus::Failed);

    let state = h.state("wf", &resp.graph_id).await;
    assert_eq!(state.failed_task_id.as_deref(), Some("a"));
    let op = h.store.operation(&state.operation_id).await.unwrap().unwrap();
    assert!(op.error.is_some());
}

#[tokio::test]
async fn test_rejected_dispatch_fails_graph() {
    let h = harness();
    h.scheduler.reject_task("b");

    let resp = h
        .engine
        .execute(request_from_edges("wf", &["a", "b", "c"], &[]))
        .await
        .unwrap();
    assert_eq!(resp.status, GraphStatus::Failed);

    let state = h.state("wf", &resp.graph_id).await;
    assert_eq!(state.failed_task_id.as_deref(), Some("b"));
    assert_eq!(state.task_status("b"), Some(TaskStatus::Error));
    assert_eq!(state.task_status("c"), Some(TaskStatus::Error));
    // a was already submitted, c was queued but never sent.
    assert_eq!(h.scheduler.stopped_ids(), ids(&["a", "c"]));
    assert_eq!(h.scheduler.submitted_for(&resp.graph_id), ids(&["a"]));
}

#[tokio::test]
async fn test_stale_and_duplicate_progress_ignored() {
    let h = harness();
    let resp = h
        .engine
        .execute(request_from_edges("wf", &["a", "b"], &[("a", "b")]))
        .await
        .unwrap();
    let g = resp.graph_id.as_str();
    h.take_submitted(g);

    // b was never dispatched.
    h.succeed(g, &["b"]).await;
    assert_eq!(h.state("wf", g).await.task_status("b"), Some(TaskStatus::Waiting));

    h.succeed(g, &["a"]).await;
    h.succeed(g, &["a"]).await;
    h.report(g, "a", TaskStatus::Executing).await;
    assert_eq!(h.take_submitted(g), ids(&["b"]));
    assert_eq!(h.state("wf", g).await.task_status("a"), Some(TaskStatus::Success));

    h.report(g, "b", TaskStatus::Executing).await;
    h.report(g, "b", TaskStatus::Queue).await;
    assert_eq!(h.state("wf", g).await.task_status("b"), Some(TaskStatus::Executing));

    h.report(g, "ghost", TaskStatus::Success).await;
    assert_eq!(h.state("wf", g).await.status, GraphStatus::Executing);
}

#[tokio::test]
async fn test_versions_advance_with_each_write() {
    let h = harness();
    let resp = h
        .engine
        .execute(request_from_edges("wf", &["a", "b"], &[("a", "b")]))
        .await
        .unwrap();
    let g = resp.graph_id.as_str();

    let v0 = h.state("wf", g).await.version;
    h.report(g, "a", TaskStatus::Executing).await;
    let v1 = h.state("wf", g).await.version;
    h.succeed(g, &["a"]).await;
    let v2 = h.state("wf", g).await.version;
    assert!(v0 < v1 && v1 < v2);
}

#[tokio::test]
async fn test_events_published() {
    let h = harness();
    let mut events = h.engine.subscribe();
    let resp = h
        .engine
        .execute(request_from_edges("wf", &["a"], &[]))
        .await
        .unwrap();
    h.succeed(&resp.graph_id, &["a"]).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&GraphEvent::GraphStarted {
        graph_id: resp.graph_id.clone(),
        workflow_id: "wf".into(),
    }));
    assert!(seen.contains(&GraphEvent::TaskDispatched {
        graph_id: resp.graph_id.clone(),
        task_id: "a".into(),
    }));
    // Task status changes go out only after the state holding them is stored.
    let started = seen
        .iter()
        .position(|e| matches!(e, GraphEvent::GraphStarted { .. }))
        .unwrap();
    let queued = seen
        .iter()
        .position(|e| {
            *e == GraphEvent::TaskStatusChanged {
                graph_id: resp.graph_id.clone(),
                task_id: "a".into(),
                status: TaskStatus::Queue,
            }
        })
        .unwrap();
    assert!(started < queued);
    assert_eq!(
        seen.last(),
        Some(&GraphEvent::GraphCompleted {
            graph_id: resp.graph_id.clone()
        })
    );
}

#[tokio::test]
async fn test_listener_drives_concurrent_graphs() {
    let h = Arc::new(harness());
    let mut events = h.engine.subscribe();

    let one = h
        .engine
        .execute(request_from_edges("wf", &["a", "b"], &[("a", "b")]))
        .await
        .unwrap();
    let two = h
        .engine
        .execute(request_from_edges("wf", &["x", "y"], &[("x", "y")]))
        .await
        .unwrap();

    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let listener = {
        let h = h.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { h.engine.listen(rx, cancel).await })
    };

    tx.send(TaskProgress::new(&one.graph_id, "a", TaskStatus::Success)).await.unwrap();
    tx.send(TaskProgress::new(&two.graph_id, "x", TaskStatus::Success)).await.unwrap();

    let mut completed = BTreeSet::new();
    let mut second_level_sent = BTreeSet::new();
    while completed.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("graphs finish in time")
            .unwrap();
        match event {
            GraphEvent::TaskDispatched { graph_id, task_id }
                if (task_id == "b" || task_id == "y") && second_level_sent.insert(task_id.clone()) =>
            {
                tx.send(TaskProgress::new(graph_id, task_id, TaskStatus::Success))
                    .await
                    .unwrap();
            }
            GraphEvent::GraphCompleted { graph_id } => {
                completed.insert(graph_id);
            }
            _ => {}
        }
    }

    cancel.cancel();
    listener.await.unwrap();
    assert_eq!(h.state("wf", &one.graph_id).await.status, GraphStatus::Completed);
    assert_eq!(h.state("wf", &two.graph_id).await.status, GraphStatus::Completed);
}

#[tokio::test]
async fn test_repeated_key_after_failed_start_returns_failure() {
    let (h, flaky) = flaky_harness();
    flaky.fail_inserts();
    let mut request = request_from_edges("wf", &["a"], &[]);
    request.idempotency_key = Some("k".into());

    let first = h.engine.execute(request.clone()).await.unwrap_err();
    assert!(matches!(first, GraphflowError::Database(_)));

    match h.engine.execute(request).await.unwrap_err() {
        GraphflowError::StartFailed { reason, .. } => assert!(reason.contains("disk full")),
        other => panic!("expected start failure, got {:?}", other),
    }
    assert!(h.scheduler.submissions().is_empty());
    assert!(h.engine.list("wf").await.unwrap().is_empty());
    assert!(h.engine.active_graphs().is_empty());
}

#[tokio::test]
async fn test_no_task_events_for_graph_never_stored() {
    let (h, flaky) = flaky_harness();
    flaky.fail_inserts();
    let mut events = h.engine.subscribe();

    h.engine
        .execute(request_from_edges("wf", &["a", "b"], &[]))
        .await
        .unwrap_err();

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, GraphEvent::TaskStatusChanged { .. } | GraphEvent::GraphStarted { .. }),
            "unexpected event {:?}",
            event
        );
    }
}

#[tokio::test]
async fn test_slow_graph_does_not_hold_up_listener() {
    let mut config = config();
    config.engine.worker_queue = 1;
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let h = Arc::new(build(config, store.clone(), store));
    h.scheduler.hold_task("b");
    let mut events = h.engine.subscribe();

    let slow = h
        .engine
        .execute(request_from_edges("wf", &["a", "b"], &[("a", "b")]))
        .await
        .unwrap();
    let fast = h
        .engine
        .execute(request_from_edges("wf", &["x", "y"], &[("x", "y")]))
        .await
        .unwrap();

    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let listener = {
        let h = h.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { h.engine.listen(rx, cancel).await })
    };

    // The slow worker parks dispatching b; later reports pile up on its lane.
    for _ in 0..3 {
        tx.send(TaskProgress::new(&slow.graph_id, "a", TaskStatus::Success))
            .await
            .unwrap();
    }
    tx.send(TaskProgress::new(&fast.graph_id, "x", TaskStatus::Success))
        .await
        .unwrap();

    let fast_advanced = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let GraphEvent::TaskDispatched { graph_id, task_id } = events.recv().await.unwrap() {
                if graph_id == fast.graph_id && task_id == "y" {
                    break;
                }
            }
        }
    })
    .await;
    assert!(fast_advanced.is_ok(), "fast graph waited on the slow one");

    h.scheduler.release_held();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let GraphEvent::TaskDispatched { graph_id, task_id } = events.recv().await.unwrap() {
                if graph_id == slow.graph_id && task_id == "b" {
                    break;
                }
            }
        }
    })
    .await
    .expect("slow graph resumes once released");

    cancel.cancel();
    listener.await.unwrap();
    assert_eq!(h.scheduler.submission_count("b"), 1);
}

#[tokio::test]
async fn test_exhausted_persistence_fails_graph() {
    let (h, flaky) = flaky_harness();
    let resp = h
        .engine
        .execute(request_from_edges("wf", &["a", "b"], &[("a", "b")]))
        .await
        .unwrap();
    let g = resp.graph_id.as_str();
    let operation_id = h.state("wf", g).await.operation_id;

    flaky.fail_next_updates(100);
    h.report(g, "a", TaskStatus::Executing).await;

    let op = h.store.operation(&operation_id).await.unwrap().unwrap();
    assert!(op.done);
    assert!(op
        .error
        .as_deref()
        .unwrap()
        .starts_with("failed to persist graph state"));
    assert_eq!(h.scheduler.stopped_ids(), ids(&["a", "b"]));
    assert!(h.engine.active_graphs().is_empty());
    // Nothing could be written, so the store still shows the graph running.
    assert_eq!(h.state("wf", g).await.status, GraphStatus::Executing);

    // Once the store is back, a restart closes the graph instead of running it.
    flaky.heal();
    let restarted = build(config(), h.store.clone(), flaky.clone());
    assert_eq!(restarted.engine.resume().await.unwrap(), 1);
    let state = restarted.state("wf", g).await;
    assert_eq!(state.status, GraphStatus::Failed);
    assert!(restarted.scheduler.submissions().is_empty());
}

#[tokio::test]
async fn test_version_conflict_relinquishes_graph() {
    let h = harness();
    let resp = h
        .engine
        .execute(request_from_edges("wf", &["a", "b"], &[("a", "b")]))
        .await
        .unwrap();
    let g = resp.graph_id.as_str();
    assert_eq!(h.take_submitted(g), ids(&["a"]));

    // Another writer updates the record first.
    let taken = h.state("wf", g).await;
    h.store.update(&taken).await.unwrap();

    h.succeed(g, &["a"]).await;
    assert!(h.take_submitted(g).is_empty());
    assert!(h.scheduler.stops().is_empty());
    assert!(h.engine.active_graphs().is_empty());

    let state = h.state("wf", g).await;
    assert_eq!(state.version, taken.version + 1);
    assert_eq!(state.task_status("a"), Some(TaskStatus::Queue));
    let op = h.store.operation(&state.operation_id).await.unwrap().unwrap();
    assert!(!op.done);
}

#[tokio::test]
async fn test_failing_stop_calls_do_not_block_failure() {
    let h = harness();
    h.scheduler.fail_stops();
    let resp = h
        .engine
        .execute(request_from_edges("wf", &["a", "b"], &[("a", "b")]))
        .await
        .unwrap();
    let g = resp.graph_id.as_str();

    let state = h.engine.stop("wf", g, "operator").await.unwrap();
    assert_eq!(state.status, GraphStatus::Failed);
    assert_eq!(h.state("wf", g).await.status, GraphStatus::Failed);

    // Each stop is retried, then given up on.
    let stops = h.scheduler.stops();
    assert_eq!(stops.iter().filter(|s| s.task_id == "a").count(), 4);
    assert_eq!(stops.iter().filter(|s| s.task_id == "b").count(), 4);
    let op = h.store.operation(&state.operation_id).await.unwrap().unwrap();
    assert_eq!(op.error.as_deref(), Some("operator"));
}

#[tokio::test]
async fn test_resume_advances_settled_frontier() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let first = harness_on(store.clone());
    let resp = first
        .engine
        .execute(request_from_edges("wf", &["a", "b"], &[("a", "b")]))
        .await
        .unwrap();
    let g = resp.graph_id.clone();
    first.engine.shutdown();
    mark_succeeded(&store, &g, "a").await;

    let second = harness_on(store);
    assert_eq!(second.engine.resume().await.unwrap(), 1);
    assert_eq!(second.scheduler.submitted_ids(), ids(&["b"]));
    assert_eq!(second.state("wf", &g).await.task_status("b"), Some(TaskStatus::Queue));

    second.succeed(&g, &["b"]).await;
    assert_eq!(second.state("wf", &g).await.status, GraphStatus::Completed);
}

#[tokio::test]
async fn test_resume_closes_graph_with_failed_operation() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let first = harness_on(store.clone());
    let resp = first
        .engine
        .execute(request_from_edges("wf", &["a", "b"], &[("a", "b")]))
        .await
        .unwrap();
    let g = resp.graph_id.clone();
    first.engine.shutdown();
    let operation_id = first.state("wf", &g).await.operation_id;
    store.fail(&operation_id, "cancelled elsewhere").await.unwrap();

    let second = harness_on(store);
    assert_eq!(second.engine.resume().await.unwrap(), 1);

    let state = second.state("wf", &g).await;
    assert_eq!(state.status, GraphStatus::Failed);
    assert_eq!(state.error_description.as_deref(), Some("cancelled elsewhere"));
    assert_eq!(second.scheduler.stopped_ids(), ids(&["a", "b"]));
    assert!(second.scheduler.submissions().is_empty());
    assert!(second.engine.active_graphs().is_empty());
}

#[tokio::test]
async fn test_stop_after_restart_dispatches_nothing() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let first = harness_on(store.clone());
    let resp = first
        .engine
        .execute(request_from_edges("wf", &["a", "b"], &[("a", "b")]))
        .await
        .unwrap();
    let g = resp.graph_id.clone();
    first.engine.shutdown();
    mark_succeeded(&store, &g, "a").await;

    let second = harness_on(store);
    let state = second.engine.stop("wf", &g, "operator").await.unwrap();
    assert_eq!(state.status, GraphStatus::Failed);
    assert_eq!(state.task_status("a"), Some(TaskStatus::Success));
    assert_eq!(state.task_status("b"), Some(TaskStatus::Error));
    assert!(second.scheduler.submissions().is_empty());
    assert_eq!(second.scheduler.stopped_ids(), ids(&["b"]));
}
