//! End-to-end worker scenarios over an in-memory bridge.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use belay::proto::{
    activity_task_completion, workflow_activation_completion, workflow_activation_job, FireTimer,
    RemoveFromCache, WorkflowActivation,
};
use belay::{ActivityError, ActivityRegistry, WorkerError, WorkerState};

use support::*;

const COMPLETED_42: &str = r#"{"status":{"completed":{"result":42}}}"#;

fn completed_result(completion: &belay::proto::WorkflowActivationCompletion) -> serde_json::Value {
    match completion.status.as_ref().unwrap() {
        workflow_activation_completion::Status::Successful(success) => {
            belay::messages::json_from_payload(success.result.as_ref().unwrap()).unwrap()
        }
        other => panic!("expected successful completion, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_workflow_completes_with_result() {
    let dir = workflows_dir(&static_report_interface(COMPLETED_42));
    let bridge = InMemoryBridge::new();
    let worker = build_worker(test_config(dir.path()), &bridge, ActivityRegistry::new());

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    bridge.push_activation(start_activation("r1", "order"));
    assert!(
        wait_until(Duration::from_secs(5), || {
            !bridge.workflow_completions().is_empty()
        })
        .await
    );

    let completions = bridge.workflow_completions();
    assert_eq!(completions[0].run_id, "r1");
    assert_eq!(completed_result(&completions[0]), serde_json::json!(42));
    assert!(
        wait_until(Duration::from_secs(2), || worker.in_flight_activations() == 0).await
    );

    worker.shutdown().await.unwrap();
    runner.await.unwrap().unwrap();
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(bridge.shutdown_completed.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn eviction_mid_run_closes_the_group() {
    let dir = workflows_dir(&static_report_interface(COMPLETED_42));
    let bridge = InMemoryBridge::new();
    let worker = build_worker(test_config(dir.path()), &bridge, ActivityRegistry::new());

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    bridge.push_activation(start_activation("r1", "order"));
    assert!(
        wait_until(Duration::from_secs(5), || {
            bridge.workflow_completions().len() == 1
        })
        .await
    );
    assert_eq!(worker.running_workflows(), 1);

    bridge.push_activation(jobs_activation(
        "r1",
        vec![
            workflow_activation_job::Variant::FireTimer(FireTimer { seq: 1 }),
            workflow_activation_job::Variant::RemoveFromCache(RemoveFromCache {
                message: "cache full".to_string(),
            }),
        ],
    ));
    assert!(
        wait_until(Duration::from_secs(5), || {
            bridge.workflow_completions().len() == 2
        })
        .await
    );

    let completions = bridge.workflow_completions();
    assert!(completions.iter().all(|c| c.run_id == "r1"));
    assert!(
        wait_until(Duration::from_secs(2), || worker.running_workflows() == 0).await,
        "sandbox slot not released after eviction"
    );

    worker.shutdown().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn activity_not_found_synthesizes_failure() {
    let dir = workflows_dir(&static_report_interface(COMPLETED_42));
    let bridge = InMemoryBridge::new();
    let worker = build_worker(test_config(dir.path()), &bridge, ActivityRegistry::new());

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    bridge.push_activity_task(activity_start_task(&[7], r#"["bad","f"]"#, vec![]));
    assert!(
        wait_until(Duration::from_secs(5), || {
            !bridge.activity_completions().is_empty()
        })
        .await
    );

    let completions = bridge.activity_completions();
    assert_eq!(completions[0].task_token, vec![7]);
    match completions[0].status.as_ref().unwrap() {
        activity_task_completion::Status::Failed(failed) => {
            assert_eq!(
                failed.failure.as_ref().unwrap().message,
                "Activity module not found: bad"
            );
        }
        other => panic!("expected failure, got {other:?}"),
    }
    // No handle was ever created.
    assert_eq!(worker.in_flight_activities(), 0);

    worker.shutdown().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_before_start_is_ignored() {
    let dir = workflows_dir(&static_report_interface(COMPLETED_42));
    let bridge = InMemoryBridge::new();
    let worker = build_worker(test_config(dir.path()), &bridge, ActivityRegistry::new());

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    bridge.push_activity_task(activity_cancel_task(&[9, 9]));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(bridge.activity_completions().is_empty());
    assert_eq!(worker.in_flight_activities(), 0);

    worker.shutdown().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_drain_timeout_fails_the_worker() {
    let dir = workflows_dir(&spinning_interface());
    let bridge = InMemoryBridge::new();
    let config = test_config(dir.path())
        .with_isolate_execution_timeout(Duration::from_millis(500))
        .with_shutdown_grace_time(Duration::from_millis(100));
    let worker = build_worker(config, &bridge, ActivityRegistry::new());

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    bridge.push_activation(start_activation("r1", "order"));
    assert!(
        wait_until(Duration::from_secs(5), || worker.in_flight_activations() == 1).await
    );

    worker.shutdown().await.unwrap();
    let result = runner.await.unwrap();
    assert!(matches!(
        result,
        Err(WorkerError::GracefulShutdownPeriodExpired { grace_ms: 100 })
    ));
    assert_eq!(worker.state(), WorkerState::Failed);
    // De-registration still happens on the failure path.
    assert!(bridge.shutdown_completed.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_run_completion_rejection_evicts_only_that_run() {
    let dir = workflows_dir(&static_report_interface(COMPLETED_42));
    let bridge = InMemoryBridge::new();
    let worker = build_worker(test_config(dir.path()), &bridge, ActivityRegistry::new());
    bridge.reject_next_completion("r1");

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    bridge.push_activation(start_activation("r1", "order"));
    bridge.push_activation(start_activation("r2", "order"));

    // r2 completes normally; r1's completion is rejected and the run is
    // evicted through the feedback channel.
    assert!(
        wait_until(Duration::from_secs(5), || {
            bridge
                .workflow_completions()
                .iter()
                .any(|c| c.run_id == "r2")
        })
        .await
    );
    assert!(
        wait_until(Duration::from_secs(5), || worker.running_workflows() == 1).await,
        "rejected run should have been evicted"
    );
    assert_eq!(worker.state(), WorkerState::Running);
    assert!(bridge
        .workflow_completions()
        .iter()
        .all(|c| c.run_id == "r2"));

    worker.shutdown().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn activity_runs_heartbeats_and_completes() {
    let dir = workflows_dir(&static_report_interface(COMPLETED_42));
    let bridge = InMemoryBridge::new();
    let mut registry = ActivityRegistry::new();
    registry.register("greetings", "hello", |ctx, args| async move {
        ctx.heartbeat(vec![serde_json::json!("halfway")]);
        let name = args[0].as_str().unwrap_or("nobody").to_string();
        Ok(serde_json::json!(format!("hello {name}")))
    });
    let worker = build_worker(test_config(dir.path()), &bridge, registry);

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    bridge.push_activity_task(activity_start_task(
        &[1],
        r#"["greetings","hello"]"#,
        vec![serde_json::json!("world")],
    ));
    assert!(
        wait_until(Duration::from_secs(5), || {
            !bridge.activity_completions().is_empty()
        })
        .await
    );

    let completions = bridge.activity_completions();
    match completions[0].status.as_ref().unwrap() {
        activity_task_completion::Status::Completed(completed) => {
            let value =
                belay::messages::json_from_payload(completed.result.as_ref().unwrap()).unwrap();
            assert_eq!(value, serde_json::json!("hello world"));
        }
        other => panic!("expected completed, got {other:?}"),
    }
    assert!(
        wait_until(Duration::from_secs(2), || !bridge.heartbeats().is_empty()).await,
        "heartbeat should have been forwarded"
    );
    assert_eq!(bridge.heartbeats()[0].task_token, vec![1]);

    worker.shutdown().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_surfaces_through_the_running_activity() {
    let dir = workflows_dir(&static_report_interface(COMPLETED_42));
    let bridge = InMemoryBridge::new();
    let mut registry = ActivityRegistry::new();
    registry.register("slow", "wait", |ctx, _args| async move {
        ctx.cancelled().await;
        Err(ActivityError::Cancelled {
            details: vec![serde_json::json!("rolled back")],
        })
    });
    let worker = build_worker(test_config(dir.path()), &bridge, registry);

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    bridge.push_activity_task(activity_start_task(&[3], r#"["slow","wait"]"#, vec![]));
    assert!(
        wait_until(Duration::from_secs(5), || worker.in_flight_activities() == 1).await
    );

    bridge.push_activity_task(activity_cancel_task(&[3]));
    assert!(
        wait_until(Duration::from_secs(5), || {
            !bridge.activity_completions().is_empty()
        })
        .await
    );

    let completions = bridge.activity_completions();
    match completions[0].status.as_ref().unwrap() {
        activity_task_completion::Status::Cancelled(cancelled) => {
            let details =
                belay::messages::json_from_payload(&cancelled.details[0]).unwrap();
            assert_eq!(details, serde_json::json!("rolled back"));
        }
        other => panic!("expected cancelled, got {other:?}"),
    }
    assert_eq!(worker.in_flight_activities(), 0);

    worker.shutdown().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn activation_with_no_jobs_is_a_fatal_invariant_error() {
    let dir = workflows_dir(&static_report_interface(COMPLETED_42));
    let bridge = InMemoryBridge::new();
    let worker = build_worker(test_config(dir.path()), &bridge, ActivityRegistry::new());

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    bridge.push_activation(WorkflowActivation {
        run_id: "r1".to_string(),
        timestamp_ms: 1,
        is_replaying: false,
        jobs: vec![],
    });

    let result = runner.await.unwrap();
    assert!(matches!(result, Err(WorkerError::IllegalState(_))));
    assert_eq!(worker.state(), WorkerState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn eviction_for_unknown_run_produces_no_completion() {
    let dir = workflows_dir(&static_report_interface(COMPLETED_42));
    let bridge = InMemoryBridge::new();
    let worker = build_worker(test_config(dir.path()), &bridge, ActivityRegistry::new());

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    bridge.push_activation(jobs_activation(
        "never-seen",
        vec![workflow_activation_job::Variant::RemoveFromCache(
            RemoveFromCache {
                message: "server cache churn".to_string(),
            },
        )],
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(bridge.workflow_completions().is_empty());
    assert_eq!(worker.state(), WorkerState::Running);
    assert_eq!(worker.in_flight_activations(), 0);

    worker.shutdown().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn suspension_stops_new_polls() {
    let dir = workflows_dir(&static_report_interface(COMPLETED_42));
    let bridge = InMemoryBridge::new();
    let worker = build_worker(test_config(dir.path()), &bridge, ActivityRegistry::new());

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    bridge.push_activation(start_activation("r1", "order"));
    assert!(
        wait_until(Duration::from_secs(5), || {
            bridge.workflow_completions().len() == 1
        })
        .await
    );

    worker.suspend_polling().unwrap();
    assert_eq!(worker.state(), WorkerState::Suspended);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let polls_during_suspension = bridge.workflow_polls.load(Ordering::SeqCst);

    // Tasks pushed now may still be drained by polls that were already in
    // flight when we suspended, but no new poll call may be issued.
    bridge.push_activation(start_activation("r2", "order"));
    bridge.push_activation(start_activation("r3", "order"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        bridge.workflow_polls.load(Ordering::SeqCst),
        polls_during_suspension,
        "polls were issued during the suspended interval"
    );

    worker.resume_polling().unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            bridge.workflow_completions().len() == 3
        })
        .await
    );
    assert!(bridge.workflow_polls.load(Ordering::SeqCst) >= polls_during_suspension);

    worker.shutdown().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_walks_the_drain_states_in_order() {
    let dir = workflows_dir(&static_report_interface(COMPLETED_42));
    let bridge = InMemoryBridge::new();
    let worker = build_worker(test_config(dir.path()), &bridge, ActivityRegistry::new());
    let mut transitions = worker.subscribe_transitions();

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    bridge.push_activation(start_activation("r1", "order"));
    assert!(
        wait_until(Duration::from_secs(5), || {
            bridge.workflow_completions().len() == 1
        })
        .await
    );

    worker.shutdown().await.unwrap();
    runner.await.unwrap().unwrap();

    let mut observed = Vec::new();
    while let Ok(state) = transitions.try_recv() {
        observed.push(state);
    }
    assert_eq!(
        observed,
        vec![
            WorkerState::Running,
            WorkerState::Stopping,
            WorkerState::Draining,
            WorkerState::Drained,
            WorkerState::Stopped,
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_is_legal_only_from_initialized() {
    let dir = workflows_dir(&static_report_interface(COMPLETED_42));
    let bridge = InMemoryBridge::new();
    let worker = build_worker(test_config(dir.path()), &bridge, ActivityRegistry::new());

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };
    assert!(
        wait_until(Duration::from_secs(2), || {
            worker.state() == WorkerState::Running
        })
        .await
    );
    assert!(matches!(
        worker.run().await,
        Err(WorkerError::IllegalState(_))
    ));

    worker.shutdown().await.unwrap();
    runner.await.unwrap().unwrap();
}
