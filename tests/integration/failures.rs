//! Failure propagation tests.

use std::sync::Arc;
use std::time::Duration;

use conductor::actors::{Executor, TreeOutcome};
use conductor::config::FailurePolicy;
use conductor::core::{FailureKind, Task, TaskId, TaskStatus};
use conductor::orchestration::TaskRequest;
use conductor::{Error, System};

use crate::fixtures::{
    analysis_builder, config_with, delayed, echo, failing, keys, scoped, Recorder,
    ANALYSIS_CAPABILITIES, WAIT,
};

/// Builder where `broken` fails and every other capability echoes.
fn with_broken(broken: &str, executor: Arc<dyn Executor>) -> conductor::SystemBuilder {
    ANALYSIS_CAPABILITIES
        .iter()
        .fold(System::builder(), |builder, capability| {
            let chosen = if *capability == broken {
                Arc::clone(&executor)
            } else {
                echo()
            };
            builder.worker(format!("{}-worker", capability), [(*capability, chosen)])
        })
}

async fn child_of_type(system: &System, root: TaskId, task_type: &str) -> Task {
    let snapshot = system.gateway().status(root).await.unwrap().unwrap();
    for child in snapshot.child_ids {
        let child = system.gateway().status(child).await.unwrap().unwrap();
        if child.task_type == task_type {
            return child;
        }
    }
    panic!("no {} child under {}", task_type, root);
}

fn failure(outcome: &TreeOutcome) -> &conductor::core::TaskError {
    outcome.error().expect("tree should fail")
}

#[tokio::test]
async fn test_worker_error_fails_tree_fast() {
    let system = with_broken("price_analysis", failing("no price feed"))
        .start()
        .unwrap();

    let (root, outcome) = system
        .execute_timeout(scoped("comprehensive_analysis"), WAIT)
        .await
        .unwrap();

    let error = failure(&outcome);
    assert_eq!(error.kind, FailureKind::WorkerReportedError);
    assert_eq!(error.message, "no price feed");
    assert!(error.partial.is_none());

    let pricing = child_of_type(&system, root, "price_analysis").await;
    assert_eq!(error.origin, pricing.id);
    assert_eq!(pricing.status, TaskStatus::Failed);

    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_collect_all_reports_partial_results() {
    let config = config_with(|c| c.failure_policy = FailurePolicy::CollectAll);
    let system = with_broken("price_analysis", failing("no price feed"))
        .config(config)
        .start()
        .unwrap();

    let (_, outcome) = system
        .execute_timeout(scoped("comprehensive_analysis"), WAIT)
        .await
        .unwrap();

    let error = failure(&outcome);
    assert_eq!(error.kind, FailureKind::WorkerReportedError);
    let partial = error.partial.as_ref().expect("partial results attached");
    assert_eq!(
        keys(partial),
        vec!["competitor_analysis", "market_analysis", "selling_point_analysis"]
    );

    system.shutdown().await.unwrap();
}

/// A failed prerequisite fails its dependents without running them.
#[tokio::test]
async fn test_failed_prerequisite_blocks_dependents() {
    let recorder = Recorder::new();
    let system = System::builder()
        .worker("collector", [("market_data", failing("source offline"))])
        .worker("analyst", [("market_analysis", recorder.executor())])
        .worker("strategist", [("business_strategy", recorder.executor())])
        .start()
        .unwrap();

    let (root, outcome) = system
        .execute_timeout(scoped("market_trend"), WAIT)
        .await
        .unwrap();

    let collect = child_of_type(&system, root, "data_collection").await;
    assert_eq!(failure(&outcome).origin, collect.id);

    for dependent in ["data_analysis", "insight_generation"] {
        let task = child_of_type(&system, root, dependent).await;
        assert_eq!(task.status, TaskStatus::Failed);
        let error = task.error.unwrap();
        assert_eq!(error.kind, FailureKind::DependencyUnsatisfiable);
        assert_eq!(error.origin, collect.id);
    }
    assert!(recorder.entries().is_empty());

    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_capability_fails_immediately() {
    let system = System::builder()
        .worker("only", [("market_analysis", echo())])
        .start()
        .unwrap();

    let (root, outcome) = system
        .execute_timeout(TaskRequest::new("ad_hoc"), WAIT)
        .await
        .unwrap();

    let error = failure(&outcome);
    assert_eq!(error.kind, FailureKind::NoCapableWorker);
    assert_eq!(error.origin, root);

    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_request_is_rejected() {
    let system = analysis_builder(echo()).start().unwrap();

    let err = system.submit(TaskRequest::new("")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)), "got {:?}", err);

    let err = system
        .submit(TaskRequest::new("spot_check").with_capability(""))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)), "got {:?}", err);

    system.shutdown().await.unwrap();
}

/// A stalled worker is timed out and the tree fails with `Timeout`.
#[tokio::test]
async fn test_stalled_worker_times_out() {
    let config = config_with(|c| {
        c.task_timeout_secs = Some(1);
        c.sweep_interval_ms = 50;
    });
    let system = System::builder()
        .config(config)
        .worker("slow", [("price_analysis", delayed(Duration::from_secs(60)))])
        .start()
        .unwrap();

    let (root, outcome) = system
        .execute_timeout(TaskRequest::new("price_analysis"), WAIT)
        .await
        .unwrap();

    let error = failure(&outcome);
    assert_eq!(error.kind, FailureKind::Timeout);
    assert_eq!(error.origin, root);

    system.shutdown().await.unwrap();
}

/// Without a configured bound a slow worker is simply waited for.
#[tokio::test]
async fn test_slow_worker_without_timeout_completes() {
    let system = System::builder()
        .worker("slow", [("price_analysis", delayed(Duration::from_millis(200)))])
        .start()
        .unwrap();

    let (_, outcome) = system
        .execute_timeout(TaskRequest::new("price_analysis"), WAIT)
        .await
        .unwrap();
    assert!(outcome.is_completed());

    system.shutdown().await.unwrap();
}
