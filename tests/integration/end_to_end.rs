//! End-to-end request tests.

use conductor::core::TaskStatus;
use conductor::orchestration::TaskRequest;

use crate::fixtures::{analysis_builder, echo, keys, scoped, Recorder, WAIT};

/// Four independent analyses are fanned out and aggregated by task type.
#[tokio::test]
async fn test_comprehensive_analysis_aggregates_children() {
    let system = analysis_builder(echo()).start().unwrap();

    let (root, outcome) = system
        .execute_timeout(scoped("comprehensive_analysis"), WAIT)
        .await
        .unwrap();

    let result = outcome.result().expect("tree should complete");
    assert_eq!(
        keys(result),
        vec![
            "competitor_analysis",
            "market_analysis",
            "price_analysis",
            "selling_point_analysis"
        ]
    );
    assert_eq!(result["price_analysis"]["params"]["category"], "coffee");
    assert_eq!(
        result["market_analysis"]["params"]["metrics"][0],
        "sales"
    );

    let snapshot = system.gateway().status(root).await.unwrap().unwrap();
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.child_ids.len(), 4);
    assert_eq!(snapshot.result.as_ref(), Some(result));

    system.shutdown().await.unwrap();
}

/// A staged pipeline runs strictly in dependency order.
#[tokio::test]
async fn test_market_trend_runs_in_order() {
    let recorder = Recorder::new();
    let system = analysis_builder(recorder.executor()).start().unwrap();

    let (_, outcome) = system
        .execute_timeout(scoped("market_trend"), WAIT)
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(
        recorder.entries(),
        vec!["data_collection", "data_analysis", "insight_generation"]
    );
    assert_eq!(
        keys(outcome.result().unwrap()),
        vec!["data_analysis", "data_collection", "insight_generation"]
    );

    system.shutdown().await.unwrap();
}

/// Nested rules build a three-level tree whose summary waits for both
/// sub-pipelines.
#[tokio::test]
async fn test_strategy_review_nested_tree() {
    let recorder = Recorder::new();
    let system = analysis_builder(recorder.executor()).start().unwrap();

    let (root, outcome) = system
        .execute_timeout(scoped("strategy_review"), WAIT)
        .await
        .unwrap();

    let result = outcome.result().expect("tree should complete");
    assert_eq!(
        keys(result),
        vec!["competitor_report", "executive_summary", "market_trend"]
    );
    assert_eq!(
        keys(&result["market_trend"]),
        vec!["data_analysis", "data_collection", "insight_generation"]
    );

    let entries = recorder.entries();
    assert_eq!(entries.len(), 7);
    assert_eq!(entries.last().map(String::as_str), Some("executive_summary"));
    assert!(recorder.position("data_collection") < recorder.position("data_analysis"));

    let snapshot = system.gateway().status(root).await.unwrap().unwrap();
    assert_eq!(snapshot.child_ids.len(), 3);
    for child in snapshot.child_ids {
        let child = system.gateway().status(child).await.unwrap().unwrap();
        assert_eq!(child.status, TaskStatus::Completed);
        assert_eq!(child.parent_id, Some(root));
    }

    system.shutdown().await.unwrap();
}

/// A request with no rule runs as a single leaf under its own capability.
#[tokio::test]
async fn test_leaf_request_with_explicit_capability() {
    let system = analysis_builder(echo()).start().unwrap();

    let (root, outcome) = system
        .execute_timeout(
            TaskRequest::new("spot_check").with_capability("price_analysis"),
            WAIT,
        )
        .await
        .unwrap();

    let result = outcome.result().unwrap();
    assert_eq!(result["task_type"], "spot_check");
    assert_eq!(result["capability"], "price_analysis");

    let snapshot = system.gateway().status(root).await.unwrap().unwrap();
    assert!(snapshot.child_ids.is_empty());
    assert_eq!(
        snapshot.assigned_worker.map(|w| w.to_string()),
        Some("price_analysis-worker".to_string())
    );

    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_status_of_unknown_task() {
    let system = analysis_builder(echo()).start().unwrap();
    let missing = conductor::core::TaskId::new();
    assert!(system.gateway().status(missing).await.unwrap().is_none());
    system.shutdown().await.unwrap();
}

/// Two systems in one process share nothing.
#[tokio::test]
async fn test_independent_systems() {
    let first = analysis_builder(echo()).start().unwrap();
    let second = analysis_builder(echo()).start().unwrap();

    let (a, _) = first
        .execute_timeout(scoped("market_trend"), WAIT)
        .await
        .unwrap();
    let (b, _) = second
        .execute_timeout(scoped("competitor_report"), WAIT)
        .await
        .unwrap();

    assert!(first.gateway().status(b).await.unwrap().is_none());
    assert!(second.gateway().status(a).await.unwrap().is_none());

    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
}
