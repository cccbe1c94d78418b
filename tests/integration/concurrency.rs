//! Concurrent trees and worker selection.

use std::collections::HashSet;
use std::time::Duration;

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;

use conductor::core::TaskStatus;
use conductor::decompose::{RuleDecomposer, SubtaskSpec};
use conductor::orchestration::TaskRequest;
use conductor::System;

use crate::fixtures::{delayed, echo, keys, scoped, ANALYSIS_CAPABILITIES, WAIT};

/// Many trees share one worker with the default bound and each gets its own
/// result.
#[tokio::test]
async fn test_many_trees_in_parallel() {
    let executors = ANALYSIS_CAPABILITIES.iter().map(|c| (*c, echo()));
    let system = System::builder()
        .worker("generalist", executors)
        .start()
        .unwrap();

    let requests = (0..8).map(|i| {
        let request_type = if i % 2 == 0 {
            "market_trend"
        } else {
            "competitor_report"
        };
        system.execute_timeout(scoped(request_type), WAIT)
    });
    let results = join_all(requests).await;

    let mut roots = HashSet::new();
    for result in results {
        let (root, outcome) = result.unwrap();
        assert!(outcome.is_completed(), "tree {} failed: {:?}", root, outcome);
        assert_eq!(keys(outcome.result().unwrap()).len(), 3);
        roots.insert(root);
    }
    assert_eq!(roots.len(), 8);

    system.shutdown().await.unwrap();
}

/// Concurrent leaves land on the least-loaded capable worker.
#[tokio::test]
async fn test_load_spreads_across_workers() {
    let slow = delayed(Duration::from_millis(300));
    let system = System::builder()
        .worker_with_limit("first", 1, [("price_analysis", slow.clone())])
        .worker_with_limit("second", 1, [("price_analysis", slow)])
        .start()
        .unwrap();

    let a = system.submit(TaskRequest::new("price_analysis")).await.unwrap();
    let b = system.submit(TaskRequest::new("price_analysis")).await.unwrap();

    for root in [a, b] {
        let outcome = system.gateway().wait_timeout(root, WAIT).await.unwrap();
        assert!(outcome.is_completed(), "tree {} failed: {:?}", root, outcome);
    }

    let workers: HashSet<String> = join_all([a, b].map(|root| system.gateway().status(root)))
        .await
        .into_iter()
        .map(|snapshot| {
            let task = snapshot.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
            task.assigned_worker.unwrap().to_string()
        })
        .collect();
    assert_eq!(
        workers,
        HashSet::from(["first".to_string(), "second".to_string()])
    );

    system.shutdown().await.unwrap();
}

/// Polling sees the outcome once the tree finishes.
#[tokio::test]
async fn test_polling_until_done() {
    let system = System::builder()
        .worker("w", [("price_analysis", delayed(Duration::from_millis(100)))])
        .start()
        .unwrap();

    let root = system
        .submit(TaskRequest::new("price_analysis").with_priority(5))
        .await
        .unwrap();
    assert!(system.gateway().poll(&root).is_none());

    let deadline = tokio::time::Instant::now() + WAIT;
    let outcome = loop {
        if let Some(outcome) = system.gateway().poll(&root) {
            break outcome;
        }
        assert!(tokio::time::Instant::now() < deadline, "tree never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert!(outcome.is_completed());
    assert_eq!(system.gateway().wait(root).await.unwrap(), outcome);
    assert!(system.gateway().poll(&root).is_none());

    system.shutdown().await.unwrap();
}

/// A fan-out wider than the worker's bound queues instead of failing.
#[tokio::test]
async fn test_fan_out_wider_than_capacity_completes() {
    let mut rules = RuleDecomposer::new();
    rules.register("fan", |_| {
        (0..5)
            .map(|i| SubtaskSpec::new(&format!("c{}", i), "x"))
            .collect()
    });
    // The default bound is four.
    let system = System::builder()
        .decomposer(Arc::new(rules))
        .worker("only", [("x", delayed(Duration::from_millis(50)))])
        .start()
        .unwrap();

    let (root, outcome) = system
        .execute_timeout(TaskRequest::new("fan"), WAIT)
        .await
        .unwrap();
    assert!(outcome.is_completed(), "fan-out failed: {:?}", outcome);
    match &outcome.result().unwrap()["x"] {
        Value::Array(items) => assert_eq!(items.len(), 5),
        other => panic!("Expected five results, got {:?}", other),
    }

    let snapshot = system.gateway().status(root).await.unwrap().unwrap();
    for child in snapshot.child_ids {
        let task = system.gateway().status(child).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.assigned_worker.unwrap().to_string(), "only");
    }

    system.shutdown().await.unwrap();
}
