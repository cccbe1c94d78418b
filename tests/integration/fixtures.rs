//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Executors that echo, fail, stall or record what they ran
//! - Systems wired with a worker per analysis capability

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use conductor::actors::{executor_fn, Assignment, EchoExecutor, Executor};
use conductor::config::Config;
use conductor::core::Params;
use conductor::orchestration::TaskRequest;
use conductor::{System, SystemBuilder};

/// Upper bound on any single tree in these tests.
pub const WAIT: Duration = Duration::from_secs(10);

/// Leaf capabilities used by the built-in rules.
pub const ANALYSIS_CAPABILITIES: [&str; 7] = [
    "market_analysis",
    "selling_point_analysis",
    "competitor_analysis",
    "price_analysis",
    "market_data",
    "competitor_data",
    "business_strategy",
];

pub fn echo() -> Arc<dyn Executor> {
    Arc::new(EchoExecutor)
}

/// Always reports `message` as its error.
pub fn failing(message: &'static str) -> Arc<dyn Executor> {
    executor_fn(move |_: Assignment| async move { Err(message.to_string()) })
}

/// Echoes after `delay`.
pub fn delayed(delay: Duration) -> Arc<dyn Executor> {
    executor_fn(move |assignment: Assignment| async move {
        tokio::time::sleep(delay).await;
        Ok(json!({ "task_type": assignment.task_type }))
    })
}

/// Execution log shared between recording executors.
#[derive(Clone, Default)]
pub struct Recorder {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// An executor that appends the task type, then echoes it.
    pub fn executor(&self) -> Arc<dyn Executor> {
        let entries = Arc::clone(&self.entries);
        executor_fn(move |assignment: Assignment| {
            let entries = Arc::clone(&entries);
            async move {
                entries.lock().unwrap().push(assignment.task_type.clone());
                tokio::task::yield_now().await;
                Ok(json!({ "task_type": assignment.task_type }))
            }
        })
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn position(&self, task_type: &str) -> usize {
        self.entries()
            .iter()
            .position(|t| t == task_type)
            .unwrap_or_else(|| panic!("{} never ran", task_type))
    }
}

/// Builder with one worker per analysis capability, each using `executor`.
pub fn analysis_builder(executor: Arc<dyn Executor>) -> SystemBuilder {
    ANALYSIS_CAPABILITIES
        .iter()
        .fold(System::builder(), |builder, capability| {
            builder.worker(
                format!("{}-worker", capability),
                [(*capability, Arc::clone(&executor))],
            )
        })
}

pub fn config_with(configure: impl FnOnce(&mut Config)) -> Config {
    let mut config = Config::default();
    configure(&mut config);
    config
}

/// Request scoped to one category and quarter.
pub fn scoped(request_type: &str) -> TaskRequest {
    let mut params = Params::new();
    params.insert("category".to_string(), json!("coffee"));
    params.insert("start_date".to_string(), json!("2024-01-01"));
    params.insert("end_date".to_string(), json!("2024-03-31"));
    TaskRequest::new(request_type).with_params(params)
}

/// The object keys of an aggregated result, sorted.
pub fn keys(value: &Value) -> Vec<String> {
    let mut keys: Vec<String> = value
        .as_object()
        .map(|o| o.keys().cloned().collect())
        .unwrap_or_default();
    keys.sort();
    keys
}
