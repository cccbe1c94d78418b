//! Request decomposition.
//!
//! A [`Decomposer`] maps a request type and its parameters to the subtasks
//! that implement it. It is a pure function: no side effects, no knowledge of
//! workers, and the same input always yields the same specs. The coordinator
//! turns the specs into tasks and rewrites their local ids to global ones.

mod rules;

use crate::core::task::Params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use rules::builtin_rules;

/// One subtask produced by a decomposition call.
///
/// `local_id` and `depends_on` are only meaningful within the batch that
/// produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub local_id: String,
    pub task_type: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub required_capability: String,
}

impl SubtaskSpec {
    /// A spec whose required capability equals its task type.
    pub fn new(local_id: &str, task_type: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            task_type: task_type.to_string(),
            params: Params::new(),
            depends_on: Vec::new(),
            required_capability: task_type.to_string(),
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_capability(mut self, capability: &str) -> Self {
        self.required_capability = capability.to_string();
        self
    }

    pub fn after(mut self, local_ids: &[&str]) -> Self {
        self.depends_on
            .extend(local_ids.iter().map(|id| id.to_string()));
        self
    }
}

/// Maps `(request_type, params)` to subtask specs.
///
/// Returns `None` when there is no rule for `request_type` and `Some(vec![])`
/// when the rule decides the request is a leaf. The coordinator executes both
/// directly.
pub trait Decomposer: Send + Sync {
    fn decompose(&self, request_type: &str, params: &Params) -> Option<Vec<SubtaskSpec>>;
}

/// A single named decomposition rule.
pub type RuleFn = Box<dyn Fn(&Params) -> Vec<SubtaskSpec> + Send + Sync>;

/// Table-driven decomposer keyed by request type.
pub struct RuleDecomposer {
    rules: BTreeMap<String, RuleFn>,
}

impl RuleDecomposer {
    /// An empty table: every request type executes as a leaf.
    pub fn new() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// The rules shipped with the crate.
    pub fn with_builtin_rules() -> Self {
        let mut decomposer = Self::new();
        for (name, rule) in builtin_rules() {
            decomposer.rules.insert(name.to_string(), rule);
        }
        decomposer
    }

    /// Register or replace the rule for `request_type`.
    pub fn register<F>(&mut self, request_type: &str, rule: F)
    where
        F: Fn(&Params) -> Vec<SubtaskSpec> + Send + Sync + 'static,
    {
        self.rules.insert(request_type.to_string(), Box::new(rule));
    }

    pub fn has_rule(&self, request_type: &str) -> bool {
        self.rules.contains_key(request_type)
    }

    /// Registered request types in sorted order.
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.keys().map(String::as_str).collect()
    }
}

impl Default for RuleDecomposer {
    fn default() -> Self {
        Self::with_builtin_rules()
    }
}

impl std::fmt::Debug for RuleDecomposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleDecomposer")
            .field("rules", &self.rule_names())
            .finish()
    }
}

impl Decomposer for RuleDecomposer {
    fn decompose(&self, request_type: &str, params: &Params) -> Option<Vec<SubtaskSpec>> {
        self.rules.get(request_type).map(|rule| rule(params))
    }
}
