//! Task data model for the orchestration graph.
//!
//! Tasks are the units of work the coordinator tracks. A task is either a
//! leaf, executed by exactly one worker, or a composite that was decomposed
//! into children and resolves only by aggregating their outcomes.

use crate::error::{Error, Result};
use crate::transport::ParticipantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque key-value payload carried by requests and tasks.
pub type Params = serde_json::Map<String, Value>;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
///
/// Leaves move `Pending -> Waiting -> Assigned -> Running -> Completed|Failed`.
/// Composites move `Pending -> Decomposed -> Completed|Failed`, the final step
/// being derived from their children. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task created, decomposition not yet evaluated.
    Pending,
    /// Leaf task waiting for its dependencies and a worker.
    Waiting,
    /// Dispatched to a worker, not yet acknowledged.
    Assigned,
    /// Worker acknowledged and is executing.
    Running,
    /// Expanded into children; resolved by aggregation only.
    Decomposed,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Completed or Failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Counted against a worker's load.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }

    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Waiting)
                | (Pending, Decomposed)
                | (Pending, Failed)
                | (Waiting, Assigned)
                | (Waiting, Failed)
                | (Assigned, Running)
                | (Assigned, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Decomposed, Completed)
                | (Decomposed, Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Decomposed => "decomposed",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed request or rejected decomposition output.
    InvalidRequest,
    /// No registered, available worker advertises the capability.
    NoCapableWorker,
    /// A prerequisite failed, so this task can never run.
    DependencyUnsatisfiable,
    /// The worker executed the task and reported an error.
    WorkerReportedError,
    /// The task stayed assigned or running past the configured bound.
    Timeout,
    /// Abandoned because its parent already failed.
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::InvalidRequest => "invalid_request",
            FailureKind::NoCapableWorker => "no_capable_worker",
            FailureKind::DependencyUnsatisfiable => "dependency_unsatisfiable",
            FailureKind::WorkerReportedError => "worker_reported_error",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Terminal error recorded on a failed task.
///
/// `origin` is the task whose failure started the chain; a parent that fails
/// because of a child keeps the child's origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: FailureKind,
    pub message: String,
    pub origin: TaskId,
    /// Results of the children that did complete (collect-all policy only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<Value>,
}

impl TaskError {
    pub fn new(kind: FailureKind, message: impl Into<String>, origin: TaskId) -> Self {
        Self {
            kind,
            message: message.into(),
            origin,
            partial: None,
        }
    }

    pub fn with_partial(mut self, partial: Value) -> Self {
        self.partial = Some(partial);
        self
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at task {}: {}", self.kind, self.origin.short(), self.message)
    }
}

/// A single task in the orchestration graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub params: Params,
    pub priority: i32,
    /// Capability tag a worker must advertise to run this task.
    pub required_capability: String,
    pub status: TaskStatus,
    /// Sibling tasks that must complete before this one may leave Waiting.
    pub depends_on: Vec<TaskId>,
    pub parent_id: Option<TaskId>,
    /// Children created by decomposition, in spec order. Append-only.
    pub child_ids: Vec<TaskId>,
    pub assigned_worker: Option<ParticipantId>,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new Pending task with a generated ID and current timestamp.
    pub fn new(
        task_type: &str,
        params: Params,
        priority: i32,
        required_capability: &str,
    ) -> Self {
        Self {
            id: TaskId::new(),
            task_type: task_type.to_string(),
            params,
            priority,
            required_capability: required_capability.to_string(),
            status: TaskStatus::Pending,
            depends_on: Vec::new(),
            parent_id: None,
            child_ids: Vec::new(),
            assigned_worker: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// Set the dependency set. Duplicates are dropped, declared order is kept.
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        for dep in deps {
            if !self.depends_on.contains(&dep) {
                self.depends_on.push(dep);
            }
        }
        self
    }

    fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                task: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Pending -> Waiting.
    pub fn mark_waiting(&mut self) -> Result<()> {
        self.transition(TaskStatus::Waiting)
    }

    /// Pending -> Decomposed, recording the children.
    ///
    /// Decomposition runs at most once: a task that already has children
    /// is rejected even before the status check.
    pub fn mark_decomposed(&mut self, children: Vec<TaskId>) -> Result<()> {
        if !self.child_ids.is_empty() {
            return Err(Error::Validation(format!(
                "Task {} was already decomposed",
                self.id
            )));
        }
        if children.is_empty() {
            return Err(Error::Validation(format!(
                "Task {} cannot be decomposed into zero children",
                self.id
            )));
        }
        self.transition(TaskStatus::Decomposed)?;
        self.child_ids = children;
        Ok(())
    }

    /// Waiting -> Assigned to `worker`.
    pub fn assign(&mut self, worker: ParticipantId) -> Result<()> {
        self.transition(TaskStatus::Assigned)?;
        self.assigned_worker = Some(worker);
        self.assigned_at = Some(Utc::now());
        Ok(())
    }

    /// Assigned -> Running.
    pub fn start(&mut self) -> Result<()> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the task completed with its result.
    pub fn complete(&mut self, result: Value) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the task failed with an error.
    pub fn fail(&mut self, error: TaskError) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Check if the task is in a terminal state (Completed or Failed).
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.child_ids.is_empty() && self.status != TaskStatus::Decomposed
    }
}
