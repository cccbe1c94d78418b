//! Coordinator: the single scheduler that owns the task graph.
//!
//! The coordinator drains its mailbox and reacts to each envelope in turn.
//! Every task mutation happens inside [`Coordinator::handle`] or
//! [`Coordinator::check_timeouts`], so gating and propagation never race.
//! Workers are never awaited: an assignment is a message out, its result is
//! a later message in.

use crate::actors::ActorHandle;
use crate::config::{Config, FailurePolicy};
use crate::core::dag::BatchGraph;
use crate::core::store::TaskStore;
use crate::core::task::{FailureKind, Params, Task, TaskError, TaskId, TaskStatus};
use crate::decompose::{Decomposer, SubtaskSpec};
use crate::error::{Error, Result};
use crate::orchestration::registry::WorkerRegistry;
use crate::transport::{Envelope, Mailbox, MessageId, ParticipantId, Payload, TaskOutcome, Transport};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// A new request for a task tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub request_type: String,
    pub params: Params,
    pub priority: i32,
    /// Capability for a root that executes as a leaf. Defaults to the
    /// request type.
    pub capability: Option<String>,
}

impl TaskRequest {
    pub fn new(request_type: &str) -> Self {
        Self {
            request_type: request_type.to_string(),
            params: Params::new(),
            priority: 0,
            capability: None,
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capability(mut self, capability: &str) -> Self {
        self.capability = Some(capability.to_string());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.request_type.trim().is_empty() {
            return Err(Error::InvalidRequest("missing request_type".to_string()));
        }
        if self.capability.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(Error::InvalidRequest("empty capability".to_string()));
        }
        Ok(())
    }
}

/// Who asked for a tree, so the outcome can be routed back.
#[derive(Debug, Clone)]
struct Requester {
    participant: ParticipantId,
    request: MessageId,
}

pub struct Coordinator {
    id: ParticipantId,
    transport: Transport,
    store: TaskStore,
    workers: WorkerRegistry,
    decomposer: Arc<dyn Decomposer>,
    policy: FailurePolicy,
    task_timeout: Option<Duration>,
    sweep_interval: Duration,
    requesters: HashMap<TaskId, Requester>,
}

impl Coordinator {
    pub fn new(
        id: impl Into<ParticipantId>,
        transport: Transport,
        decomposer: Arc<dyn Decomposer>,
    ) -> Self {
        let defaults = Config::default();
        Self {
            id: id.into(),
            transport,
            store: TaskStore::new(),
            workers: WorkerRegistry::new(),
            decomposer,
            policy: defaults.failure_policy,
            task_timeout: defaults.task_timeout(),
            sweep_interval: defaults.sweep_interval(),
            requesters: HashMap::new(),
        }
    }

    /// Apply the scheduling settings from `config`.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.policy = config.failure_policy;
        self.task_timeout = config.task_timeout();
        self.sweep_interval = config.sweep_interval();
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.store.get(id)
    }

    /// Drop a finished tree from the store. Returns the number of tasks
    /// removed.
    ///
    /// # Errors
    /// Returns `Error::Validation` if `root` is not a root or is still
    /// running, and `Error::TaskNotFound` if it is unknown.
    pub fn prune(&mut self, root: &TaskId) -> Result<usize> {
        let removed = self.store.prune_tree(root)?;
        self.requesters.remove(root);
        tracing::debug!(root = %root, removed, "tree pruned");
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Inbound messages
    // ------------------------------------------------------------------

    /// React to one inbound envelope.
    ///
    /// Malformed or stale messages from peers are logged and dropped; an
    /// error here means the coordinator's own bookkeeping is inconsistent.
    pub fn handle(&mut self, envelope: Envelope) -> Result<()> {
        let sender = envelope.sender().clone();
        tracing::trace!(from = %sender, kind = %envelope.kind(), "coordinator received");

        match envelope.payload().clone() {
            Payload::Request {
                request_type,
                params,
                priority,
                capability,
            } => {
                let request = TaskRequest {
                    request_type,
                    params,
                    priority,
                    capability,
                };
                self.handle_request(&envelope, request)
            }
            Payload::RegisterWorker {
                capabilities,
                max_concurrent,
            } => {
                self.register_worker_with_limit(sender.clone(), capabilities, max_concurrent);
                self.reply(&envelope, Payload::WorkerRegistered);
                self.dispatch_backlog()
            }
            Payload::WorkerAvailability { available } => {
                if !self.set_worker_available(&sender, available) {
                    tracing::warn!(worker = %sender, "availability from unregistered worker");
                    return Ok(());
                }
                self.dispatch_backlog()
            }
            Payload::TaskAccepted { task_id } => self.on_accepted(&sender, task_id),
            Payload::TaskRejected { task_id, reason } => {
                self.on_rejected(&sender, task_id, &reason)
            }
            Payload::TaskResult { task_id, outcome } => self.on_result(&sender, task_id, outcome),
            Payload::StatusInquiry { task_id } => {
                let snapshot = self.store.get(&task_id).cloned().map(Box::new);
                self.reply(&envelope, Payload::StatusReport { task_id, snapshot });
                Ok(())
            }
            Payload::Shutdown => Ok(()),
            other => {
                tracing::warn!(from = %sender, kind = %other.kind(), "unexpected message ignored");
                Ok(())
            }
        }
    }

    fn handle_request(&mut self, envelope: &Envelope, request: TaskRequest) -> Result<()> {
        let (root, rejected) = match self.create_tree(request) {
            Ok(created) => created,
            Err(e @ (Error::InvalidRequest(_) | Error::InvalidDecomposition(_))) => {
                tracing::warn!(from = %envelope.sender(), error = %e, "request rejected");
                self.reply(
                    envelope,
                    Payload::RequestRejected {
                        message: e.to_string(),
                    },
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.requesters.insert(
            root,
            Requester {
                participant: envelope.sender().clone(),
                request: envelope.id(),
            },
        );
        // The acknowledgement goes out before any outcome for this tree.
        self.reply(envelope, Payload::RequestAccepted { root });
        self.start_tree(root, rejected)?;
        Ok(())
    }

    /// Create and start a tree without a requester to notify.
    ///
    /// # Errors
    /// Returns `Error::InvalidRequest` for a malformed request and
    /// `Error::InvalidDecomposition` if the root's decomposition is rejected.
    /// Nothing is stored in either case.
    pub fn submit(&mut self, request: TaskRequest) -> Result<TaskId> {
        let (root, rejected) = self.create_tree(request)?;
        self.start_tree(root, rejected)?;
        Ok(root)
    }

    pub fn register_worker<I, S>(&mut self, id: ParticipantId, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register_worker_with_limit(id, capabilities, None);
    }

    /// Register a worker that takes at most `max_concurrent` tasks at once.
    ///
    /// Tasks are never assigned past the bound; they stay waiting until a
    /// slot frees up.
    pub fn register_worker_with_limit<I, S>(
        &mut self,
        id: ParticipantId,
        capabilities: I,
        max_concurrent: Option<usize>,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let capabilities: Vec<String> = capabilities.into_iter().map(Into::into).collect();
        let fresh =
            self.workers
                .register_with_limit(id.clone(), capabilities.iter().cloned(), max_concurrent);
        tracing::info!(
            worker = %id,
            capabilities = ?capabilities,
            max_concurrent = ?max_concurrent,
            "worker {}",
            if fresh { "registered" } else { "re-registered" }
        );
    }

    pub fn set_worker_available(&mut self, id: &ParticipantId, available: bool) -> bool {
        self.workers.set_available(id, available)
    }

    /// Assigned -> Running when the assigned worker acknowledges.
    pub fn on_accepted(&mut self, worker: &ParticipantId, task_id: TaskId) -> Result<()> {
        let Some(task) = self.store.get_mut(&task_id) else {
            tracing::warn!(worker = %worker, task = %task_id, "ack for unknown task");
            return Ok(());
        };
        if task.assigned_worker.as_ref() != Some(worker) {
            tracing::warn!(worker = %worker, task = %task_id, "ack from a worker that was not assigned");
            return Ok(());
        }
        if task.status != TaskStatus::Assigned {
            tracing::debug!(task = %task_id, status = %task.status, "late ack ignored");
            return Ok(());
        }
        task.start()?;
        tracing::debug!(worker = %worker, task = %task_id, "task running");
        Ok(())
    }

    /// Assigned -> Failed when the assigned worker refuses the task.
    pub fn on_rejected(
        &mut self,
        worker: &ParticipantId,
        task_id: TaskId,
        reason: &str,
    ) -> Result<()> {
        let Some(task) = self.store.get_mut(&task_id) else {
            tracing::warn!(worker = %worker, task = %task_id, "rejection for unknown task");
            return Ok(());
        };
        if task.assigned_worker.as_ref() != Some(worker) || task.status != TaskStatus::Assigned {
            tracing::debug!(task = %task_id, status = %task.status, "stale rejection ignored");
            return Ok(());
        }
        tracing::warn!(worker = %worker, task = %task_id, reason, "task rejected by worker");
        task.fail(TaskError::new(
            FailureKind::WorkerReportedError,
            format!("rejected: {}", reason),
            task_id,
        ))?;
        self.propagate(VecDeque::from([task_id]))
    }

    /// Record a worker's result and propagate it.
    pub fn on_result(
        &mut self,
        worker: &ParticipantId,
        task_id: TaskId,
        outcome: TaskOutcome,
    ) -> Result<()> {
        let Some(task) = self.store.get_mut(&task_id) else {
            tracing::warn!(worker = %worker, task = %task_id, "result for unknown task");
            return Ok(());
        };
        if task.assigned_worker.as_ref() != Some(worker) {
            tracing::warn!(worker = %worker, task = %task_id, "result from a worker that was not assigned");
            return Ok(());
        }
        if task.is_finished() {
            tracing::info!(task = %task_id, status = %task.status, "late result ignored");
            return Ok(());
        }
        if task.status == TaskStatus::Assigned {
            // The worker answered without acknowledging first.
            task.start()?;
        }
        match outcome {
            TaskOutcome::Completed { result } => {
                tracing::debug!(worker = %worker, task = %task_id, "task completed");
                task.complete(result)?;
            }
            TaskOutcome::Failed { error } => {
                tracing::warn!(worker = %worker, task = %task_id, error = %error, "task failed");
                task.fail(TaskError::new(FailureKind::WorkerReportedError, error, task_id))?;
            }
        }
        self.propagate(VecDeque::from([task_id]))
    }

    /// Fail every assigned or running task older than the timeout bound.
    ///
    /// The worker gets a best-effort cancellation notice. Returns the number
    /// of tasks timed out.
    pub fn check_timeouts(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let Some(limit) = self.task_timeout else {
            return Ok(0);
        };

        let expired: Vec<(TaskId, Option<ParticipantId>)> = self
            .store
            .all()
            .filter(|t| t.status.is_active())
            .filter(|t| {
                t.assigned_at
                    .and_then(|at| (now - at).to_std().ok())
                    .is_some_and(|elapsed| elapsed >= limit)
            })
            .map(|t| (t.id, t.assigned_worker.clone()))
            .collect();

        let mut worklist = VecDeque::new();
        for (task_id, worker) in &expired {
            tracing::warn!(task = %task_id, worker = ?worker, "task timed out");
            self.store.require_mut(task_id)?.fail(TaskError::new(
                FailureKind::Timeout,
                format!("no result within {}s", limit.as_secs_f64()),
                *task_id,
            ))?;
            if let Some(worker) = worker {
                self.notify(Envelope::new(
                    self.id.clone(),
                    worker.clone(),
                    Payload::TaskCancelled { task_id: *task_id },
                ));
            }
            worklist.push_back(*task_id);
        }
        self.propagate(worklist)?;
        Ok(expired.len())
    }

    // ------------------------------------------------------------------
    // Tree creation
    // ------------------------------------------------------------------

    /// Build the full tree for `request` without dispatching anything.
    ///
    /// Decomposition is eager and breadth-first. Returns the root and the
    /// tasks that failed during creation because their own decomposition
    /// was rejected.
    fn create_tree(&mut self, request: TaskRequest) -> Result<(TaskId, Vec<TaskId>)> {
        request.validate()?;
        let capability = request
            .capability
            .clone()
            .unwrap_or_else(|| request.request_type.clone());
        let root = Task::new(
            &request.request_type,
            request.params,
            request.priority,
            &capability,
        );
        let root_plan = self.plan(&root)?;
        let root_id = self.store.insert(root)?;
        tracing::info!(
            root = %root_id,
            request_type = %request.request_type,
            "request accepted"
        );

        let mut rejected = Vec::new();
        let mut pending = VecDeque::from([(root_id, root_plan)]);
        while let Some((id, plan)) = pending.pop_front() {
            let Some(specs) = plan else {
                self.store.require_mut(&id)?.mark_waiting()?;
                continue;
            };

            let priority = self.store.require(&id)?.priority;
            let local: HashMap<&str, TaskId> = specs
                .iter()
                .map(|s| (s.local_id.as_str(), TaskId::new()))
                .collect();

            let mut children = Vec::with_capacity(specs.len());
            for spec in &specs {
                let mut child = Task::new(
                    &spec.task_type,
                    spec.params.clone(),
                    priority,
                    &spec.required_capability,
                )
                .with_parent(id)
                .with_dependencies(spec.depends_on.iter().filter_map(|d| local.get(d.as_str()).copied()));
                child.id = local[spec.local_id.as_str()];

                match self.plan(&child) {
                    Ok(child_plan) => pending.push_back((child.id, child_plan)),
                    Err(e) => {
                        tracing::warn!(task = %child.id, error = %e, "nested decomposition rejected");
                        let child_id = child.id;
                        child.fail(TaskError::new(
                            FailureKind::InvalidRequest,
                            e.to_string(),
                            child_id,
                        ))?;
                        rejected.push(child_id);
                    }
                }
                children.push(child.id);
                self.store.insert(child)?;
            }
            tracing::debug!(task = %id, children = children.len(), "task decomposed");
            self.store.require_mut(&id)?.mark_decomposed(children)?;
        }

        Ok((root_id, rejected))
    }

    /// Decompose `task` and validate the batch. `None` means leaf.
    fn plan(&self, task: &Task) -> Result<Option<Vec<SubtaskSpec>>> {
        match self.decomposer.decompose(&task.task_type, &task.params) {
            None => Ok(None),
            Some(specs) if specs.is_empty() => Ok(None),
            Some(specs) => {
                BatchGraph::from_specs(&specs)?;
                Ok(Some(specs))
            }
        }
    }

    /// Settle creation-time failures, then dispatch every released leaf.
    fn start_tree(&mut self, root: TaskId, rejected: Vec<TaskId>) -> Result<()> {
        tracing::trace!(root = %root, rejected = rejected.len(), "starting tree");
        self.propagate(VecDeque::from(rejected))
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Dispatch every waiting, released task in `candidates`, higher
    /// priority first, creation order otherwise.
    fn dispatch_all(
        &mut self,
        candidates: Vec<TaskId>,
        worklist: &mut VecDeque<TaskId>,
    ) -> Result<()> {
        let mut ready: Vec<(i32, TaskId)> = candidates
            .into_iter()
            .filter_map(|id| self.store.get(&id))
            .filter(|t| t.status == TaskStatus::Waiting)
            .map(|t| (t.priority, t.id))
            .collect();
        ready.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, id) in ready {
            self.dispatch(id, worklist)?;
        }
        Ok(())
    }

    /// Waiting -> Assigned, or Waiting -> Failed when nobody can run it.
    ///
    /// A task whose capable workers are all at their bound stays Waiting and
    /// is retried whenever propagation settles.
    fn dispatch(&mut self, id: TaskId, worklist: &mut VecDeque<TaskId>) -> Result<()> {
        let task = self.store.require(&id)?;
        if task.status != TaskStatus::Waiting || !self.store.released(&id) {
            return Ok(());
        }
        let capability = task.required_capability.clone();
        let assignment = Payload::TaskAssignment {
            task_id: id,
            task_type: task.task_type.clone(),
            capability: capability.clone(),
            params: task.params.clone(),
        };

        loop {
            let selected = {
                let store = &self.store;
                self.workers
                    .select(&capability, |w| store.active_load(w))
                    .cloned()
            };
            let Some(worker) = selected else {
                if self.workers.capable(&capability).next().is_some() {
                    tracing::debug!(
                        task = %id,
                        capability = %capability,
                        "capable workers busy, task queued"
                    );
                    return Ok(());
                }
                tracing::warn!(task = %id, capability = %capability, "no capable worker");
                self.store.require_mut(&id)?.fail(TaskError::new(
                    FailureKind::NoCapableWorker,
                    format!("no available worker advertises '{}'", capability),
                    id,
                ))?;
                worklist.push_back(id);
                return Ok(());
            };

            let envelope = Envelope::new(self.id.clone(), worker.clone(), assignment.clone());
            match self.transport.send(envelope) {
                Ok(()) => {
                    self.store.require_mut(&id)?.assign(worker.clone())?;
                    tracing::debug!(task = %id, worker = %worker, "task assigned");
                    return Ok(());
                }
                Err(Error::UnknownRecipient(_)) => {
                    tracing::warn!(worker = %worker, "worker left the transport, dropping it");
                    self.workers.remove(&worker);
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Propagation
    // ------------------------------------------------------------------

    /// Drain a worklist of newly terminal tasks, then dispatch every queued
    /// task that is released and fits on a worker.
    ///
    /// Each step gates dependents, then aggregates into the parent, then
    /// notifies the requester if a root finished. Anything that becomes
    /// terminal along the way is appended, so depth never grows the stack.
    fn propagate(&mut self, mut worklist: VecDeque<TaskId>) -> Result<()> {
        loop {
            self.settle(&mut worklist)?;
            // Finished work frees worker slots for queued tasks.
            let queued: Vec<TaskId> = self
                .store
                .by_status(TaskStatus::Waiting)
                .into_iter()
                .map(|t| t.id)
                .collect();
            self.dispatch_all(queued, &mut worklist)?;
            if worklist.is_empty() {
                return Ok(());
            }
        }
    }

    /// Retry every queued task.
    fn dispatch_backlog(&mut self) -> Result<()> {
        self.propagate(VecDeque::new())
    }

    fn settle(&mut self, worklist: &mut VecDeque<TaskId>) -> Result<()> {
        while let Some(id) = worklist.pop_front() {
            let Some(task) = self.store.get(&id) else {
                continue;
            };
            let status = task.status;
            let parent = task.parent_id;

            match status {
                TaskStatus::Completed => self.release_dependents(id, worklist)?,
                TaskStatus::Failed => {
                    self.fail_dependents(id, worklist)?;
                    self.cancel_descendants(id, worklist)?;
                }
                _ => continue,
            }

            match parent {
                Some(parent) => self.aggregate(parent, id, worklist)?,
                None => self.notify_requester(id),
            }
        }
        Ok(())
    }

    /// Dispatch the leaves that `completed` was holding back.
    fn release_dependents(
        &mut self,
        completed: TaskId,
        worklist: &mut VecDeque<TaskId>,
    ) -> Result<()> {
        let candidates: Vec<TaskId> = self
            .store
            .dependents_of(&completed)
            .to_vec()
            .into_iter()
            .flat_map(|d| self.store.subtree(&d))
            .collect();
        self.dispatch_all(candidates, worklist)
    }

    /// Fail every unfinished task that declared `failed` as a dependency.
    fn fail_dependents(&mut self, failed: TaskId, worklist: &mut VecDeque<TaskId>) -> Result<()> {
        let origin = self.origin_of(&failed);
        for dependent in self.store.dependents_of(&failed).to_vec() {
            let task = self.store.require_mut(&dependent)?;
            if task.is_finished() {
                continue;
            }
            task.fail(TaskError::new(
                FailureKind::DependencyUnsatisfiable,
                format!("dependency {} failed", failed.short()),
                origin,
            ))?;
            worklist.push_back(dependent);
        }
        Ok(())
    }

    /// Cancel the descendants of a failed task that have not been handed
    /// to a worker. In-flight tasks are left to finish.
    fn cancel_descendants(&mut self, failed: TaskId, worklist: &mut VecDeque<TaskId>) -> Result<()> {
        let origin = self.origin_of(&failed);
        let descendants: Vec<TaskId> = self.store.subtree(&failed).into_iter().skip(1).collect();
        for id in descendants {
            let task = self.store.require_mut(&id)?;
            if !matches!(
                task.status,
                TaskStatus::Pending | TaskStatus::Waiting | TaskStatus::Decomposed
            ) {
                continue;
            }
            task.fail(TaskError::new(
                FailureKind::Cancelled,
                format!("ancestor {} failed", failed.short()),
                origin,
            ))?;
            worklist.push_back(id);
        }
        Ok(())
    }

    /// Resolve `parent` from its children once the policy allows it.
    ///
    /// A parent that is no longer `Decomposed` has already been resolved, so
    /// calling this again is a no-op.
    fn aggregate(
        &mut self,
        parent: TaskId,
        trigger: TaskId,
        worklist: &mut VecDeque<TaskId>,
    ) -> Result<()> {
        if self.store.status(&parent) != Some(TaskStatus::Decomposed) {
            return Ok(());
        }
        let children = self.store.by_parent(&parent);

        let failure = match self.policy {
            FailurePolicy::FailFast => self
                .store
                .get(&trigger)
                .filter(|t| t.status == TaskStatus::Failed)
                .and_then(|t| t.error.clone()),
            FailurePolicy::CollectAll => {
                if !children.iter().all(|c| c.is_finished()) {
                    return Ok(());
                }
                children
                    .iter()
                    .filter(|c| c.status == TaskStatus::Failed)
                    .min_by_key(|c| c.completed_at)
                    .and_then(|c| c.error.clone())
                    .map(|e| e.with_partial(aggregate_results(&children)))
            }
        };

        if let Some(error) = failure {
            tracing::info!(task = %parent, kind = %error.kind, "decomposed task failed");
            self.store.require_mut(&parent)?.fail(error)?;
            worklist.push_back(parent);
            return Ok(());
        }

        if !children.iter().all(|c| c.status == TaskStatus::Completed) {
            return Ok(());
        }
        let result = aggregate_results(&children);
        tracing::debug!(task = %parent, "decomposed task completed");
        self.store.require_mut(&parent)?.complete(result)?;
        worklist.push_back(parent);
        Ok(())
    }

    fn origin_of(&self, id: &TaskId) -> TaskId {
        self.store
            .get(id)
            .and_then(|t| t.error.as_ref())
            .map(|e| e.origin)
            .unwrap_or(*id)
    }

    fn notify_requester(&mut self, root: TaskId) {
        let Some(task) = self.store.get(&root) else {
            return;
        };
        let payload = match (&task.result, &task.error) {
            (Some(result), _) if task.status == TaskStatus::Completed => Payload::TreeCompleted {
                root,
                result: result.clone(),
            },
            (_, Some(error)) => Payload::TreeFailed {
                root,
                error: error.clone(),
            },
            _ => return,
        };
        tracing::info!(root = %root, status = %task.status, "tree finished");

        let Some(requester) = self.requesters.remove(&root) else {
            return;
        };
        self.notify(
            Envelope::new(self.id.clone(), requester.participant, payload)
                .in_reply_to(requester.request),
        );
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn reply(&self, original: &Envelope, payload: Payload) {
        self.notify(Envelope::reply(original, self.id.clone(), payload));
    }

    /// Send, logging instead of failing when the peer has gone away.
    fn notify(&self, envelope: Envelope) {
        let kind = envelope.kind();
        if let Err(e) = self.transport.send(envelope) {
            tracing::warn!(kind = %kind, error = %e, "could not deliver message");
        }
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Start the event loop on its own tokio task.
    pub fn spawn(self, mailbox: Mailbox) -> ActorHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let name = format!("coordinator:{}", self.id);
        let task = tokio::spawn(async move {
            self.run(mailbox, token).await;
        });
        ActorHandle::new(name, cancel, task)
    }

    /// Run until cancelled, shut down, or the mailbox closes.
    ///
    /// Returns the coordinator so its final state can be inspected.
    pub async fn run(mut self, mut mailbox: Mailbox, cancel: CancellationToken) -> Self {
        tracing::info!(id = %self.id, policy = %self.policy, "coordinator started");
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sweeping = self.task_timeout.is_some();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("coordinator cancelled");
                    break;
                }
                envelope = mailbox.recv() => {
                    let Some(envelope) = envelope else {
                        tracing::debug!("coordinator mailbox closed");
                        break;
                    };
                    if matches!(envelope.payload(), Payload::Shutdown) {
                        tracing::debug!(from = %envelope.sender(), "coordinator shutdown requested");
                        break;
                    }
                    if let Err(e) = self.handle(envelope) {
                        tracing::error!(error = %e, "coordinator failed to handle message");
                    }
                }
                _ = sweep.tick(), if sweeping => {
                    if let Err(e) = self.check_timeouts(Utc::now()) {
                        tracing::error!(error = %e, "timeout sweep failed");
                    }
                }
            }
        }
        tracing::info!(id = %self.id, tasks = self.store.len(), "coordinator stopped");
        self
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("id", &self.id)
            .field("store", &self.store)
            .field("workers", &self.workers.len())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Map each completed child's type to its result.
///
/// Children sharing a type are collected into an array in child order.
fn aggregate_results(children: &[&Task]) -> Value {
    let mut out = Map::new();
    let mut collected: HashSet<&str> = HashSet::new();
    for child in children {
        if child.status != TaskStatus::Completed {
            continue;
        }
        let Some(result) = child.result.clone() else {
            continue;
        };
        let key = child.task_type.as_str();
        match out.get_mut(key) {
            None => {
                out.insert(key.to_string(), result);
            }
            Some(Value::Array(items)) if collected.contains(key) => items.push(result),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, result]);
                collected.insert(key);
            }
        }
    }
    Value::Object(out)
}
