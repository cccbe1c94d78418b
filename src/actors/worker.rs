//! Worker actor.
//!
//! A worker advertises a fixed set of capabilities, each backed by an
//! [`Executor`] chosen when the worker is built. It acknowledges or rejects
//! every assignment, runs accepted tasks concurrently in their own tokio
//! tasks, and reports exactly one result per accepted task unless the
//! coordinator cancels it first.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::ActorHandle;
use crate::core::task::{Params, TaskId};
use crate::error::Result;
use crate::transport::{Envelope, Mailbox, ParticipantId, Payload, TaskOutcome, Transport};

/// The work handed to an executor.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub task_id: TaskId,
    pub task_type: String,
    pub capability: String,
    pub params: Params,
}

/// Something that can run tasks for one capability.
///
/// An `Err` is reported to the coordinator as a worker-reported failure.
pub trait Executor: Send + Sync {
    fn execute(&self, assignment: Assignment) -> BoxFuture<'_, std::result::Result<Value, String>>;
}

struct FnExecutor<F>(F);

impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(Assignment) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
{
    fn execute(&self, assignment: Assignment) -> BoxFuture<'_, std::result::Result<Value, String>> {
        Box::pin((self.0)(assignment))
    }
}

/// Wrap an async closure as an executor.
pub fn executor_fn<F, Fut>(f: F) -> Arc<dyn Executor>
where
    F: Fn(Assignment) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
{
    Arc::new(FnExecutor(f))
}

/// Reports back what it was asked to do.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoExecutor;

impl Executor for EchoExecutor {
    fn execute(&self, assignment: Assignment) -> BoxFuture<'_, std::result::Result<Value, String>> {
        Box::pin(async move {
            Ok(json!({
                "task_type": assignment.task_type,
                "capability": assignment.capability,
                "params": assignment.params,
            }))
        })
    }
}

type InFlight = Arc<Mutex<HashMap<TaskId, CancellationToken>>>;

pub struct Worker {
    id: ParticipantId,
    coordinator: ParticipantId,
    transport: Transport,
    executors: BTreeMap<String, Arc<dyn Executor>>,
    max_concurrent: usize,
    load: Arc<AtomicUsize>,
    in_flight: InFlight,
}

impl Worker {
    pub fn new(
        id: impl Into<ParticipantId>,
        coordinator: impl Into<ParticipantId>,
        transport: Transport,
    ) -> Self {
        Self {
            id: id.into(),
            coordinator: coordinator.into(),
            transport,
            executors: BTreeMap::new(),
            max_concurrent: usize::MAX,
            load: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::default(),
        }
    }

    /// Advertise `capability`, executed by `executor`.
    pub fn with_executor(mut self, capability: &str, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(capability.to_string(), executor);
        self
    }

    /// Bound on tasks executing at once. It is announced on registration so
    /// the coordinator never assigns past it; an assignment that still
    /// arrives over the bound is rejected.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    /// Advertised capabilities, sorted.
    pub fn capabilities(&self) -> Vec<String> {
        self.executors.keys().cloned().collect()
    }

    /// Accepted tasks that have not finished yet.
    pub fn current_load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }

    /// Shared view of the load counter, readable after `spawn`.
    pub fn load_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.load)
    }

    /// Register with the coordinator and start the receive loop.
    ///
    /// The registration is enqueued before this returns, so anything sent to
    /// the coordinator afterwards is processed after it.
    ///
    /// # Errors
    /// Returns `Error::UnknownRecipient` if the coordinator is not on the
    /// transport.
    pub fn spawn(self, mailbox: Mailbox) -> Result<ActorHandle> {
        self.transport.send(Envelope::new(
            self.id.clone(),
            self.coordinator.clone(),
            Payload::RegisterWorker {
                capabilities: self.capabilities(),
                max_concurrent: Some(self.max_concurrent),
            },
        ))?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let name = format!("worker:{}", self.id);
        tracing::debug!(worker = %self.id, capabilities = ?self.capabilities(), "Worker::spawn");

        let task = tokio::spawn(async move { self.run(mailbox, token).await });
        Ok(ActorHandle::new(name, cancel, task))
    }

    async fn run(self, mut mailbox: Mailbox, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(worker = %self.id, "worker cancelled");
                    break;
                }
                envelope = mailbox.recv() => {
                    let Some(envelope) = envelope else {
                        tracing::debug!(worker = %self.id, "worker mailbox closed");
                        break;
                    };
                    match envelope.into_payload() {
                        Payload::TaskAssignment { task_id, task_type, capability, params } => {
                            self.accept(
                                Assignment { task_id, task_type, capability, params },
                                &cancel,
                            );
                        }
                        Payload::TaskCancelled { task_id } => self.cancel_task(task_id),
                        Payload::WorkerRegistered => {
                            tracing::debug!(worker = %self.id, "registration acknowledged");
                        }
                        Payload::Shutdown => break,
                        other => {
                            tracing::debug!(worker = %self.id, kind = %other.kind(), "ignored");
                        }
                    }
                }
            }
        }
        // Drops every in-flight execution at its next await point.
        cancel.cancel();
        tracing::info!(worker = %self.id, "worker stopped");
    }

    fn send(&self, payload: Payload) {
        let envelope = Envelope::new(self.id.clone(), self.coordinator.clone(), payload);
        if let Err(e) = self.transport.send(envelope) {
            tracing::warn!(worker = %self.id, error = %e, "could not reach coordinator");
        }
    }

    fn reject(&self, task_id: TaskId, reason: String) {
        tracing::warn!(worker = %self.id, task = %task_id, reason = %reason, "rejecting task");
        self.send(Payload::TaskRejected { task_id, reason });
    }

    fn accept(&self, assignment: Assignment, cancel: &CancellationToken) {
        let task_id = assignment.task_id;
        let Some(executor) = self.executors.get(&assignment.capability).cloned() else {
            self.reject(
                task_id,
                format!("capability '{}' not offered", assignment.capability),
            );
            return;
        };

        let previous = self.load.fetch_add(1, Ordering::SeqCst);
        if previous >= self.max_concurrent {
            self.load.fetch_sub(1, Ordering::SeqCst);
            self.reject(task_id, format!("at capacity ({})", self.max_concurrent));
            return;
        }
        self.send(Payload::TaskAccepted { task_id });

        let token = cancel.child_token();
        lock(&self.in_flight).insert(task_id, token.clone());

        let worker = self.id.clone();
        let coordinator = self.coordinator.clone();
        let transport = self.transport.clone();
        let load = Arc::clone(&self.load);
        let in_flight = Arc::clone(&self.in_flight);
        tracing::debug!(worker = %worker, task = %task_id, "executing");

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => None,
                result = executor.execute(assignment) => Some(result),
            };
            // Whoever removes the entry releases the slot, before any
            // result goes out.
            let owned = lock(&in_flight).remove(&task_id).is_some();
            if owned {
                load.fetch_sub(1, Ordering::SeqCst);
            }
            let Some(outcome) = outcome.filter(|_| owned) else {
                tracing::debug!(worker = %worker, task = %task_id, "execution dropped");
                return;
            };

            let outcome = match outcome {
                Ok(result) => TaskOutcome::Completed { result },
                Err(error) => TaskOutcome::Failed { error },
            };
            let reported = transport.send(Envelope::new(
                worker.clone(),
                coordinator,
                Payload::TaskResult { task_id, outcome },
            ));
            if let Err(e) = reported {
                tracing::warn!(worker = %worker, task = %task_id, error = %e, "result not delivered");
            }
        });
    }

    fn cancel_task(&self, task_id: TaskId) {
        match lock(&self.in_flight).remove(&task_id) {
            Some(token) => {
                tracing::info!(worker = %self.id, task = %task_id, "cancelling execution");
                token.cancel();
                self.load.fetch_sub(1, Ordering::SeqCst);
            }
            None => tracing::debug!(worker = %self.id, task = %task_id, "nothing to cancel"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities())
            .field("load", &self.current_load())
            .finish()
    }
}
