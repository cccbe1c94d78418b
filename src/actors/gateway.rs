//! Requester-facing gateway.
//!
//! The gateway is a transport participant like any other. Callers submit a
//! request and get the root task id back as soon as the coordinator accepts
//! it; the tree's outcome arrives later and can be polled or awaited. A
//! background pump routes every reply to whoever is waiting for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::ActorHandle;
use crate::core::task::{Task, TaskError, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::TaskRequest;
use crate::transport::{Envelope, Mailbox, MessageId, ParticipantId, Payload, Transport};

/// Final outcome of a task tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TreeOutcome {
    Completed { result: Value },
    Failed { error: TaskError },
}

impl TreeOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TreeOutcome::Completed { .. })
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            TreeOutcome::Completed { result } => Some(result),
            TreeOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            TreeOutcome::Completed { .. } => None,
            TreeOutcome::Failed { error } => Some(error),
        }
    }
}

#[derive(Default)]
struct GatewayState {
    accepts: HashMap<MessageId, oneshot::Sender<Result<TaskId>>>,
    reports: HashMap<MessageId, oneshot::Sender<Option<Task>>>,
    outcomes: HashMap<TaskId, TreeOutcome>,
    waiters: HashMap<TaskId, Vec<oneshot::Sender<TreeOutcome>>>,
}

type SharedState = Arc<Mutex<GatewayState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, GatewayState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Gateway {
    id: ParticipantId,
    coordinator: ParticipantId,
    transport: Transport,
    state: SharedState,
    pump: ActorHandle,
}

impl Gateway {
    /// Register `id` on the transport and start routing replies.
    pub fn start(
        id: impl Into<ParticipantId>,
        coordinator: impl Into<ParticipantId>,
        transport: Transport,
    ) -> Result<Self> {
        let mailbox = transport.register(id)?;
        Ok(Self::spawn(mailbox, coordinator, transport))
    }

    /// Start the gateway on a mailbox that is already registered.
    pub fn spawn(
        mailbox: Mailbox,
        coordinator: impl Into<ParticipantId>,
        transport: Transport,
    ) -> Self {
        let id = mailbox.id().clone();
        let state = SharedState::default();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let pump_state = Arc::clone(&state);
        let task = tokio::spawn(async move { pump(mailbox, pump_state, token).await });
        tracing::debug!(gateway = %id, "Gateway::spawn");

        Self {
            pump: ActorHandle::new(format!("gateway:{}", id), cancel, task),
            id,
            coordinator: coordinator.into(),
            transport,
            state,
        }
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    /// Submit a request and return the root task id.
    ///
    /// Resolves once the coordinator acknowledges; it does not wait for the
    /// tree to finish.
    ///
    /// # Errors
    /// Returns `Error::InvalidRequest` if the coordinator rejects the
    /// request, and `Error::ChannelClosed` if the gateway stops first.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        let envelope = Envelope::new(
            self.id.clone(),
            self.coordinator.clone(),
            Payload::Request {
                request_type: request.request_type,
                params: request.params,
                priority: request.priority,
                capability: request.capability,
            },
        );
        let (tx, rx) = oneshot::channel();
        lock(&self.state).accepts.insert(envelope.id(), tx);

        let message = envelope.id();
        if let Err(e) = self.transport.send(envelope) {
            lock(&self.state).accepts.remove(&message);
            return Err(e);
        }
        rx.await
            .map_err(|_| Error::ChannelClosed("gateway stopped before acknowledgement".to_string()))?
    }

    /// Outcome of `root` if it has already finished.
    ///
    /// Polling does not consume the outcome: it stays retained until a
    /// `wait` takes it or `forget` drops it.
    pub fn poll(&self, root: &TaskId) -> Option<TreeOutcome> {
        lock(&self.state).outcomes.get(root).cloned()
    }

    /// Drop the retained outcome of `root`, returning it if there was one.
    pub fn forget(&self, root: &TaskId) -> Option<TreeOutcome> {
        lock(&self.state).outcomes.remove(root)
    }

    /// Wait for `root` to finish and take its outcome.
    ///
    /// The outcome is handed over rather than retained, so a later `poll`
    /// for the same root returns `None`.
    pub async fn wait(&self, root: TaskId) -> Result<TreeOutcome> {
        let rx = {
            let mut state = lock(&self.state);
            if let Some(outcome) = state.outcomes.remove(&root) {
                return Ok(outcome);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(root).or_default().push(tx);
            rx
        };
        rx.await
            .map_err(|_| Error::ChannelClosed(format!("gateway stopped while waiting on {}", root)))
    }

    /// Like `wait`, bounded by `limit`.
    pub async fn wait_timeout(&self, root: TaskId, limit: Duration) -> Result<TreeOutcome> {
        match tokio::time::timeout(limit, self.wait(root)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let mut state = lock(&self.state);
                if let Some(waiters) = state.waiters.get_mut(&root) {
                    waiters.retain(|tx| !tx.is_closed());
                    if waiters.is_empty() {
                        state.waiters.remove(&root);
                    }
                }
                Err(Error::Timeout(limit))
            }
        }
    }

    /// Ask the coordinator for a snapshot of one task.
    pub async fn status(&self, task_id: TaskId) -> Result<Option<Task>> {
        let envelope = Envelope::new(
            self.id.clone(),
            self.coordinator.clone(),
            Payload::StatusInquiry { task_id },
        );
        let (tx, rx) = oneshot::channel();
        let message = envelope.id();
        lock(&self.state).reports.insert(message, tx);
        if let Err(e) = self.transport.send(envelope) {
            lock(&self.state).reports.remove(&message);
            return Err(e);
        }
        rx.await
            .map_err(|_| Error::ChannelClosed("gateway stopped before status report".to_string()))
    }

    /// Stop the pump and leave the transport. Pending calls fail with
    /// `Error::ChannelClosed`.
    pub async fn shutdown(self) -> Result<()> {
        self.transport.unregister(&self.id);
        let result = self.pump.stop().await;
        let mut state = lock(&self.state);
        state.accepts.clear();
        state.reports.clear();
        state.waiters.clear();
        result
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("id", &self.id)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

async fn pump(mut mailbox: Mailbox, state: SharedState, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            envelope = mailbox.recv() => {
                let Some(envelope) = envelope else { break };
                route(&state, envelope);
            }
        }
    }
    tracing::debug!(gateway = %mailbox.id(), "gateway pump stopped");
}

fn route(state: &SharedState, envelope: Envelope) {
    let reply_to = envelope.reply_to();
    let mut state = lock(state);
    match envelope.into_payload() {
        Payload::RequestAccepted { root } => {
            if let Some(tx) = reply_to.and_then(|id| state.accepts.remove(&id)) {
                let _ = tx.send(Ok(root));
            }
        }
        Payload::RequestRejected { message } => {
            if let Some(tx) = reply_to.and_then(|id| state.accepts.remove(&id)) {
                let _ = tx.send(Err(Error::InvalidRequest(message)));
            }
        }
        Payload::TreeCompleted { root, result } => {
            finish(&mut state, root, TreeOutcome::Completed { result });
        }
        Payload::TreeFailed { root, error } => {
            finish(&mut state, root, TreeOutcome::Failed { error });
        }
        Payload::StatusReport { snapshot, .. } => {
            if let Some(tx) = reply_to.and_then(|id| state.reports.remove(&id)) {
                let _ = tx.send(snapshot.map(|task| *task));
            }
        }
        other => tracing::debug!(kind = %other.kind(), "gateway ignored message"),
    }
}

fn finish(state: &mut GatewayState, root: TaskId, outcome: TreeOutcome) {
    tracing::info!(root = %root, completed = outcome.is_completed(), "tree outcome received");
    let mut delivered = false;
    for waiter in state.waiters.remove(&root).unwrap_or_default() {
        delivered |= waiter.send(outcome.clone()).is_ok();
    }
    if !delivered {
        state.outcomes.insert(root, outcome);
    }
}
