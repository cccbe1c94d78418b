//! In-process message transport.
//!
//! Every participant registers a unique id and receives a [`Mailbox`].
//! Delivery is asynchronous relative to the sender: `send` only enqueues,
//! and the recipient picks envelopes up on its own schedule. Order is
//! preserved per sender/recipient pair; nothing is promised across senders.

mod envelope;

pub use envelope::{Address, Envelope, MessageId, MessageKind, Payload, TaskOutcome};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Name a participant is registered under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct Inbox {
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Inbox {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        // A poisoned queue still holds valid envelopes.
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, envelope: Envelope) {
        self.queue().push_back(envelope);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Envelope> {
        self.queue().pop_front()
    }

    fn drain(&self) -> Vec<Envelope> {
        self.queue().drain(..).collect()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        // Wake a recv that has not started waiting yet.
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Registry {
    order: Vec<ParticipantId>,
    inboxes: HashMap<ParticipantId, Arc<Inbox>>,
}

/// Shared handle to the message bus. Cheap to clone.
#[derive(Clone, Default)]
pub struct Transport {
    inner: Arc<Mutex<Registry>>,
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `id` and return its mailbox.
    ///
    /// # Errors
    /// Returns `Error::ParticipantExists` if the id is already taken.
    pub fn register(&self, id: impl Into<ParticipantId>) -> Result<Mailbox> {
        let id = id.into();
        let mut registry = self.registry();
        if registry.inboxes.contains_key(&id) {
            return Err(Error::ParticipantExists(id));
        }
        let inbox = Arc::new(Inbox::default());
        registry.order.push(id.clone());
        registry.inboxes.insert(id.clone(), Arc::clone(&inbox));
        tracing::debug!(participant = %id, "registered on transport");
        Ok(Mailbox { id, inbox })
    }

    /// Remove `id`. Its mailbox is closed; queued envelopes stay readable.
    pub fn unregister(&self, id: &ParticipantId) -> bool {
        let mut registry = self.registry();
        let Some(inbox) = registry.inboxes.remove(id) else {
            return false;
        };
        registry.order.retain(|p| p != id);
        inbox.close();
        tracing::debug!(participant = %id, "unregistered from transport");
        true
    }

    /// Registered participants in registration order.
    pub fn participants(&self) -> Vec<ParticipantId> {
        self.registry().order.clone()
    }

    /// Enqueue `envelope` for its recipient.
    ///
    /// A broadcast reaches every registered participant except the sender,
    /// in registration order, and succeeds even when nobody else is
    /// registered.
    ///
    /// # Errors
    /// Returns `Error::UnknownRecipient` if a direct recipient is not
    /// registered.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        let registry = self.registry();
        match envelope.recipient() {
            Address::Participant(id) => {
                let inbox = registry
                    .inboxes
                    .get(id)
                    .ok_or_else(|| Error::UnknownRecipient(id.clone()))?;
                tracing::trace!(
                    from = %envelope.sender(),
                    to = %id,
                    kind = %envelope.kind(),
                    "send"
                );
                inbox.push(envelope);
            }
            Address::Broadcast => {
                for id in &registry.order {
                    if id == envelope.sender() {
                        continue;
                    }
                    if let Some(inbox) = registry.inboxes.get(id) {
                        inbox.push(envelope.delivered_to(id));
                    }
                }
                tracing::trace!(
                    from = %envelope.sender(),
                    kind = %envelope.kind(),
                    "broadcast"
                );
            }
        }
        Ok(())
    }

    /// Take every envelope queued for `id`, oldest first.
    ///
    /// # Errors
    /// Returns `Error::UnknownRecipient` if `id` is not registered.
    pub fn drain(&self, id: &ParticipantId) -> Result<Vec<Envelope>> {
        let inbox = self
            .registry()
            .inboxes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownRecipient(id.clone()))?;
        Ok(inbox.drain())
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("participants", &self.registry().order)
            .finish()
    }
}

/// Receiving end for one participant.
pub struct Mailbox {
    id: ParticipantId,
    inbox: Arc<Inbox>,
}

impl Mailbox {
    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    /// Wait for the next envelope.
    ///
    /// Returns `None` once the participant is unregistered and the queue is
    /// empty.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let notified = self.inbox.notify.notified();
            if let Some(envelope) = self.inbox.pop() {
                return Some(envelope);
            }
            if self.inbox.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Next envelope if one is already queued.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.inbox.pop()
    }

    /// Take every queued envelope, oldest first.
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.inbox.drain()
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").field("id", &self.id).finish()
    }
}
