//! Message envelopes exchanged between participants.
//!
//! An envelope is immutable once built: fields are private and exposed
//! through accessors only. The type tag is derived from the payload, so the
//! two can never disagree.

use super::ParticipantId;
use crate::core::task::{Params, Task, TaskError, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an envelope goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Address {
    Participant(ParticipantId),
    /// Every registered participant except the sender.
    Broadcast,
}

impl From<ParticipantId> for Address {
    fn from(id: ParticipantId) -> Self {
        Address::Participant(id)
    }
}

impl From<&ParticipantId> for Address {
    fn from(id: &ParticipantId) -> Self {
        Address::Participant(id.clone())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Participant(id) => write!(f, "{}", id),
            Address::Broadcast => write!(f, "*"),
        }
    }
}

/// Outcome a worker reports for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TaskOutcome {
    Completed { result: Value },
    Failed { error: String },
}

/// Message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Payload {
    /// Requester asks for a new task tree.
    Request {
        request_type: String,
        #[serde(default)]
        params: Params,
        #[serde(default)]
        priority: i32,
        /// Capability for a leaf root; defaults to the request type.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capability: Option<String>,
    },
    /// Immediate acknowledgement carrying the root task id.
    RequestAccepted { root: TaskId },
    RequestRejected { message: String },
    /// Coordinator hands a leaf task to a worker.
    TaskAssignment {
        task_id: TaskId,
        task_type: String,
        capability: String,
        params: Params,
    },
    TaskAccepted { task_id: TaskId },
    TaskRejected { task_id: TaskId, reason: String },
    /// Best-effort notice that the coordinator stopped waiting.
    TaskCancelled { task_id: TaskId },
    TaskResult { task_id: TaskId, outcome: TaskOutcome },
    /// `result` is keyed by child task type. When several children share a
    /// type, that key holds an array of their results in child order, so
    /// a key's shape depends on the decomposition rather than the data.
    /// Leaf roots carry the worker's value as-is.
    TreeCompleted { root: TaskId, result: Value },
    TreeFailed { root: TaskId, error: TaskError },
    /// `max_concurrent` bounds the tasks the coordinator will keep assigned
    /// to this worker at once; absent means unbounded.
    RegisterWorker {
        capabilities: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrent: Option<usize>,
    },
    WorkerRegistered,
    WorkerAvailability { available: bool },
    StatusInquiry { task_id: TaskId },
    StatusReport {
        task_id: TaskId,
        snapshot: Option<Box<Task>>,
    },
    Shutdown,
}

/// Type tag of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    RequestAccepted,
    RequestRejected,
    TaskAssignment,
    TaskAccepted,
    TaskRejected,
    TaskCancelled,
    TaskResult,
    TreeCompleted,
    TreeFailed,
    RegisterWorker,
    WorkerRegistered,
    WorkerAvailability,
    StatusInquiry,
    StatusReport,
    Shutdown,
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Request { .. } => MessageKind::Request,
            Payload::RequestAccepted { .. } => MessageKind::RequestAccepted,
            Payload::RequestRejected { .. } => MessageKind::RequestRejected,
            Payload::TaskAssignment { .. } => MessageKind::TaskAssignment,
            Payload::TaskAccepted { .. } => MessageKind::TaskAccepted,
            Payload::TaskRejected { .. } => MessageKind::TaskRejected,
            Payload::TaskCancelled { .. } => MessageKind::TaskCancelled,
            Payload::TaskResult { .. } => MessageKind::TaskResult,
            Payload::TreeCompleted { .. } => MessageKind::TreeCompleted,
            Payload::TreeFailed { .. } => MessageKind::TreeFailed,
            Payload::RegisterWorker { .. } => MessageKind::RegisterWorker,
            Payload::WorkerRegistered => MessageKind::WorkerRegistered,
            Payload::WorkerAvailability { .. } => MessageKind::WorkerAvailability,
            Payload::StatusInquiry { .. } => MessageKind::StatusInquiry,
            Payload::StatusReport { .. } => MessageKind::StatusReport,
            Payload::Shutdown => MessageKind::Shutdown,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reuse the serde names so logs match the wire format.
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self));
        write!(f, "{}", name)
    }
}

/// An addressed, immutable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    id: MessageId,
    sender: ParticipantId,
    recipient: Address,
    kind: MessageKind,
    payload: Payload,
    reply_to: Option<MessageId>,
    timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(sender: ParticipantId, recipient: impl Into<Address>, payload: Payload) -> Self {
        Self {
            id: MessageId::new(),
            sender,
            recipient: recipient.into(),
            kind: payload.kind(),
            payload,
            reply_to: None,
            timestamp: Utc::now(),
        }
    }

    /// A reply addressed to the sender of `original`.
    pub fn reply(original: &Envelope, sender: ParticipantId, payload: Payload) -> Self {
        Self::new(sender, original.sender.clone(), payload).in_reply_to(original.id)
    }

    /// Link this envelope to the message it answers.
    pub fn in_reply_to(mut self, original: MessageId) -> Self {
        self.reply_to = Some(original);
        self
    }

    pub fn broadcast(sender: ParticipantId, payload: Payload) -> Self {
        Self::new(sender, Address::Broadcast, payload)
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn sender(&self) -> &ParticipantId {
        &self.sender
    }

    pub fn recipient(&self) -> &Address {
        &self.recipient
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn reply_to(&self) -> Option<MessageId> {
        self.reply_to
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Copy of this envelope readdressed to one broadcast target.
    pub(crate) fn delivered_to(&self, recipient: &ParticipantId) -> Self {
        let mut copy = self.clone();
        copy.recipient = Address::Participant(recipient.clone());
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::from(s)
    }

    #[test]
    fn test_kind_follows_payload() {
        let env = Envelope::new(pid("a"), pid("b"), Payload::WorkerRegistered);
        assert_eq!(env.kind(), MessageKind::WorkerRegistered);

        let env = Envelope::new(
            pid("a"),
            pid("b"),
            Payload::TaskResult {
                task_id: TaskId::new(),
                outcome: TaskOutcome::Completed { result: json!(1) },
            },
        );
        assert_eq!(env.kind(), MessageKind::TaskResult);
    }

    #[test]
    fn test_reply_links_original() {
        let request = Envelope::new(
            pid("gateway"),
            pid("coordinator"),
            Payload::Request {
                request_type: "market_trend".to_string(),
                params: Params::new(),
                priority: 1,
                capability: None,
            },
        );
        let reply = Envelope::reply(
            &request,
            pid("coordinator"),
            Payload::RequestAccepted { root: TaskId::new() },
        );
        assert_eq!(reply.reply_to(), Some(request.id()));
        assert_eq!(reply.recipient(), &Address::Participant(pid("gateway")));
        assert_eq!(reply.sender(), &pid("coordinator"));
    }

    #[test]
    fn test_message_ids_unique() {
        let a = Envelope::new(pid("a"), pid("b"), Payload::Shutdown);
        let b = Envelope::new(pid("a"), pid("b"), Payload::Shutdown);
        assert_ne!(a.id(), b.id());
        assert!(a.reply_to().is_none());
    }

    #[test]
    fn test_message_kind_display() {
        assert_eq!(MessageKind::TaskAssignment.to_string(), "task_assignment");
        assert_eq!(MessageKind::TreeFailed.to_string(), "tree_failed");
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::Broadcast.to_string(), "*");
        assert_eq!(Address::from(pid("w1")).to_string(), "w1");
    }

    #[test]
    fn test_payload_json_shape() {
        let payload = Payload::TaskResult {
            task_id: TaskId::new(),
            outcome: TaskOutcome::Failed {
                error: "provider unavailable".to_string(),
            },
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "task_result");
        assert_eq!(value["outcome"]["status"], "failed");
        assert_eq!(value["outcome"]["error"], "provider unavailable");
    }

    #[test]
    fn test_request_defaults_when_deserializing() {
        let payload: Payload =
            serde_json::from_value(json!({"type": "request", "request_type": "price_analysis"}))
                .unwrap();
        match payload {
            Payload::Request {
                request_type,
                params,
                priority,
                capability,
            } => {
                assert_eq!(request_type, "price_analysis");
                assert!(params.is_empty());
                assert_eq!(priority, 0);
                assert!(capability.is_none());
            }
            other => panic!("Expected Request, got {:?}", other),
        }
    }
}
