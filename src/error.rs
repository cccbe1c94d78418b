use thiserror::Error;

use crate::core::task::{TaskId, TaskStatus};
use crate::transport::ParticipantId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid decomposition: {0}")]
    InvalidDecomposition(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for task {task} from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Unknown recipient: {0}")]
    UnknownRecipient(ParticipantId),

    #[error("Participant already registered: {0}")]
    ParticipantExists(ParticipantId),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::NoHomeDir), "No home directory");
        assert_eq!(
            format!("{}", Error::InvalidRequest("missing request_type".to_string())),
            "Invalid request: missing request_type"
        );
        assert_eq!(
            format!("{}", Error::UnknownRecipient(ParticipantId::from("ghost"))),
            "Unknown recipient: ghost"
        );
    }

    #[test]
    fn test_invalid_transition_display() {
        let task = TaskId::new();
        let err = Error::InvalidTransition {
            task,
            from: TaskStatus::Completed,
            to: TaskStatus::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains(&task.to_string()));
        assert!(msg.contains("completed"));
        assert!(msg.contains("running"));
    }
}
