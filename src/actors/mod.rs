//! Actors that run alongside the coordinator.
//!
//! Each actor is an independent tokio task that talks to the rest of the
//! system only through its transport mailbox:
//! - [`Worker`] executes assignments for the capabilities it advertises
//! - [`Gateway`] submits requests and routes outcomes back to callers

pub mod gateway;
pub mod worker;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub use gateway::{Gateway, TreeOutcome};
pub use worker::{executor_fn, Assignment, EchoExecutor, Executor, Worker};

/// Handle to a running actor, used for graceful shutdown.
pub struct ActorHandle {
    name: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ActorHandle {
    pub fn new(name: impl Into<String>, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            cancel,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the actor to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Check if shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the actor's task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the actor's task to exit.
    pub async fn join(mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| Error::TaskJoin(format!("{}: {}", self.name, e))),
            None => Ok(()),
        }
    }

    /// Shut down and wait.
    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        self.join().await
    }
}

impl std::fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
