//! Orchestration layer.
//!
//! The [`Coordinator`] owns the task graph and makes every scheduling
//! decision; the [`WorkerRegistry`] is its record of who can run what.

pub mod coordinator;
pub mod registry;

pub use coordinator::{Coordinator, TaskRequest};
pub use registry::{WorkerRecord, WorkerRegistry};
