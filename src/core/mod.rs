//! Core domain models for orchestration.
//!
//! Tasks, the id-indexed task store, and validation of decomposition
//! batches.

pub mod dag;
pub mod store;
pub mod task;

pub use dag::BatchGraph;
pub use store::TaskStore;
pub use task::{FailureKind, Params, Task, TaskError, TaskId, TaskStatus};
