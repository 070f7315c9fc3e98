//! Durable write-task pipeline: Excel + registry mutations.
//!
//! User-initiated mutations are never executed synchronously. They are
//! persisted as `WriteTask`s, executed by a single worker thread, verified
//! against the workbook, and only then pushed into the registry. Listeners
//! (the pending-override cache) observe every state change.

pub mod executor;
pub mod queue;
pub mod task;

pub use queue::{RegistryNotifier, TaskListener, WriteTaskQueue};
pub use task::{AssignmentItem, ResponsePayload, TaskPayload, WriteTask, WriteTaskStatus};
