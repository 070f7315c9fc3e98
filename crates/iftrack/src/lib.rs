pub mod config;
pub mod db;
pub mod error;
pub mod excel;
pub mod hooks;
pub mod keys;
pub mod logging;
pub mod overrides;
pub mod pipeline;
pub mod registry;
pub mod roles;
pub mod writer;

pub use db::{Database, DbError};
pub use error::{ConfigError, ExcelError, IftrackError, Result, WorkerError};
pub use hooks::{Hooks, Notice, RegistryBridge};
pub use keys::{FileType, TaskKey};
pub use overrides::{GridRow, PendingOverrides};
pub use pipeline::{WriteTask, WriteTaskQueue, WriteTaskStatus};
pub use registry::{DisplayEntry, TaskUpsert, TaskUpsertFields, Viewer};
pub use writer::WriteQueue;
