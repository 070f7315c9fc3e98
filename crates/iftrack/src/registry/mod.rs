pub mod service;

pub use service::{
    DisplayEntry, IgnoreOutcome, ScanOutcome, TaskUpsert, TaskUpsertFields, Viewer,
};
