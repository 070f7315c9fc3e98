//! Write-task types and their JSON representation.
//!
//! The payload is a tagged enum so the persisted state file and the shared
//! write log stay forward-compatible: unknown discriminators fail loudly
//! at deserialization instead of silently mis-executing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::write_log_repo::WriteLogRow;
use crate::keys::FileType;

/// One row of an assignment batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentItem {
    pub file_type: FileType,
    pub file_path: String,
    pub row_index: u32,
    pub project_id: String,
    pub interface_id: String,
    pub assigned_name: String,
    pub assigned_by: String,
}

/// A single response write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponsePayload {
    pub file_path: String,
    pub file_type: FileType,
    pub row_index: u32,
    pub project_id: String,
    pub interface_id: String,
    pub response_number: String,
    pub user_name: String,
    /// For type-3 sheets, which trigger column held the source value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_column: Option<String>,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    Assignment { items: Vec<AssignmentItem> },
    Response(ResponsePayload),
}

impl TaskPayload {
    pub fn task_type(&self) -> &'static str {
        match self {
            TaskPayload::Assignment { .. } => "assignment",
            TaskPayload::Response(_) => "response",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WriteTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WriteTaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteTaskStatus::Pending => "pending",
            WriteTaskStatus::Running => "running",
            WriteTaskStatus::Completed => "completed",
            WriteTaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WriteTaskStatus::Completed | WriteTaskStatus::Failed)
    }
}

/// One durable queue entry. `id` is a submitter-side UUID, distinct from
/// the registry task id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteTask {
    pub id: String,
    pub submitted_by: String,
    pub submitted_at: String,
    pub description: String,
    pub status: WriteTaskStatus,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
    pub payload: TaskPayload,
}

impl WriteTask {
    pub fn new_assignment(items: Vec<AssignmentItem>, submitted_by: &str, now: DateTime<Utc>) -> Self {
        let description = format!("批量指派 {} 行", items.len());
        Self::new(TaskPayload::Assignment { items }, submitted_by, description, now)
    }

    pub fn new_response(payload: ResponsePayload, now: DateTime<Utc>) -> Self {
        let description = format!("{} 回复", payload.interface_id);
        let submitted_by = payload.user_name.clone();
        Self::new(TaskPayload::Response(payload), &submitted_by, description, now)
    }

    fn new(payload: TaskPayload, submitted_by: &str, description: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            submitted_by: submitted_by.to_string(),
            submitted_at: now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            description,
            status: WriteTaskStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            payload,
        }
    }

    /// First file the payload touches, used for quick filtering in the
    /// shared log.
    fn primary_target(&self) -> (Option<String>, Option<u8>, Option<String>, Option<u32>) {
        match &self.payload {
            TaskPayload::Assignment { items } => match items.first() {
                Some(item) => (
                    Some(item.file_path.clone()),
                    Some(item.file_type.as_u8()),
                    Some(item.project_id.clone()),
                    Some(item.row_index),
                ),
                None => (None, None, None, None),
            },
            TaskPayload::Response(p) => (
                Some(p.file_path.clone()),
                Some(p.file_type.as_u8()),
                Some(p.project_id.clone()),
                Some(p.row_index),
            ),
        }
    }

    /// The row mirrored to the shared `write_tasks_log` table.
    pub fn to_log_row(&self) -> WriteLogRow {
        let (file_path, file_type, project_id, row_index) = self.primary_target();
        WriteLogRow {
            task_id: self.id.clone(),
            task_type: self.payload.task_type().to_string(),
            submitted_by: self.submitted_by.clone(),
            submitted_at: self.submitted_at.clone(),
            description: Some(self.description.clone()),
            status: self.status.as_str().to_string(),
            started_at: self.started_at.clone(),
            completed_at: self.completed_at.clone(),
            error: self.error.clone(),
            file_path,
            file_type,
            project_id,
            row_index,
            payload: serde_json::to_string(&self.payload).ok(),
        }
    }
}
