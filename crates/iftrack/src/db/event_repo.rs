//! Event repository: append-only audit log.
//!
//! Events are never mutated; they are the ground truth for forensic
//! queries across users and scans.

use rusqlite::{params, Connection, Row};
use serde_json::Value;

use super::DbError;
use crate::keys::TaskKey;

/// Audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ProcessDone,
    ExportDone,
    Assigned,
    ResponseWritten,
    Confirmed,
    Unconfirmed,
    Ignored,
    IgnoreCleared,
    ScanFinalized,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ProcessDone => "process_done",
            EventKind::ExportDone => "export_done",
            EventKind::Assigned => "assigned",
            EventKind::ResponseWritten => "response_written",
            EventKind::Confirmed => "confirmed",
            EventKind::Unconfirmed => "unconfirmed",
            EventKind::Ignored => "ignored",
            EventKind::IgnoreCleared => "ignore_cleared",
            EventKind::ScanFinalized => "scan_finalized",
        }
    }
}

/// A recorded audit event.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: i64,
    pub kind: String,
    pub ts: String,
    pub task_id: Option<String>,
    pub business_id: Option<String>,
    pub file_type: Option<u8>,
    pub project_id: Option<String>,
    pub interface_id: Option<String>,
    pub actor: Option<String>,
    pub extra: Option<String>,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            kind: row.get("kind")?,
            ts: row.get("ts")?,
            task_id: row.get("task_id")?,
            business_id: row.get("business_id")?,
            file_type: row.get::<_, Option<i64>>("file_type")?.map(|v| v as u8),
            project_id: row.get("project_id")?,
            interface_id: row.get("interface_id")?,
            actor: row.get("actor")?,
            extra: row.get("extra")?,
        })
    }
}

/// Appends an event tied to a task key.
pub fn append(
    conn: &Connection,
    kind: EventKind,
    ts: &str,
    key: &TaskKey,
    actor: Option<&str>,
    extra: Option<&Value>,
) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO events (kind, ts, task_id, business_id, file_type, project_id,
                             interface_id, actor, extra)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            kind.as_str(),
            ts,
            key.task_id(),
            key.business_id(),
            key.file_type.as_u8(),
            key.project_id,
            key.interface_id,
            actor,
            extra.map(|v| v.to_string()),
        ],
    )?;
    Ok(())
}

/// Appends an event not tied to any single task (e.g. `scan_finalized`).
pub fn append_global(
    conn: &Connection,
    kind: EventKind,
    ts: &str,
    actor: Option<&str>,
    extra: Option<&Value>,
) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO events (kind, ts, actor, extra) VALUES (?1, ?2, ?3, ?4)",
        params![kind.as_str(), ts, actor, extra.map(|v| v.to_string())],
    )?;
    Ok(())
}

/// All events for one task, oldest first.
pub fn list_for_task(conn: &Connection, task_id: &str) -> Result<Vec<EventRow>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM events WHERE task_id = ?1 ORDER BY ts ASC, id ASC",
    )?;
    let rows = stmt
        .query_map(params![task_id], EventRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Events at or after `since`, oldest first, capped at `limit`.
pub fn list_since(conn: &Connection, since: &str, limit: u64) -> Result<Vec<EventRow>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM events WHERE ts >= ?1 ORDER BY ts ASC, id ASC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![since, limit as i64], EventRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
