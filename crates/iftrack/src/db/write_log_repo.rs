//! Shared write log: cross-user visibility of submitted write tasks.
//!
//! Every local `WriteTask` state change is mirrored here so other users on
//! the share can see pending activity. `task_id` is the submitter-side
//! UUID, not the registry task id.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DbError;

/// A mirrored write-task row.
#[derive(Debug, Clone)]
pub struct WriteLogRow {
    pub task_id: String,
    pub task_type: String,
    pub submitted_by: String,
    pub submitted_at: String,
    pub description: Option<String>,
    pub status: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
    pub file_path: Option<String>,
    pub file_type: Option<u8>,
    pub project_id: Option<String>,
    pub row_index: Option<u32>,
    pub payload: Option<String>,
}

impl WriteLogRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            task_id: row.get("task_id")?,
            task_type: row.get("task_type")?,
            submitted_by: row.get("submitted_by")?,
            submitted_at: row.get("submitted_at")?,
            description: row.get("description")?,
            status: row.get("status")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            error: row.get("error")?,
            file_path: row.get("file_path")?,
            file_type: row.get::<_, Option<i64>>("file_type")?.map(|v| v as u8),
            project_id: row.get("project_id")?,
            row_index: row.get::<_, Option<i64>>("row_index")?.map(|v| v as u32),
            payload: row.get("payload")?,
        })
    }
}

/// Inserts or replaces the mirror row for a write task.
pub fn upsert(conn: &Connection, row: &WriteLogRow) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO write_tasks_log (task_id, task_type, submitted_by, submitted_at,
            description, status, started_at, completed_at, error, file_path, file_type,
            project_id, row_index, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(task_id) DO UPDATE SET
            status = excluded.status,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            error = excluded.error,
            description = excluded.description",
        params![
            row.task_id,
            row.task_type,
            row.submitted_by,
            row.submitted_at,
            row.description,
            row.status,
            row.started_at,
            row.completed_at,
            row.error,
            row.file_path,
            row.file_type,
            row.project_id,
            row.row_index,
            row.payload,
        ],
    )?;
    Ok(())
}

/// Finds a mirror row by its submitter-side UUID.
pub fn find_by_id(conn: &Connection, task_id: &str) -> Result<Option<WriteLogRow>, DbError> {
    let row = conn
        .query_row(
            "SELECT * FROM write_tasks_log WHERE task_id = ?1",
            params![task_id],
            WriteLogRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Rows still in flight (`pending`/`running`), oldest first.
pub fn list_active(conn: &Connection) -> Result<Vec<WriteLogRow>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM write_tasks_log
         WHERE status IN ('pending', 'running')
         ORDER BY submitted_at ASC",
    )?;
    let rows = stmt
        .query_map([], WriteLogRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Most recent rows regardless of status, newest first.
pub fn list_recent(conn: &Connection, limit: u64) -> Result<Vec<WriteLogRow>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM write_tasks_log ORDER BY submitted_at DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], WriteLogRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Deletes terminal rows whose submission time is older than `cutoff`.
/// Keeps the shared table from growing without bound.
pub fn prune_older_than(conn: &Connection, cutoff: &str) -> Result<usize, DbError> {
    let pruned = conn.execute(
        "DELETE FROM write_tasks_log
         WHERE status IN ('completed', 'failed') AND submitted_at < ?1",
        params![cutoff],
    )?;
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn sample_row(id: &str, status: &str) -> WriteLogRow {
        WriteLogRow {
            task_id: id.to_string(),
            task_type: "response".to_string(),
            submitted_by: "严鹏南".to_string(),
            submitted_at: "2025-08-01T10:00:00Z".to_string(),
            description: Some("IF-X 回复".to_string()),
            status: status.to_string(),
            started_at: None,
            completed_at: None,
            error: None,
            file_path: Some(r"\\share\dept\list.xlsx".to_string()),
            file_type: Some(2),
            project_id: Some("1907".to_string()),
            row_index: Some(15357),
            payload: Some(r#"{"type":"response"}"#.to_string()),
        }
    }

    #[test]
    fn test_upsert_inserts_then_updates() {
        let db = Database::open_in_memory().unwrap();
        let mut row = sample_row("uuid-1", "pending");
        db.with_conn(|conn| upsert(conn, &row)).unwrap();

        row.status = "completed".to_string();
        row.completed_at = Some("2025-08-01T10:05:00Z".to_string());
        db.with_conn(|conn| upsert(conn, &row)).unwrap();

        let found = db
            .with_conn(|conn| find_by_id(conn, "uuid-1"))
            .unwrap()
            .unwrap();
        assert_eq!(found.status, "completed");
        assert_eq!(found.completed_at.as_deref(), Some("2025-08-01T10:05:00Z"));
        // Immutable submission fields survive the update.
        assert_eq!(found.submitted_by, "严鹏南");
        assert_eq!(found.row_index, Some(15357));
    }

    #[test]
    fn test_list_active() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert(conn, &sample_row("a", "pending"))?;
            upsert(conn, &sample_row("b", "running"))?;
            upsert(conn, &sample_row("c", "completed"))?;
            upsert(conn, &sample_row("d", "failed"))
        })
        .unwrap();

        let active = db.with_conn(list_active).unwrap();
        assert_eq!(active.len(), 2);
    }

    #[test]
    fn test_prune_keeps_in_flight_rows() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert(conn, &sample_row("old-done", "completed"))?;
            upsert(conn, &sample_row("old-pending", "pending"))
        })
        .unwrap();

        let pruned = db
            .with_conn(|conn| prune_older_than(conn, "2025-09-01T00:00:00Z"))
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(db
            .with_conn(|conn| find_by_id(conn, "old-pending"))
            .unwrap()
            .is_some());
    }
}
