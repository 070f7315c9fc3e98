//! Task repository: row type and SQL primitives for the `tasks` table.
//!
//! Functions here take a `&Connection` so the service layer can compose
//! several of them inside one write-queue transaction. Business rules
//! (field preservation, state machines) live in `registry::service`.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DbError;
use crate::keys::TaskKey;

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Open,
    Completed,
    Confirmed,
    Archived,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Completed => "completed",
            TaskStatus::Confirmed => "confirmed",
            TaskStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> TaskStatus {
        match s {
            "completed" => TaskStatus::Completed,
            "confirmed" => TaskStatus::Confirmed,
            "archived" => TaskStatus::Archived,
            "open" => TaskStatus::Open,
            other => {
                log::warn!("Unknown task status '{}', treating as open", other);
                TaskStatus::Open
            }
        }
    }
}

/// A raw task row from the database.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub task_id: String,
    pub business_id: String,
    pub file_type: u8,
    pub project_id: String,
    pub interface_id: String,
    pub source_file: String,
    pub row_index: u32,
    pub status: String,
    pub display_status: Option<String>,
    pub assigned_by: Option<String>,
    pub assigned_to: Option<String>,
    pub assigned_at: Option<String>,
    pub response_number: Option<String>,
    pub completed_by: Option<String>,
    pub completed_at: Option<String>,
    pub confirmed_by: Option<String>,
    pub confirmed_at: Option<String>,
    pub ignored: bool,
    pub ignored_by: Option<String>,
    pub ignored_reason: Option<String>,
    pub interface_time_when_ignored: Option<String>,
    pub interface_time: Option<String>,
    pub role: Option<String>,
    pub first_seen_at: String,
    pub last_seen_at: String,
    pub last_batch_tag: Option<String>,
}

impl TaskRow {
    /// A fresh `open` row for a key first observed at `now`.
    pub fn new(key: &TaskKey, now: &str) -> Self {
        Self {
            task_id: key.task_id(),
            business_id: key.business_id(),
            file_type: key.file_type.as_u8(),
            project_id: key.project_id.clone(),
            interface_id: key.interface_id.clone(),
            source_file: key.source_file.clone(),
            row_index: key.row_index,
            status: TaskStatus::Open.as_str().to_string(),
            display_status: None,
            assigned_by: None,
            assigned_to: None,
            assigned_at: None,
            response_number: None,
            completed_by: None,
            completed_at: None,
            confirmed_by: None,
            confirmed_at: None,
            ignored: false,
            ignored_by: None,
            ignored_reason: None,
            interface_time_when_ignored: None,
            interface_time: None,
            role: None,
            first_seen_at: now.to_string(),
            last_seen_at: now.to_string(),
            last_batch_tag: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::parse(&self.status)
    }

    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            task_id: row.get("task_id")?,
            business_id: row.get::<_, Option<String>>("business_id")?.unwrap_or_default(),
            file_type: row.get::<_, i64>("file_type")? as u8,
            project_id: row.get("project_id")?,
            interface_id: row.get("interface_id")?,
            source_file: row.get("source_file")?,
            row_index: row.get::<_, i64>("row_index")? as u32,
            status: row.get("status")?,
            display_status: row.get("display_status")?,
            assigned_by: row.get("assigned_by")?,
            assigned_to: row.get("assigned_to")?,
            assigned_at: row.get("assigned_at")?,
            response_number: row.get("response_number")?,
            completed_by: row.get("completed_by")?,
            completed_at: row.get("completed_at")?,
            confirmed_by: row.get("confirmed_by")?,
            confirmed_at: row.get("confirmed_at")?,
            ignored: row.get::<_, i64>("ignored")? != 0,
            ignored_by: row.get("ignored_by")?,
            ignored_reason: row.get("ignored_reason")?,
            interface_time_when_ignored: row.get("interface_time_when_ignored")?,
            interface_time: row.get("interface_time")?,
            role: row.get("role")?,
            first_seen_at: row.get("first_seen_at")?,
            last_seen_at: row.get("last_seen_at")?,
            last_batch_tag: row.get("last_batch_tag")?,
        })
    }
}

/// Finds a task by its point identity.
pub fn find_by_id(conn: &Connection, task_id: &str) -> Result<Option<TaskRow>, DbError> {
    let row = conn
        .query_row(
            "SELECT * FROM tasks WHERE task_id = ?1",
            params![task_id],
            TaskRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Finds the most recently seen non-archived row with the given business id.
/// Used to propagate lifecycle state when a worksheet row moves.
pub fn find_live_by_business_id(
    conn: &Connection,
    business_id: &str,
) -> Result<Option<TaskRow>, DbError> {
    let row = conn
        .query_row(
            "SELECT * FROM tasks
             WHERE business_id = ?1 AND status != 'archived'
             ORDER BY last_seen_at DESC LIMIT 1",
            params![business_id],
            TaskRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Inserts a new task row.
pub fn insert(conn: &Connection, task: &TaskRow) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO tasks (task_id, business_id, file_type, project_id, interface_id,
            source_file, row_index, status, display_status, assigned_by, assigned_to,
            assigned_at, response_number, completed_by, completed_at, confirmed_by,
            confirmed_at, ignored, ignored_by, ignored_reason, interface_time_when_ignored,
            interface_time, role, first_seen_at, last_seen_at, last_batch_tag)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                 ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)",
        params![
            task.task_id,
            task.business_id,
            task.file_type,
            task.project_id,
            task.interface_id,
            task.source_file,
            task.row_index,
            task.status,
            task.display_status,
            task.assigned_by,
            task.assigned_to,
            task.assigned_at,
            task.response_number,
            task.completed_by,
            task.completed_at,
            task.confirmed_by,
            task.confirmed_at,
            task.ignored as i64,
            task.ignored_by,
            task.ignored_reason,
            task.interface_time_when_ignored,
            task.interface_time,
            task.role,
            task.first_seen_at,
            task.last_seen_at,
            task.last_batch_tag,
        ],
    )?;
    Ok(())
}

/// Overwrites an existing task row. All fields except `task_id` and
/// `first_seen_at` are written.
pub fn update(conn: &Connection, task: &TaskRow) -> Result<(), DbError> {
    let changed = conn.execute(
        "UPDATE tasks SET business_id=?2, file_type=?3, project_id=?4, interface_id=?5,
            source_file=?6, row_index=?7, status=?8, display_status=?9, assigned_by=?10,
            assigned_to=?11, assigned_at=?12, response_number=?13, completed_by=?14,
            completed_at=?15, confirmed_by=?16, confirmed_at=?17, ignored=?18,
            ignored_by=?19, ignored_reason=?20, interface_time_when_ignored=?21,
            interface_time=?22, role=?23, last_seen_at=?24, last_batch_tag=?25
         WHERE task_id=?1",
        params![
            task.task_id,
            task.business_id,
            task.file_type,
            task.project_id,
            task.interface_id,
            task.source_file,
            task.row_index,
            task.status,
            task.display_status,
            task.assigned_by,
            task.assigned_to,
            task.assigned_at,
            task.response_number,
            task.completed_by,
            task.completed_at,
            task.confirmed_by,
            task.confirmed_at,
            task.ignored as i64,
            task.ignored_by,
            task.ignored_reason,
            task.interface_time_when_ignored,
            task.interface_time,
            task.role,
            task.last_seen_at,
            task.last_batch_tag,
        ],
    )?;
    if changed == 0 {
        return Err(DbError::TaskNotFound(task.task_id.clone()));
    }
    Ok(())
}

/// Archives completed/confirmed rows that were not stamped with
/// `current_batch_tag` and whose `last_seen_at` is older than `cutoff`.
/// Open rows are deliberately left alone. Returns the number archived.
pub fn archive_missing(
    conn: &Connection,
    current_batch_tag: &str,
    cutoff: &str,
) -> Result<usize, DbError> {
    let archived = conn.execute(
        "UPDATE tasks SET status = 'archived'
         WHERE status IN ('completed', 'confirmed')
           AND (last_batch_tag IS NULL OR last_batch_tag != ?1)
           AND last_seen_at < ?2",
        params![current_batch_tag, cutoff],
    )?;
    Ok(archived)
}

/// Fetches the rows for a set of task ids, in one statement per chunk.
pub fn find_many(conn: &Connection, task_ids: &[String]) -> Result<Vec<TaskRow>, DbError> {
    let mut rows = Vec::with_capacity(task_ids.len());
    // SQLite's default parameter limit is 999; chunk well under it.
    for chunk in task_ids.chunks(500) {
        let placeholders = (1..=chunk.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT * FROM tasks WHERE task_id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            chunk.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();
        let found = stmt
            .query_map(params_ref.as_slice(), TaskRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.extend(found);
    }
    Ok(rows)
}

/// Counts rows by status.
pub fn count_by_status(conn: &Connection, status: &str) -> Result<u64, DbError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE status = ?1",
        params![status],
        |r| r.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::keys::FileType;

    fn test_conn() -> Database {
        Database::open_in_memory().expect("open in-memory DB")
    }

    fn sample_key() -> TaskKey {
        TaskKey::new(FileType::T1, "1818", "S-YA-01", "list.xlsx", 6)
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_conn();
        let key = sample_key();
        let row = TaskRow::new(&key, "2025-08-01T10:00:00Z");
        db.with_conn(|conn| insert(conn, &row)).unwrap();

        let found = db
            .with_conn(|conn| find_by_id(conn, &key.task_id()))
            .unwrap()
            .unwrap();
        assert_eq!(found.project_id, "1818");
        assert_eq!(found.status(), TaskStatus::Open);
        assert_eq!(found.business_id, "1|1818|S-YA-01");
        assert!(!found.ignored);
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_conn();
        let found = db.with_conn(|conn| find_by_id(conn, "missing")).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_update_overwrites() {
        let db = test_conn();
        let key = sample_key();
        let mut row = TaskRow::new(&key, "2025-08-01T10:00:00Z");
        db.with_conn(|conn| insert(conn, &row)).unwrap();

        row.status = TaskStatus::Completed.as_str().to_string();
        row.response_number = Some("HFMR001".to_string());
        row.completed_at = Some("2025-08-02T09:00:00Z".to_string());
        db.with_conn(|conn| update(conn, &row)).unwrap();

        let found = db
            .with_conn(|conn| find_by_id(conn, &key.task_id()))
            .unwrap()
            .unwrap();
        assert_eq!(found.status(), TaskStatus::Completed);
        assert_eq!(found.response_number.as_deref(), Some("HFMR001"));
    }

    #[test]
    fn test_update_missing_row_errors() {
        let db = test_conn();
        let row = TaskRow::new(&sample_key(), "2025-08-01T10:00:00Z");
        let result = db.with_conn(|conn| update(conn, &row));
        assert!(matches!(result, Err(DbError::TaskNotFound(_))));
    }

    #[test]
    fn test_find_live_by_business_id_skips_archived() {
        let db = test_conn();
        let key_old = TaskKey::new(FileType::T1, "1818", "S-YA-01", "old.xlsx", 6);
        let key_new = TaskKey::new(FileType::T1, "1818", "S-YA-01", "new.xlsx", 9);

        let mut old_row = TaskRow::new(&key_old, "2025-07-01T00:00:00Z");
        old_row.status = TaskStatus::Archived.as_str().to_string();
        let new_row = TaskRow::new(&key_new, "2025-08-01T00:00:00Z");

        db.with_conn(|conn| {
            insert(conn, &old_row)?;
            insert(conn, &new_row)
        })
        .unwrap();

        let live = db
            .with_conn(|conn| find_live_by_business_id(conn, &key_old.business_id()))
            .unwrap()
            .unwrap();
        assert_eq!(live.task_id, key_new.task_id());
    }

    #[test]
    fn test_archive_missing_spares_open_and_current() {
        let db = test_conn();
        let mk = |file: &str, row_index: u32| {
            TaskKey::new(FileType::T2, "1907", format!("IF-{row_index}"), file, row_index)
        };

        // Stale completed row: archived.
        let mut stale = TaskRow::new(&mk("a.xlsx", 2), "2025-07-01T00:00:00Z");
        stale.status = "completed".to_string();
        stale.last_batch_tag = Some("batch-old".to_string());
        // Stale but still open: spared.
        let mut open = TaskRow::new(&mk("a.xlsx", 3), "2025-07-01T00:00:00Z");
        open.last_batch_tag = Some("batch-old".to_string());
        // Completed and present in current batch: spared.
        let mut current = TaskRow::new(&mk("a.xlsx", 4), "2025-07-01T00:00:00Z");
        current.status = "completed".to_string();
        current.last_batch_tag = Some("batch-new".to_string());

        db.with_conn(|conn| {
            insert(conn, &stale)?;
            insert(conn, &open)?;
            insert(conn, &current)
        })
        .unwrap();

        let archived = db
            .with_conn(|conn| archive_missing(conn, "batch-new", "2025-08-01T00:00:00Z"))
            .unwrap();
        assert_eq!(archived, 1);

        let stale_after = db
            .with_conn(|conn| find_by_id(conn, &stale.task_id))
            .unwrap()
            .unwrap();
        assert_eq!(stale_after.status(), TaskStatus::Archived);
        let open_after = db
            .with_conn(|conn| find_by_id(conn, &open.task_id))
            .unwrap()
            .unwrap();
        assert_eq!(open_after.status(), TaskStatus::Open);
    }

    #[test]
    fn test_find_many() {
        let db = test_conn();
        let keys: Vec<TaskKey> = (2..5)
            .map(|i| TaskKey::new(FileType::T5, "2001", format!("IF-{i}"), "x.xlsx", i))
            .collect();
        db.with_conn(|conn| {
            for key in &keys {
                insert(conn, &TaskRow::new(key, "2025-08-01T00:00:00Z"))?;
            }
            Ok(())
        })
        .unwrap();

        let ids: Vec<String> = keys.iter().map(|k| k.task_id()).collect();
        let rows = db.with_conn(|conn| find_many(conn, &ids)).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_count_by_status() {
        let db = test_conn();
        db.with_conn(|conn| {
            insert(
                conn,
                &TaskRow::new(
                    &TaskKey::new(FileType::T4, "1500", "A", "x.xlsx", 2),
                    "2025-08-01T00:00:00Z",
                ),
            )
        })
        .unwrap();
        assert_eq!(db.with_conn(|c| count_by_status(c, "open")).unwrap(), 1);
        assert_eq!(db.with_conn(|c| count_by_status(c, "confirmed")).unwrap(), 0);
    }
}
