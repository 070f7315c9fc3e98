//! Database migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies pending
//! ones in order. Schema creation is idempotent and safe to re-enter: the
//! manager runs this at every connection open, possibly racing with other
//! users of the shared file.

use rusqlite::Connection;

use super::error::DbError;

/// A single migration definition.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    /// Whether this migration needs conditional handling
    /// (e.g. ADD COLUMN that may already exist).
    kind: MigrationKind,
}

enum MigrationKind {
    /// Execute the SQL directly.
    Standard,
    /// ALTER TABLE ADD COLUMN, skipped if the column already exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_tasks_table",
        sql: include_str!("sql/001_create_tasks.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "create_events_table",
        sql: include_str!("sql/002_create_events.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 3,
        description: "create_write_tasks_log_table",
        sql: include_str!("sql/003_create_write_log.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 4,
        description: "add_business_id_to_tasks",
        sql: include_str!("sql/004_add_business_id.sql"),
        kind: MigrationKind::AddColumn {
            table: "tasks",
            column: "business_id",
        },
    },
    Migration {
        version: 5,
        description: "index_business_id",
        sql: include_str!("sql/005_index_business_id.sql"),
        kind: MigrationKind::Standard,
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        let should_run = match &migration.kind {
            MigrationKind::Standard => true,
            MigrationKind::AddColumn { table, column } => !column_exists(conn, table, column)?,
        };

        if should_run {
            conn.execute_batch(migration.sql)
                .map_err(|e| DbError::Migration {
                    version: migration.version,
                    reason: e.to_string(),
                })?;
        } else {
            log::info!(
                "Skipping migration v{} (condition not met)",
                migration.version
            );
        }

        // Another process may have recorded this version between our check
        // and now; INSERT OR IGNORE keeps re-entry safe.
        conn.execute(
            "INSERT OR IGNORE INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
    }

    Ok(())
}

/// Backfills `business_id` for legacy rows written before migration v4.
/// Safe to re-enter: only touches rows where the column is still empty.
pub fn backfill_business_ids(conn: &Connection) -> Result<(), DbError> {
    let updated = conn.execute(
        "UPDATE tasks
         SET business_id = file_type || '|' || project_id || '|' || interface_id
         WHERE business_id IS NULL OR business_id = ''",
        [],
    )?;
    if updated > 0 {
        log::info!("Backfilled business_id on {} legacy task rows", updated);
    }
    Ok(())
}

/// Checks whether a column exists on a table using `PRAGMA table_info`.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DbError> {
    // Only alphanumeric and underscore identifiers are interpolated.
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DbError::Migration {
            version: 0,
            reason: format!("Invalid table name: {}", table),
        });
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .any(|r| r.map(|name| name == column).unwrap_or(false));
    Ok(exists)
}
