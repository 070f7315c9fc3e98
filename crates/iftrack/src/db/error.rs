//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from registry database operations.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or copying the DB file.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// Maintenance mode is active; all writes are fenced off.
    #[error("Registry is in maintenance mode; writes are refused")]
    Maintenance,

    /// The shared file stayed locked through every retry attempt.
    #[error("Database stayed locked after {attempts} attempts")]
    Busy { attempts: u32 },

    /// Precondition on task state failed (e.g. confirming a non-completed task).
    #[error("Invalid task state for '{task_id}': {reason}")]
    InvalidState { task_id: String, reason: String },

    /// Task row not found.
    #[error("Task '{0}' not found")]
    TaskNotFound(String),
}

impl DbError {
    /// True when the underlying SQLite error is a transient lock/busy
    /// condition worth retrying.
    pub fn is_busy(&self) -> bool {
        match self {
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, msg)) => {
                matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) || msg
                    .as_deref()
                    .is_some_and(|m| m.contains("locked") || m.contains("busy"))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_busy_on_locked_failure() {
        let inner = rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY);
        let err = DbError::Sqlite(rusqlite::Error::SqliteFailure(
            inner,
            Some("database is locked".to_string()),
        ));
        assert!(err.is_busy());
    }

    #[test]
    fn test_is_busy_false_for_other_errors() {
        assert!(!DbError::Maintenance.is_busy());
        assert!(!DbError::TaskNotFound("x".into()).is_busy());
    }
}
