//! Registry database: connection manager, schema, repositories.
//!
//! Uses rusqlite (SQLite) with a thread-safe `Database` handle. The shared
//! file lives on a network drive, so the manager forces `journal_mode=DELETE`
//! there (WAL does not survive many SMB servers), keeps a generous busy
//! timeout, and drops the cached connection at every hook boundary so no
//! process holds the file longer than needed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use rusqlite::Connection;

pub mod error;
pub mod event_repo;
pub mod migrations;
pub mod read_cache;
pub mod task_repo;
pub mod write_log_repo;

pub use error::DbError;

/// SQLite busy timeout for the shared file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(15);
/// Maximum busy-retry attempts for a write.
const MAX_WRITE_RETRIES: u32 = 5;
/// Base delay for the exponential backoff between retries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
/// Cap for a single backoff sleep.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(15);

/// Thread-safe database handle wrapping a single rusqlite connection.
///
/// Cloning is cheap (inner `Arc`). All access is serialized through a
/// `Mutex`, which is fine for SQLite (which serializes writes anyway).
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Opens (or creates) the database at the given path, applies the
    /// network-drive pragmas and runs all pending migrations.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DbError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        apply_pragmas(&conn, path)?;
        migrations::run_all(&conn)?;
        migrations::backfill_business_ids(&conn)?;

        log::info!("Registry database opened at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Opens an in-memory database for testing. Runs all migrations.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        migrations::run_all(&conn)?;
        migrations::backfill_business_ids(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Opens a read-only connection against `path` (`query_only=ON`).
    /// Fails if the file does not exist rather than creating an empty DB.
    pub fn open_read_only(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "query_only", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Provides locked access to the underlying connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        let conn = self.conn.lock().map_err(|_| DbError::LockPoisoned)?;
        f(&conn)
    }

    /// Runs `f` inside a single transaction. Used by the write queue to
    /// commit a whole batch at once.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        let conn = self.conn.lock().map_err(|_| DbError::LockPoisoned)?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Path this handle was opened against (`None` for in-memory DBs).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn apply_pragmas(conn: &Connection, path: &Path) -> Result<(), DbError> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    if is_network_path(path) {
        // WAL needs shared memory; SMB servers routinely break it.
        conn.pragma_update(None, "journal_mode", "DELETE")?;
    } else {
        conn.pragma_update(None, "journal_mode", "WAL")?;
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Heuristic for "this file lives on a network share".
pub fn is_network_path(path: &Path) -> bool {
    let s = path.to_string_lossy();
    s.starts_with(r"\\")
        || s.starts_with("//")
        || s.starts_with("/mnt/")
        || s.starts_with("/net/")
        || s.starts_with("/Volumes/")
}

static CACHED: Mutex<Option<Database>> = Mutex::new(None);
static MAINTENANCE: AtomicBool = AtomicBool::new(false);

/// Hands out the process-wide cached write connection. Reopens when the
/// path differs from the cached one. Refuses to open during maintenance.
pub fn get_connection(db_path: &Path) -> Result<Database, DbError> {
    if in_maintenance() {
        return Err(DbError::Maintenance);
    }
    let mut guard = CACHED.lock().map_err(|_| DbError::LockPoisoned)?;
    if let Some(db) = guard.as_ref() {
        if db.path() == Some(db_path) {
            return Ok(db.clone());
        }
        log::info!(
            "Registry path changed to {}, reopening connection",
            db_path.display()
        );
    }
    let db = Database::open(db_path)?;
    *guard = Some(db.clone());
    Ok(db)
}

/// Drops the cached connection so the OS releases its lock on the shared
/// file. Called at every hook boundary.
pub fn close_connection_after_use() {
    if let Ok(mut guard) = CACHED.lock() {
        *guard = None;
    }
}

/// Opens a short-lived connection that leaves the cached one untouched.
/// Used by maintenance tooling and tests.
pub fn open_isolated_connection(db_path: &Path) -> Result<Database, DbError> {
    Database::open(db_path)
}

/// Enters maintenance mode: every subsequent write is refused with
/// `DbError::Maintenance` until the fence clears.
pub fn enter_maintenance() {
    MAINTENANCE.store(true, Ordering::SeqCst);
    close_connection_after_use();
    log::warn!("Registry entered maintenance mode; writes are fenced");
}

/// Clears the maintenance fence.
pub fn exit_maintenance() {
    MAINTENANCE.store(false, Ordering::SeqCst);
    log::info!("Registry left maintenance mode");
}

pub fn in_maintenance() -> bool {
    MAINTENANCE.load(Ordering::SeqCst)
}

/// Runs a write closure with busy-retry: exponential backoff with jitter,
/// at most [`MAX_WRITE_RETRIES`] attempts. The cached connection is dropped
/// between attempts so the OS lock is released while we wait.
pub fn with_write_retry<T, F>(mut f: F) -> Result<T, DbError>
where
    F: FnMut() -> Result<T, DbError>,
{
    let mut attempt = 0u32;
    loop {
        if in_maintenance() {
            return Err(DbError::Maintenance);
        }
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_busy() => {
                attempt += 1;
                if attempt >= MAX_WRITE_RETRIES {
                    log::error!("Write still locked after {} attempts", attempt);
                    return Err(DbError::Busy { attempts: attempt });
                }
                close_connection_after_use();
                let delay = backoff_delay(attempt);
                log::warn!(
                    "Database locked (attempt {}), retrying in {:?}",
                    attempt,
                    delay
                );
                std::thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_DELAY.saturating_mul(1u32 << attempt.min(6));
    let capped = exp.min(RETRY_MAX_DELAY);
    let jitter = rand::rng().random_range(0..=capped.as_millis() as u64 / 4);
    capped + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_open_in_memory_runs_migrations() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let count: u32 =
                conn.query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))?;
            assert!(count > 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_open_file_db() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let db = Database::open(&path).unwrap();
        db.with_conn(|conn| {
            let count: u32 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0))?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_is_network_path() {
        assert!(is_network_path(Path::new(r"\\share\dept\registry.db")));
        assert!(is_network_path(Path::new("/mnt/dept/registry.db")));
        assert!(!is_network_path(Path::new("/home/user/registry.db")));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<(), DbError> = db.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO events (kind, ts) VALUES ('assigned', '2025-08-01T00:00:00Z')",
                [],
            )?;
            Err(DbError::TaskNotFound("boom".into()))
        });
        assert!(result.is_err());
        db.with_conn(|conn| {
            let count: u32 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    #[serial]
    fn test_cached_connection_reopens_on_path_change() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");

        let first = get_connection(&a).unwrap();
        assert_eq!(first.path(), Some(a.as_path()));
        let again = get_connection(&a).unwrap();
        assert_eq!(again.path(), Some(a.as_path()));

        let second = get_connection(&b).unwrap();
        assert_eq!(second.path(), Some(b.as_path()));
        close_connection_after_use();
    }

    #[test]
    #[serial]
    fn test_maintenance_fences_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.db");
        enter_maintenance();
        assert!(matches!(get_connection(&path), Err(DbError::Maintenance)));
        let retried: Result<(), DbError> = with_write_retry(|| Ok(()));
        assert!(matches!(retried, Err(DbError::Maintenance)));
        exit_maintenance();
        assert!(get_connection(&path).is_ok());
        close_connection_after_use();
    }

    #[test]
    #[serial]
    fn test_write_retry_gives_up_on_persistent_busy() {
        exit_maintenance();
        let mut calls = 0;
        let result: Result<(), DbError> = with_write_retry(|| {
            calls += 1;
            let inner = rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY);
            Err(DbError::Sqlite(rusqlite::Error::SqliteFailure(
                inner,
                Some("database is locked".to_string()),
            )))
        });
        assert!(matches!(result, Err(DbError::Busy { attempts: 5 })));
        assert_eq!(calls, 5);
    }

    #[test]
    #[serial]
    fn test_write_retry_passes_through_non_busy_errors() {
        exit_maintenance();
        let mut calls = 0;
        let result: Result<(), DbError> = with_write_retry(|| {
            calls += 1;
            Err(DbError::TaskNotFound("x".into()))
        });
        assert!(matches!(result, Err(DbError::TaskNotFound(_))));
        assert_eq!(calls, 1);
    }
}
