//! Local read cache for the shared registry DB.
//!
//! Dozens of users hammer the same SQLite file over SMB; reads are served
//! from a per-user local snapshot instead. The snapshot is refreshed when
//! the shared file's mtime moves past the local copy's (with slack for the
//! 1–2 s mtime granularity of network filesystems), at most once per sync
//! interval, and at most one copy is in flight at a time.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use super::{Database, DbError};

/// Minimum time between staleness checks that trigger a re-copy.
const SYNC_INTERVAL: Duration = Duration::from_secs(300);
/// SMB servers report mtimes at 1–2 s granularity.
const MTIME_SLACK: Duration = Duration::from_secs(2);

struct Inner {
    db: Option<Database>,
    last_check: Option<Instant>,
}

pub struct ReadCache {
    cache_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl ReadCache {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            inner: Mutex::new(Inner {
                db: None,
                last_check: None,
            }),
        }
    }

    fn local_path(&self) -> PathBuf {
        self.cache_dir.join("registry.db")
    }

    /// Returns a read-only connection, preferring the local snapshot.
    ///
    /// Copy failure serves the last good snapshot; no snapshot at all falls
    /// back to a read-only connection straight to the shared file.
    pub fn read(&self, shared_path: &Path) -> Result<Database, DbError> {
        let mut inner = self.inner.lock().map_err(|_| DbError::LockPoisoned)?;

        let due = match inner.last_check {
            Some(at) => at.elapsed() >= SYNC_INTERVAL,
            None => true,
        };

        if due || inner.db.is_none() {
            inner.last_check = Some(Instant::now());
            match self.refresh_if_stale(shared_path) {
                Ok(copied) => {
                    if self.local_path().is_file() && (copied || inner.db.is_none()) {
                        // Reopen so a replaced file is actually picked up.
                        inner.db = Some(Database::open_read_only(&self.local_path())?);
                    }
                }
                Err(e) => {
                    log::warn!("Read-cache refresh failed, serving stale copy: {}", e);
                }
            }
        }

        if let Some(db) = inner.db.as_ref() {
            return Ok(db.clone());
        }

        log::warn!(
            "No local cache available, reading shared file {}",
            shared_path.display()
        );
        Database::open_read_only(shared_path)
    }

    /// Copies the shared file over the local snapshot when it is newer.
    /// Returns whether a copy happened.
    fn refresh_if_stale(&self, shared_path: &Path) -> Result<bool, DbError> {
        let local = self.local_path();
        if local.is_file() {
            let shared_mtime = mtime(shared_path)?;
            let local_mtime = mtime(&local)?;
            if shared_mtime <= local_mtime + MTIME_SLACK {
                return Ok(false);
            }
        }
        self.copy_snapshot(shared_path)?;
        Ok(true)
    }

    fn copy_snapshot(&self, shared_path: &Path) -> Result<(), DbError> {
        std::fs::create_dir_all(&self.cache_dir).map_err(|e| DbError::Io {
            path: self.cache_dir.clone(),
            source: e,
        })?;
        let tmp = self.cache_dir.join("registry.db.tmp");
        std::fs::copy(shared_path, &tmp).map_err(|e| DbError::Io {
            path: shared_path.to_path_buf(),
            source: e,
        })?;
        std::fs::rename(&tmp, self.local_path()).map_err(|e| DbError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        log::debug!("Read cache refreshed from {}", shared_path.display());
        Ok(())
    }

    /// Drops the cached read connection and forces a re-copy on next read.
    /// Called after every successful registry write.
    pub fn invalidate(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.db = None;
            inner.last_check = None;
        }
        // Remove the snapshot so the next read must copy from the share.
        let local = self.local_path();
        if local.is_file() {
            let _ = std::fs::remove_file(&local);
        }
    }
}

fn mtime(path: &Path) -> Result<SystemTime, DbError> {
    let meta = std::fs::metadata(path).map_err(|e| DbError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    meta.modified().map_err(|e| DbError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

static GLOBAL: OnceLock<ReadCache> = OnceLock::new();

/// The process-wide read cache, rooted under the platform-local data dir.
pub fn global() -> &'static ReadCache {
    GLOBAL.get_or_init(|| {
        let dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("iftrack")
            .join("read_cache");
        ReadCache::new(dir)
    })
}

/// Read-only connection to `db_path` through the global cache.
pub fn get_read_connection(db_path: &Path) -> Result<Database, DbError> {
    global().read(db_path)
}

/// Invalidates the global cache.
pub fn invalidate() {
    global().invalidate();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::task_repo::{self, TaskRow};
    use crate::keys::{FileType, TaskKey};

    fn seed_shared(dir: &Path) -> (PathBuf, TaskKey) {
        let shared = dir.join("shared.db");
        let db = Database::open(&shared).unwrap();
        let key = TaskKey::new(FileType::T1, "1818", "S-YA-01", "list.xlsx", 6);
        db.with_conn(|conn| {
            task_repo::insert(conn, &TaskRow::new(&key, "2025-08-01T00:00:00Z"))
        })
        .unwrap();
        (shared, key)
    }

    #[test]
    fn test_read_serves_local_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, key) = seed_shared(dir.path());
        let cache = ReadCache::new(dir.path().join("cache"));

        let reader = cache.read(&shared).unwrap();
        let found = reader
            .with_conn(|conn| task_repo::find_by_id(conn, &key.task_id()))
            .unwrap();
        assert!(found.is_some());
        assert!(dir.path().join("cache").join("registry.db").is_file());
    }

    #[test]
    fn test_read_connection_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _) = seed_shared(dir.path());
        let cache = ReadCache::new(dir.path().join("cache"));

        let reader = cache.read(&shared).unwrap();
        let result = reader.with_conn(|conn| {
            conn.execute("DELETE FROM tasks", [])?;
            Ok(())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_invalidate_picks_up_new_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _) = seed_shared(dir.path());
        let cache = ReadCache::new(dir.path().join("cache"));

        let reader = cache.read(&shared).unwrap();
        let before: u32 = reader
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(before, 1);

        // Write another row to the shared file, then invalidate.
        let writer = Database::open(&shared).unwrap();
        let key2 = TaskKey::new(FileType::T1, "1818", "S-YA-02", "list.xlsx", 7);
        writer
            .with_conn(|conn| {
                task_repo::insert(conn, &TaskRow::new(&key2, "2025-08-01T01:00:00Z"))
            })
            .unwrap();
        drop(writer);

        cache.invalidate();
        let reader = cache.read(&shared).unwrap();
        let after: u32 = reader
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(after, 2);
    }

    #[test]
    fn test_missing_shared_file_falls_back_to_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ReadCache::new(dir.path().join("cache"));
        let result = cache.read(&dir.path().join("nope.db"));
        assert!(result.is_err());
    }
}
