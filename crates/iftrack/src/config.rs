//! Process-global configuration: the shared data folder, the resolved
//! registry DB path, and the enable/disable state of the registry.
//!
//! All global mutable state lives behind the `set_*`/`get_*`/`reset_*`
//! functions in this module and is only touched at hook boundaries.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::ConfigError;

static DATA_FOLDER: RwLock<Option<PathBuf>> = RwLock::new(None);
static DISABLED_REASON: RwLock<Option<String>> = RwLock::new(None);
static STATE_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Sets the shared data folder. A missing folder disables the registry
/// (degraded mode: no cross-user visibility) but is not fatal ; the reason
/// is retained for the UI's read-only status field.
pub fn set_data_folder(path: &Path) -> Result<(), ConfigError> {
    if !path.is_dir() {
        let reason = format!("data folder not found: {}", path.display());
        log::warn!("Registry disabled: {}", reason);
        set_locked(&DISABLED_REASON, Some(reason));
        set_locked(&DATA_FOLDER, None);
        return Err(ConfigError::DataFolderMissing(path.to_path_buf()));
    }
    set_locked(&DATA_FOLDER, Some(path.to_path_buf()));
    set_locked(&DISABLED_REASON, None);
    log::info!("Data folder set to {}", path.display());
    Ok(())
}

/// Returns the configured data folder, if any.
pub fn get_data_folder() -> Option<PathBuf> {
    read_locked(&DATA_FOLDER)
}

/// Clears the data folder and the disabled reason.
pub fn reset_data_folder() {
    set_locked(&DATA_FOLDER, None);
    set_locked(&DISABLED_REASON, None);
}

/// True when a data folder is set and the registry has not been disabled.
pub fn registry_enabled() -> bool {
    read_locked(&DATA_FOLDER).is_some() && read_locked(&DISABLED_REASON).is_none()
}

/// Why the registry is disabled, for the UI's status field.
pub fn disabled_reason() -> Option<String> {
    read_locked(&DISABLED_REASON)
}

/// Marks the registry disabled with a human-readable reason.
pub fn disable_registry(reason: impl Into<String>) {
    let reason = reason.into();
    log::warn!("Registry disabled: {}", reason);
    set_locked(&DISABLED_REASON, Some(reason));
}

/// Resolves the shared registry DB path under `data_folder`.
///
/// An existing `registry/` directory is preferred (legacy deployments);
/// otherwise `.registry/` is created. Files are never moved between the
/// two; deployment policy decides when a share migrates.
pub fn resolve_db_path(data_folder: &Path) -> Result<PathBuf, ConfigError> {
    let legacy = data_folder.join("registry");
    if legacy.join("registry.db").is_file() {
        return Ok(legacy.join("registry.db"));
    }
    let hidden = data_folder.join(".registry");
    if !hidden.is_dir() {
        std::fs::create_dir_all(&hidden).map_err(|e| ConfigError::CreateRegistryDir {
            path: hidden.clone(),
            source: e,
        })?;
    }
    Ok(hidden.join("registry.db"))
}

/// Resolves the DB path from the configured data folder.
pub fn resolve_current_db_path() -> Result<PathBuf, ConfigError> {
    let folder = get_data_folder().ok_or(ConfigError::DataFolderUnset)?;
    resolve_db_path(&folder)
}

/// Per-process state directory (`result_cache/`) holding the durable
/// write-task state file. Falls back to the platform-local data dir.
pub fn state_dir() -> PathBuf {
    if let Some(dir) = read_locked(&STATE_DIR_OVERRIDE) {
        return dir;
    }
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("iftrack")
        .join("result_cache")
}

/// Overrides the state directory (used by the desktop shell and by tests).
pub fn set_state_dir(path: &Path) {
    set_locked(&STATE_DIR_OVERRIDE, Some(path.to_path_buf()));
}

/// Clears the state-dir override.
pub fn reset_state_dir() {
    set_locked(&STATE_DIR_OVERRIDE, None);
}

/// Creates the state dir and probes it for writability. Callers that get an
/// error run memory-only (no durable queue) and warn once.
pub fn ensure_state_dir() -> Result<PathBuf, ConfigError> {
    let dir = state_dir();
    let probe = || -> std::io::Result<()> {
        std::fs::create_dir_all(&dir)?;
        let marker = dir.join(".write_probe");
        std::fs::write(&marker, b"ok")?;
        std::fs::remove_file(&marker)?;
        Ok(())
    };
    probe().map_err(|e| ConfigError::StateDirUnwritable {
        path: dir.clone(),
        source: e,
    })?;
    Ok(dir)
}

fn set_locked<T: Clone>(slot: &RwLock<Option<T>>, value: Option<T>) {
    let mut guard = match slot.write() {
        Ok(g) => g,
        Err(poisoned) => {
            log::warn!("Config lock was poisoned, recovering");
            poisoned.into_inner()
        }
    };
    *guard = value;
}

fn read_locked<T: Clone>(slot: &RwLock<Option<T>>) -> Option<T> {
    let guard = match slot.read() {
        Ok(g) => g,
        Err(poisoned) => {
            log::warn!("Config lock was poisoned, recovering");
            poisoned.into_inner()
        }
    };
    guard.clone()
}
