//! Hook facade: the narrow entry points the desktop shell and the write
//! pipeline call into.
//!
//! Hooks never propagate errors to callers. Failures are logged and
//! surfaced on a notice channel the UI drains; every hook drops the
//! cached DB connection before returning so no user interaction holds a
//! lock on the shared file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::config;
use crate::db::event_repo::EventKind;
use crate::db::{self, event_repo, read_cache, write_log_repo, DbError};
use crate::error::IftrackError;
use crate::keys::TaskKey;
use crate::pipeline::{AssignmentItem, RegistryNotifier, ResponsePayload, WriteTask};
use crate::registry::service::{self, DisplayEntry, TaskUpsert, Viewer};
use crate::writer::WriteQueue;

/// Messages surfaced to the UI's notification area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Info(String),
    Error(String),
    /// The registry is fenced; the UI should prompt the user to exit.
    Maintenance(String),
}

pub struct Hooks {
    registry_writes: Mutex<Option<(PathBuf, Arc<WriteQueue>)>>,
    notices: Sender<Notice>,
}

impl Hooks {
    /// Creates the facade and hands back the notice receiver for the UI.
    pub fn new() -> (Arc<Self>, Receiver<Notice>) {
        let (notices, receiver) = unbounded();
        (
            Arc::new(Self {
                registry_writes: Mutex::new(None),
                notices,
            }),
            receiver,
        )
    }

    /// The registry write queue for the currently resolved DB path,
    /// recreated when the data folder changes.
    fn write_queue(&self) -> Result<Arc<WriteQueue>, IftrackError> {
        let path = config::resolve_current_db_path()?;
        let mut guard = self
            .registry_writes
            .lock()
            .map_err(|_| IftrackError::Database(DbError::LockPoisoned))?;
        if let Some((cached_path, queue)) = guard.as_ref() {
            if cached_path == &path {
                return Ok(Arc::clone(queue));
            }
            if let Err(e) = queue.flush(Duration::from_secs(30)) {
                log::warn!("Old registry queue did not drain before switch: {}", e);
            }
        }
        let queue = Arc::new(WriteQueue::new(path.clone()));
        *guard = Some((path, Arc::clone(&queue)));
        Ok(queue)
    }

    fn finish(&self, hook: &'static str, result: Result<(), IftrackError>) {
        if let Err(e) = result {
            match &e {
                IftrackError::Database(DbError::Maintenance) => {
                    log::warn!("{} refused: registry in maintenance mode", hook);
                    let _ = self.notices.send(Notice::Maintenance(format!(
                        "{hook}: registry is under maintenance"
                    )));
                }
                _ => {
                    log::error!("{} failed: {}", hook, e);
                    let _ = self.notices.send(Notice::Error(format!("{hook}: {e}")));
                }
            }
        }
        db::close_connection_after_use();
    }

    // Fallible cores, shared with the pipeline bridge.

    pub(crate) fn try_on_assigned(
        &self,
        key: &TaskKey,
        assigned_by: &str,
        assigned_to: &str,
    ) -> Result<(), IftrackError> {
        let queue = self.write_queue()?;
        let key = key.clone();
        let by = assigned_by.to_string();
        let to = assigned_to.to_string();
        queue.submit_wait("assigned", move |conn| {
            service::apply_assignment(conn, &key, &by, &to, Utc::now())
        })?;
        Ok(())
    }

    pub(crate) fn try_on_response_written(
        &self,
        key: &TaskKey,
        response_number: &str,
        user_name: &str,
        role: &str,
    ) -> Result<(), IftrackError> {
        let queue = self.write_queue()?;
        let key = key.clone();
        let number = response_number.to_string();
        let user = user_name.to_string();
        let role = role.to_string();
        queue.submit_wait("response_written", move |conn| {
            service::apply_response_written(conn, &key, &number, &user, &role, Utc::now())
        })?;
        Ok(())
    }

    fn try_on_confirmed(&self, key: &TaskKey, confirmed_by: &str) -> Result<(), IftrackError> {
        let queue = self.write_queue()?;
        let key = key.clone();
        let by = confirmed_by.to_string();
        queue.submit_wait("confirmed", move |conn| {
            service::apply_confirmation(conn, &key, &by, Utc::now())
        })?;
        Ok(())
    }

    fn try_on_unconfirmed(&self, key: &TaskKey, actor: &str) -> Result<(), IftrackError> {
        let queue = self.write_queue()?;
        let key = key.clone();
        let actor = actor.to_string();
        queue.submit_wait("unconfirmed", move |conn| {
            service::apply_unconfirmation(conn, &key, &actor, Utc::now())
        })?;
        Ok(())
    }

    fn try_on_process_done(
        &self,
        upserts: Vec<TaskUpsert>,
        actor: &str,
    ) -> Result<(), IftrackError> {
        let queue = self.write_queue()?;
        let actor = actor.to_string();
        queue.submit_wait("process_done", move |conn| {
            let now = Utc::now();
            let written = service::batch_upsert_tasks(conn, &upserts, now)?;
            event_repo::append_global(
                conn,
                EventKind::ProcessDone,
                &now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                Some(&actor),
                Some(&serde_json::json!({ "tasks": written })),
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn try_on_export_done(&self, actor: &str, exported: usize) -> Result<(), IftrackError> {
        let queue = self.write_queue()?;
        let actor = actor.to_string();
        queue.submit_wait("export_done", move |conn| {
            event_repo::append_global(
                conn,
                EventKind::ExportDone,
                &Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                Some(&actor),
                Some(&serde_json::json!({ "rows": exported })),
            )
        })?;
        Ok(())
    }

    fn try_on_scan_finalize(
        &self,
        batch_tag: &str,
        missing_keep_days: u32,
    ) -> Result<(), IftrackError> {
        let queue = self.write_queue()?;
        let tag = batch_tag.to_string();
        queue.submit_wait("scan_finalized", move |conn| {
            service::finalize_scan(conn, &tag, Utc::now(), missing_keep_days)?;
            Ok(())
        })?;
        Ok(())
    }

    pub(crate) fn try_mirror_log(&self, task: &WriteTask) -> Result<(), IftrackError> {
        let queue = self.write_queue()?;
        let row = task.to_log_row();
        // Fire and forget; the ack is dropped on purpose.
        queue
            .submit("write_log", move |conn| write_log_repo::upsert(conn, &row))
            .map_err(IftrackError::Worker)?;
        Ok(())
    }

    // Public hook surface. Everything below swallows errors.

    pub fn on_assigned(&self, key: &TaskKey, assigned_by: &str, assigned_to: &str) {
        let result = self.try_on_assigned(key, assigned_by, assigned_to);
        self.finish("on_assigned", result);
    }

    pub fn on_response_written(
        &self,
        key: &TaskKey,
        response_number: &str,
        user_name: &str,
        role: &str,
    ) {
        let result = self.try_on_response_written(key, response_number, user_name, role);
        self.finish("on_response_written", result);
    }

    pub fn on_confirmed_by_superior(&self, key: &TaskKey, confirmed_by: &str) {
        let result = self.try_on_confirmed(key, confirmed_by);
        self.finish("on_confirmed_by_superior", result);
    }

    pub fn on_unconfirmed_by_superior(&self, key: &TaskKey, actor: &str) {
        let result = self.try_on_unconfirmed(key, actor);
        self.finish("on_unconfirmed_by_superior", result);
    }

    /// A scan pass finished processing workbooks: push the observed rows.
    pub fn on_process_done(&self, upserts: Vec<TaskUpsert>, actor: &str) {
        let result = self.try_on_process_done(upserts, actor);
        self.finish("on_process_done", result);
    }

    pub fn on_export_done(&self, actor: &str, exported: usize) {
        let result = self.try_on_export_done(actor, exported);
        self.finish("on_export_done", result);
    }

    pub fn on_scan_finalize(&self, batch_tag: &str, missing_keep_days: u32) {
        let result = self.try_on_scan_finalize(batch_tag, missing_keep_days);
        self.finish("on_scan_finalize", result);
    }

    /// Display labels for the given keys, served from the local read
    /// cache. Errors degrade to an empty list.
    pub fn get_display_status(&self, keys: &[TaskKey], viewer: &Viewer) -> Vec<DisplayEntry> {
        let result = (|| -> Result<Vec<DisplayEntry>, IftrackError> {
            let path = config::resolve_current_db_path()?;
            let reader = read_cache::get_read_connection(&path)?;
            let today = chrono::Local::now().date_naive();
            let entries =
                reader.with_conn(|conn| service::get_display_status(conn, keys, viewer, today))?;
            Ok(entries)
        })();
        match result {
            Ok(entries) => {
                db::close_connection_after_use();
                entries
            }
            Err(e) => {
                self.finish("get_display_status", Err(e));
                Vec::new()
            }
        }
    }

    pub fn set_data_folder(&self, path: &Path) {
        let result = config::set_data_folder(path).map_err(IftrackError::Config);
        self.finish("set_data_folder", result);
    }

    pub fn get_data_folder(&self) -> Option<PathBuf> {
        config::get_data_folder()
    }

    /// Forces the next read to re-copy the shared DB file.
    pub fn invalidate_cache(&self) {
        read_cache::invalidate();
        db::close_connection_after_use();
    }

    /// Drains the registry write queue; used at shutdown and before
    /// operations needing a stable snapshot.
    pub fn flush_write_queue(&self, timeout: Duration) {
        let result = (|| -> Result<(), IftrackError> {
            let guard = self
                .registry_writes
                .lock()
                .map_err(|_| IftrackError::Database(DbError::LockPoisoned))?;
            if let Some((_, queue)) = guard.as_ref() {
                queue.flush(timeout).map_err(IftrackError::Worker)?;
            }
            Ok(())
        })();
        self.finish("flush_write_queue", result);
    }
}

/// Adapter the write-task queue talks to; forwards Excel-side completions
/// into the registry through the hook cores.
pub struct RegistryBridge {
    hooks: Arc<Hooks>,
}

impl RegistryBridge {
    pub fn new(hooks: Arc<Hooks>) -> Self {
        Self { hooks }
    }
}

impl RegistryNotifier for RegistryBridge {
    fn response_written(&self, payload: &ResponsePayload) -> Result<(), IftrackError> {
        let key = TaskKey::new(
            payload.file_type,
            payload.project_id.clone(),
            payload.interface_id.clone(),
            payload.file_path.clone(),
            payload.row_index,
        );
        self.hooks.try_on_response_written(
            &key,
            &payload.response_number,
            &payload.user_name,
            &payload.role,
        )
    }

    fn assigned(&self, item: &AssignmentItem) -> Result<(), IftrackError> {
        let key = TaskKey::new(
            item.file_type,
            item.project_id.clone(),
            item.interface_id.clone(),
            item.file_path.clone(),
            item.row_index,
        );
        self.hooks
            .try_on_assigned(&key, &item.assigned_by, &item.assigned_name)
    }

    fn mirror(&self, task: &WriteTask) {
        if let Err(e) = self.hooks.try_mirror_log(task) {
            log::debug!("Shared write-log mirror skipped: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::task_repo::{self, TaskStatus};
    use crate::keys::FileType;
    use crate::roles::STATUS_TODO;
    use serial_test::serial;

    fn key() -> TaskKey {
        TaskKey::new(
            FileType::T1,
            "1818",
            "S-YA-01",
            "1818按项目导出IDI手册2025-08-01-17_55_52.xlsx",
            6,
        )
    }

    fn setup(dir: &Path) -> (Arc<Hooks>, Receiver<Notice>) {
        config::set_data_folder(dir).unwrap();
        Hooks::new()
    }

    fn teardown() {
        config::reset_data_folder();
        db::close_connection_after_use();
    }

    #[test]
    #[serial]
    fn test_on_assigned_writes_through_queue() {
        let dir = tempfile::tempdir().unwrap();
        let (hooks, notices) = setup(dir.path());

        hooks.on_assigned(&key(), "李经理（所领导）", "张三");

        let db_path = config::resolve_current_db_path().unwrap();
        let db = db::open_isolated_connection(&db_path).unwrap();
        let row = db
            .with_conn(|conn| task_repo::find_by_id(conn, &key().task_id()))
            .unwrap()
            .unwrap();
        assert_eq!(row.assigned_to.as_deref(), Some("张三"));
        assert_eq!(row.display_status.as_deref(), Some(STATUS_TODO));
        assert!(notices.try_recv().is_err());
        teardown();
    }

    #[test]
    #[serial]
    fn test_response_then_display_status() {
        let dir = tempfile::tempdir().unwrap();
        let (hooks, _notices) = setup(dir.path());

        hooks.on_assigned(&key(), "李四", "严鹏南");
        hooks.on_response_written(&key(), "HFMR001", "严鹏南", "设计人员");
        hooks.invalidate_cache();

        let viewer = Viewer {
            user_name: "李四".to_string(),
            roles: vec!["设计人员".to_string()],
        };
        let entries = hooks.get_display_status(&[key()], &viewer);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].label, "待指派人审查");
        teardown();
    }

    #[test]
    #[serial]
    fn test_superior_response_confirms() {
        let dir = tempfile::tempdir().unwrap();
        let (hooks, _notices) = setup(dir.path());

        hooks.on_response_written(&key(), "HFMR002", "王主任", "一室主任");

        let db_path = config::resolve_current_db_path().unwrap();
        let db = db::open_isolated_connection(&db_path).unwrap();
        let row = db
            .with_conn(|conn| task_repo::find_by_id(conn, &key().task_id()))
            .unwrap()
            .unwrap();
        assert_eq!(row.status(), TaskStatus::Confirmed);
        assert_eq!(row.confirmed_by.as_deref(), Some("王主任"));
        teardown();
    }

    #[test]
    #[serial]
    fn test_hook_without_data_folder_notifies() {
        config::reset_data_folder();
        let (hooks, notices) = Hooks::new();
        hooks.on_assigned(&key(), "李四", "张三");
        match notices.try_recv() {
            Ok(Notice::Error(msg)) => assert!(msg.contains("on_assigned")),
            other => panic!("expected error notice, got {:?}", other),
        }
        teardown();
    }

    #[test]
    #[serial]
    fn test_maintenance_notice() {
        let dir = tempfile::tempdir().unwrap();
        let (hooks, notices) = setup(dir.path());

        db::enter_maintenance();
        hooks.on_assigned(&key(), "李四", "张三");
        db::exit_maintenance();

        assert!(matches!(notices.try_recv(), Ok(Notice::Maintenance(_))));
        teardown();
    }

    #[test]
    #[serial]
    fn test_flush_write_queue() {
        let dir = tempfile::tempdir().unwrap();
        let (hooks, notices) = setup(dir.path());
        hooks.on_assigned(&key(), "李四", "张三");
        hooks.flush_write_queue(Duration::from_secs(10));
        assert!(notices.try_recv().is_err());
        teardown();
    }
}
