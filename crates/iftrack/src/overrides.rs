//! Pending override cache.
//!
//! Between "user clicked Submit" and "Excel+registry committed" the grid
//! would otherwise show stale cells. This cache records the optimistic
//! value per `(path, row, file_type)` and patches it into grid rows until
//! the backing write task reaches a terminal state. It observes the
//! write-task queue passively; the queue knows nothing about it.
//!
//! Process-local only, never persisted.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::keys::{self, FileType};
use crate::pipeline::{TaskListener, TaskPayload, WriteTask};
use crate::roles;

/// Key under which an override is filed. Paths are case-folded and
/// separator-normalized; payloads carry UNC paths while grid rows often
/// carry a bare basename, so each override is filed under both variants.
type OverrideKey = (String, u32, u8);

#[derive(Debug, Clone)]
enum OverrideValue {
    Assignment {
        responsible_person: String,
    },
    Response {
        response_number: String,
        user_name: String,
        role: String,
    },
}

#[derive(Debug, Clone)]
struct Override {
    write_task_id: String,
    value: OverrideValue,
}

/// One grid row as the UI hands it over for patching.
#[derive(Debug, Clone, Default)]
pub struct GridRow {
    pub file_path: String,
    pub row_index: u32,
    pub project_id: String,
    pub assigned_by: Option<String>,
    pub responsible_person: Option<String>,
    pub status: Option<String>,
    pub response_number: Option<String>,
    pub completed_mark: Option<String>,
    /// Set by `apply_overrides`; the UI drops hidden rows.
    pub hidden: bool,
}

#[derive(Default)]
pub struct PendingOverrides {
    inner: RwLock<HashMap<OverrideKey, Override>>,
}

fn normalize_path(path: &str) -> String {
    path.trim().replace('\\', "/").to_lowercase()
}

fn keys_for(path: &str, row_index: u32, file_type: FileType) -> [OverrideKey; 2] {
    let full = normalize_path(path);
    let base = keys::basename(&full);
    [
        (full, row_index, file_type.as_u8()),
        (base, row_index, file_type.as_u8()),
    ]
}

impl PendingOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, path: &str, row_index: u32, file_type: FileType, entry: Override) {
        if let Ok(mut map) = self.inner.write() {
            for key in keys_for(path, row_index, file_type) {
                map.insert(key, entry.clone());
            }
        }
    }

    fn remove_for_task(&self, write_task_id: &str) {
        if let Ok(mut map) = self.inner.write() {
            map.retain(|_, entry| entry.write_task_id != write_task_id);
        }
    }

    fn lookup(&self, path: &str, row_index: u32, file_type: FileType) -> Option<Override> {
        let map = self.inner.read().ok()?;
        for key in keys_for(path, row_index, file_type) {
            if let Some(entry) = map.get(&key) {
                return Some(entry.clone());
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        // Both key variants point at the same override; count distinct tasks.
        self.inner
            .read()
            .map(|map| {
                let mut ids: Vec<&str> =
                    map.values().map(|e| e.write_task_id.as_str()).collect();
                ids.sort_unstable();
                ids.dedup();
                ids.len()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().map(|map| map.is_empty()).unwrap_or(true)
    }

    /// Patches optimistic values into `rows`.
    ///
    /// Response overrides submitted by the viewer disappear from their own
    /// grid, unless the viewer holds a superior role (their response was
    /// auto-confirmed and stays visible as reviewed).
    pub fn apply_overrides(
        &self,
        rows: &mut [GridRow],
        file_type: FileType,
        user_roles: &[String],
        current_user: &str,
    ) {
        let viewer_superior = roles::any_superior(user_roles);
        for row in rows.iter_mut() {
            let Some(entry) = self.lookup(&row.file_path, row.row_index, file_type) else {
                continue;
            };
            match &entry.value {
                OverrideValue::Assignment { responsible_person } => {
                    row.responsible_person = Some(responsible_person.clone());
                    row.status = Some(roles::STATUS_TODO.to_string());
                }
                OverrideValue::Response {
                    response_number,
                    user_name,
                    role,
                } => {
                    let label = roles::response_display_status(
                        roles::is_superior(role),
                        row.assigned_by.is_some(),
                    );
                    row.response_number = Some(response_number.clone());
                    row.status = Some(label.to_string());
                    row.completed_mark = Some("已完成".to_string());
                    if user_name == current_user && !viewer_superior {
                        row.hidden = true;
                    }
                }
            }
        }
    }
}

/// Canonical string form of a project id coming out of a dataframe, which
/// may carry it as a float (`1907.0`).
pub fn canonical_project_id(raw: &str) -> String {
    keys::normalize_project_id(raw)
}

impl TaskListener for PendingOverrides {
    fn on_task_update(&self, task: &WriteTask) {
        if task.status.is_terminal() {
            self.remove_for_task(&task.id);
            return;
        }
        match &task.payload {
            TaskPayload::Assignment { items } => {
                for item in items {
                    self.insert(
                        &item.file_path,
                        item.row_index,
                        item.file_type,
                        Override {
                            write_task_id: task.id.clone(),
                            value: OverrideValue::Assignment {
                                responsible_person: item.assigned_name.clone(),
                            },
                        },
                    );
                }
            }
            TaskPayload::Response(payload) => {
                self.insert(
                    &payload.file_path,
                    payload.row_index,
                    payload.file_type,
                    Override {
                        write_task_id: task.id.clone(),
                        value: OverrideValue::Response {
                            response_number: payload.response_number.clone(),
                            user_name: payload.user_name.clone(),
                            role: payload.role.clone(),
                        },
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{AssignmentItem, ResponsePayload, WriteTaskStatus};
    use crate::roles::{STATUS_AWAITING_ASSIGNER, STATUS_AWAITING_REVIEW, STATUS_TODO};
    use chrono::Utc;

    fn assignment_task() -> WriteTask {
        WriteTask::new_assignment(
            vec![AssignmentItem {
                file_type: FileType::T1,
                file_path: r"\\Share\Dept\List.xlsx".to_string(),
                row_index: 6,
                project_id: "1818".to_string(),
                interface_id: "S-YA-01".to_string(),
                assigned_name: "张三".to_string(),
                assigned_by: "李经理（所领导）".to_string(),
            }],
            "李经理（所领导）",
            Utc::now(),
        )
    }

    fn response_task(user: &str, role: &str) -> WriteTask {
        WriteTask::new_response(
            ResponsePayload {
                file_path: r"\\Share\Dept\List.xlsx".to_string(),
                file_type: FileType::T1,
                row_index: 6,
                project_id: "1818".to_string(),
                interface_id: "S-YA-01".to_string(),
                response_number: "HFMR001".to_string(),
                user_name: user.to_string(),
                source_column: None,
                role: role.to_string(),
            },
            Utc::now(),
        )
    }

    fn grid_row(path: &str) -> GridRow {
        GridRow {
            file_path: path.to_string(),
            row_index: 6,
            project_id: "1818".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_assignment_override_visible_until_terminal() {
        let cache = PendingOverrides::new();
        let mut task = assignment_task();
        cache.on_task_update(&task);

        let mut rows = vec![grid_row(r"\\share\dept\list.xlsx")];
        cache.apply_overrides(&mut rows, FileType::T1, &[], "王主任");
        assert_eq!(rows[0].responsible_person.as_deref(), Some("张三"));
        assert_eq!(rows[0].status.as_deref(), Some(STATUS_TODO));

        task.status = WriteTaskStatus::Completed;
        cache.on_task_update(&task);
        assert!(cache.is_empty());

        let mut rows = vec![grid_row(r"\\share\dept\list.xlsx")];
        cache.apply_overrides(&mut rows, FileType::T1, &[], "王主任");
        assert!(rows[0].responsible_person.is_none());
    }

    #[test]
    fn test_basename_key_matches_unc_payload() {
        let cache = PendingOverrides::new();
        cache.on_task_update(&assignment_task());

        // The grid row only carries a basename, in different case.
        let mut rows = vec![grid_row("LIST.XLSX")];
        cache.apply_overrides(&mut rows, FileType::T1, &[], "王主任");
        assert_eq!(rows[0].responsible_person.as_deref(), Some("张三"));
    }

    #[test]
    fn test_wrong_row_or_type_is_untouched() {
        let cache = PendingOverrides::new();
        cache.on_task_update(&assignment_task());

        let mut other_row = grid_row("list.xlsx");
        other_row.row_index = 7;
        let mut rows = vec![other_row];
        cache.apply_overrides(&mut rows, FileType::T1, &[], "王主任");
        assert!(rows[0].responsible_person.is_none());

        let mut rows = vec![grid_row("list.xlsx")];
        cache.apply_overrides(&mut rows, FileType::T2, &[], "王主任");
        assert!(rows[0].responsible_person.is_none());
    }

    #[test]
    fn test_response_override_labels_for_assigner() {
        let cache = PendingOverrides::new();
        cache.on_task_update(&response_task("严鹏南", "设计人员"));

        let mut row = grid_row("list.xlsx");
        row.assigned_by = Some("李四".to_string());
        let mut rows = vec![row];
        // The assignor views the grid: awaiting-assigner label, not hidden.
        cache.apply_overrides(&mut rows, FileType::T1, &[], "李四");
        assert_eq!(rows[0].status.as_deref(), Some(STATUS_AWAITING_ASSIGNER));
        assert_eq!(rows[0].response_number.as_deref(), Some("HFMR001"));
        assert_eq!(rows[0].completed_mark.as_deref(), Some("已完成"));
        assert!(!rows[0].hidden);
    }

    #[test]
    fn test_own_response_hidden_from_author() {
        let cache = PendingOverrides::new();
        cache.on_task_update(&response_task("严鹏南", "设计人员"));

        let mut rows = vec![grid_row("list.xlsx")];
        cache.apply_overrides(
            &mut rows,
            FileType::T1,
            &["设计人员".to_string()],
            "严鹏南",
        );
        assert!(rows[0].hidden);
        assert_eq!(rows[0].status.as_deref(), Some(STATUS_AWAITING_REVIEW));
    }

    #[test]
    fn test_superior_author_keeps_row_visible() {
        let cache = PendingOverrides::new();
        cache.on_task_update(&response_task("王主任", "一室主任"));

        let mut rows = vec![grid_row("list.xlsx")];
        cache.apply_overrides(
            &mut rows,
            FileType::T1,
            &["一室主任".to_string()],
            "王主任",
        );
        assert!(!rows[0].hidden);
        assert_eq!(rows[0].status.as_deref(), Some(crate::roles::STATUS_REVIEWED));
    }

    #[test]
    fn test_failed_task_clears_override() {
        let cache = PendingOverrides::new();
        let mut task = response_task("严鹏南", "设计人员");
        cache.on_task_update(&task);
        assert_eq!(cache.len(), 1);

        task.status = WriteTaskStatus::Failed;
        cache.on_task_update(&task);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_canonical_project_id() {
        assert_eq!(canonical_project_id("1907.0"), "1907");
        assert_eq!(canonical_project_id("1907"), "1907");
        assert_eq!(canonical_project_id(" 1818 "), "1818");
    }
}
