//! Service layer: business semantics over a raw connection.
//!
//! Pure functions over `&Connection`: no UI, no file paths, no network
//! awareness. The write queue composes several of these inside one
//! transaction; the hooks facade decides when they run.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rusqlite::Connection;
use serde_json::json;

use crate::db::event_repo::{self, EventKind};
use crate::db::task_repo::{self, TaskRow, TaskStatus};
use crate::db::DbError;
use crate::keys::TaskKey;
use crate::roles::{self, STATUS_AWAITING_ASSIGNER, STATUS_AWAITING_REVIEW, STATUS_REVIEWED, STATUS_TODO};

/// One upsert request: a key plus the fields the caller explicitly sets.
/// `None` fields on an existing row are preserved, so a mere re-scan never
/// wipes assignments, display status or completion data.
#[derive(Debug, Clone, Default)]
pub struct TaskUpsertFields {
    pub display_status: Option<String>,
    /// Overwrite `display_status` even when the row already has one.
    pub force_display_status: bool,
    pub responsible_person: Option<String>,
    pub assigned_by: Option<String>,
    pub assigned_at: Option<String>,
    pub response_number: Option<String>,
    pub completed_by: Option<String>,
    pub interface_time: Option<String>,
    pub role: Option<String>,
    pub batch_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskUpsert {
    pub key: TaskKey,
    pub fields: TaskUpsertFields,
}

impl TaskUpsert {
    pub fn new(key: TaskKey) -> Self {
        Self {
            key,
            fields: TaskUpsertFields::default(),
        }
    }

    pub fn with_fields(key: TaskKey, fields: TaskUpsertFields) -> Self {
        Self { key, fields }
    }
}

/// Result of `mark_ignored_batch`.
#[derive(Debug, Clone, Default)]
pub struct IgnoreOutcome {
    pub success_count: usize,
    pub failed: Vec<(String, String)>,
}

/// Result of `finalize_scan`.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub archived: usize,
}

/// Who is asking for display statuses.
#[derive(Debug, Clone)]
pub struct Viewer {
    pub user_name: String,
    pub roles: Vec<String>,
}

/// One row of the display-status answer, already ordered.
#[derive(Debug, Clone)]
pub struct DisplayEntry {
    pub task_id: String,
    pub label: String,
    pub interface_time: Option<String>,
    pub overdue: bool,
}

/// Upserts a single task row. Returns the row as stored.
pub fn upsert_task(
    conn: &Connection,
    upsert: &TaskUpsert,
    now: DateTime<Utc>,
) -> Result<TaskRow, DbError> {
    let now_str = format_ts(now);
    let task_id = upsert.key.task_id();
    let existing = task_repo::find_by_id(conn, &task_id)?;

    let mut row = match existing {
        Some(row) => row,
        None => {
            // A new point identity with a live business id means the row
            // moved inside (or between) workbooks: inherit its lifecycle.
            let mut fresh = TaskRow::new(&upsert.key, &now_str);
            if let Some(moved) =
                task_repo::find_live_by_business_id(conn, &upsert.key.business_id())?
            {
                inherit_lifecycle(&mut fresh, &moved);
            }
            task_repo::insert(conn, &fresh)?;
            fresh
        }
    };

    apply_fields(conn, &mut row, &upsert.key, &upsert.fields, &now_str)?;
    row.last_seen_at = now_str;
    if upsert.fields.batch_tag.is_some() {
        row.last_batch_tag = upsert.fields.batch_tag.clone();
    }
    task_repo::update(conn, &row)?;
    Ok(row)
}

/// Upserts a batch of scanned rows. Returns the number written.
pub fn batch_upsert_tasks(
    conn: &Connection,
    upserts: &[TaskUpsert],
    now: DateTime<Utc>,
) -> Result<usize, DbError> {
    let mut written = 0;
    for upsert in upserts {
        upsert_task(conn, upsert, now)?;
        written += 1;
    }
    Ok(written)
}

fn inherit_lifecycle(fresh: &mut TaskRow, moved: &TaskRow) {
    fresh.status = moved.status.clone();
    fresh.display_status = moved.display_status.clone();
    fresh.assigned_by = moved.assigned_by.clone();
    fresh.assigned_to = moved.assigned_to.clone();
    fresh.assigned_at = moved.assigned_at.clone();
    fresh.response_number = moved.response_number.clone();
    fresh.completed_by = moved.completed_by.clone();
    fresh.completed_at = moved.completed_at.clone();
    fresh.confirmed_by = moved.confirmed_by.clone();
    fresh.confirmed_at = moved.confirmed_at.clone();
    fresh.ignored = moved.ignored;
    fresh.ignored_by = moved.ignored_by.clone();
    fresh.ignored_reason = moved.ignored_reason.clone();
    fresh.interface_time_when_ignored = moved.interface_time_when_ignored.clone();
    fresh.interface_time = moved.interface_time.clone();
    fresh.role = moved.role.clone();
    log::debug!(
        "Task {} inherits lifecycle from moved row {}",
        fresh.task_id,
        moved.task_id
    );
}

fn apply_fields(
    conn: &Connection,
    row: &mut TaskRow,
    key: &TaskKey,
    fields: &TaskUpsertFields,
    now_str: &str,
) -> Result<(), DbError> {
    // Display status is sticky: a scan alone never clears or replaces it.
    if fields.force_display_status {
        row.display_status = fields.display_status.clone();
    } else if row.display_status.is_none() {
        if let Some(label) = &fields.display_status {
            row.display_status = Some(label.clone());
        }
    }

    if let Some(person) = &fields.responsible_person {
        row.assigned_to = Some(person.clone());
    }
    if let Some(by) = &fields.assigned_by {
        row.assigned_by = Some(by.clone());
    }
    if let Some(at) = &fields.assigned_at {
        row.assigned_at = Some(at.clone());
    }
    if let Some(number) = &fields.response_number {
        row.response_number = Some(number.clone());
    }
    if let Some(by) = &fields.completed_by {
        row.completed_by = Some(by.clone());
    }
    if let Some(role) = &fields.role {
        row.role = Some(role.clone());
    }

    if let Some(new_time) = &fields.interface_time {
        if row.ignored && row.interface_time_when_ignored.as_deref() != Some(new_time.as_str()) {
            // The due date moved since the row was ignored: the ignore no
            // longer describes reality, clear it and leave a trace.
            row.ignored = false;
            row.ignored_by = None;
            row.ignored_reason = None;
            row.interface_time_when_ignored = None;
            event_repo::append(
                conn,
                EventKind::IgnoreCleared,
                now_str,
                key,
                None,
                Some(&json!({ "interface_time": new_time })),
            )?;
        }
        row.interface_time = Some(new_time.clone());
    }
    Ok(())
}

/// Marks a task completed. Assignment fields are untouched. Requires a
/// response number on the row; completion without a response is invalid.
pub fn mark_completed(conn: &Connection, key: &TaskKey, now: DateTime<Utc>) -> Result<(), DbError> {
    let task_id = key.task_id();
    let mut row =
        task_repo::find_by_id(conn, &task_id)?.ok_or(DbError::TaskNotFound(task_id.clone()))?;
    if row.response_number.is_none() {
        return Err(DbError::InvalidState {
            task_id,
            reason: "cannot complete without a response number".to_string(),
        });
    }
    row.status = TaskStatus::Completed.as_str().to_string();
    row.completed_at = Some(format_ts(now));
    task_repo::update(conn, &row)?;
    Ok(())
}

/// Marks a task confirmed. Only valid from `completed` (or already
/// `confirmed`, which is a no-op refresh of the confirmer).
pub fn mark_confirmed(
    conn: &Connection,
    key: &TaskKey,
    now: DateTime<Utc>,
    confirmed_by: &str,
) -> Result<(), DbError> {
    let task_id = key.task_id();
    let mut row =
        task_repo::find_by_id(conn, &task_id)?.ok_or(DbError::TaskNotFound(task_id.clone()))?;
    match row.status() {
        TaskStatus::Completed | TaskStatus::Confirmed => {}
        other => {
            return Err(DbError::InvalidState {
                task_id,
                reason: format!("cannot confirm from status '{}'", other.as_str()),
            });
        }
    }
    row.status = TaskStatus::Confirmed.as_str().to_string();
    row.confirmed_by = Some(confirmed_by.to_string());
    row.confirmed_at = Some(format_ts(now));
    row.display_status = Some(STATUS_REVIEWED.to_string());
    task_repo::update(conn, &row)?;
    Ok(())
}

/// Reverses a confirmation back to `completed`, restoring the
/// awaiting-review display status.
pub fn unconfirm(conn: &Connection, key: &TaskKey) -> Result<(), DbError> {
    let task_id = key.task_id();
    let mut row =
        task_repo::find_by_id(conn, &task_id)?.ok_or(DbError::TaskNotFound(task_id.clone()))?;
    if row.status() != TaskStatus::Confirmed {
        return Err(DbError::InvalidState {
            task_id,
            reason: format!("cannot unconfirm from status '{}'", row.status),
        });
    }
    row.status = TaskStatus::Completed.as_str().to_string();
    row.confirmed_by = None;
    row.confirmed_at = None;
    row.display_status = Some(
        if row.assigned_by.is_some() {
            STATUS_AWAITING_ASSIGNER
        } else {
            STATUS_AWAITING_REVIEW
        }
        .to_string(),
    );
    task_repo::update(conn, &row)?;
    Ok(())
}

/// Marks a batch of tasks ignored, snapshotting each row's current
/// interface time so a later change can auto-clear the ignore.
pub fn mark_ignored_batch(
    conn: &Connection,
    keys: &[TaskKey],
    ignored_by: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<IgnoreOutcome, DbError> {
    let now_str = format_ts(now);
    let mut outcome = IgnoreOutcome::default();
    for key in keys {
        let task_id = key.task_id();
        let row = match task_repo::find_by_id(conn, &task_id)? {
            Some(row) => row,
            None => {
                outcome
                    .failed
                    .push((task_id, "task not found".to_string()));
                continue;
            }
        };
        let mut row = row;
        row.ignored = true;
        row.ignored_by = Some(ignored_by.to_string());
        row.ignored_reason = Some(reason.to_string());
        row.interface_time_when_ignored = row.interface_time.clone();
        task_repo::update(conn, &row)?;
        event_repo::append(
            conn,
            EventKind::Ignored,
            &now_str,
            key,
            Some(ignored_by),
            Some(&json!({ "reason": reason, "interface_time": row.interface_time })),
        )?;
        outcome.success_count += 1;
    }
    Ok(outcome)
}

/// Archives completed/confirmed tasks that disappeared from the source
/// workbooks: not stamped by the current batch and unseen for longer than
/// `missing_keep_days`. Open tasks are never archived silently.
pub fn finalize_scan(
    conn: &Connection,
    batch_tag: &str,
    now: DateTime<Utc>,
    missing_keep_days: u32,
) -> Result<ScanOutcome, DbError> {
    let cutoff = now - chrono::Duration::days(i64::from(missing_keep_days));
    let archived = task_repo::archive_missing(conn, batch_tag, &format_ts(cutoff))?;
    event_repo::append_global(
        conn,
        EventKind::ScanFinalized,
        &format_ts(now),
        None,
        Some(&json!({ "batch_tag": batch_tag, "archived": archived })),
    )?;
    log::info!(
        "Scan {} finalized: {} task(s) archived",
        batch_tag,
        archived
    );
    Ok(ScanOutcome { archived })
}

/// Resolves display labels for the given keys, filtered to what `viewer`
/// may see, ordered overdue-first then by interface time ascending.
pub fn get_display_status(
    conn: &Connection,
    keys: &[TaskKey],
    viewer: &Viewer,
    today: NaiveDate,
) -> Result<Vec<DisplayEntry>, DbError> {
    let ids: Vec<String> = keys.iter().map(|k| k.task_id()).collect();
    let rows = task_repo::find_many(conn, &ids)?;

    let mut entries: Vec<DisplayEntry> = rows
        .into_iter()
        .filter(|row| row.status() != TaskStatus::Archived)
        .filter(|row| !row.ignored)
        .filter(|row| row.display_status.as_deref().is_some_and(|s| !s.is_empty()))
        .filter(|row| {
            roles::can_view(
                &viewer.roles,
                &viewer.user_name,
                row.assigned_by.as_deref(),
                row.assigned_to.as_deref(),
            )
        })
        .map(|row| {
            let overdue = row
                .interface_time
                .as_deref()
                .and_then(|t| parse_interface_time(t, today))
                .is_some_and(|due| due < today);
            DisplayEntry {
                task_id: row.task_id,
                label: row.display_status.unwrap_or_default(),
                interface_time: row.interface_time,
                overdue,
            }
        })
        .collect();

    // Chronological order, not string order ("9.20" before "10.25");
    // unparseable times fall back to the raw string to keep the sort total.
    let due_of = |e: &DisplayEntry| {
        e.interface_time
            .as_deref()
            .and_then(|t| parse_interface_time(t, today))
    };
    entries.sort_by(|a, b| {
        b.overdue
            .cmp(&a.overdue)
            .then_with(|| match (due_of(a), due_of(b)) {
                (Some(da), Some(db)) => da.cmp(&db),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.interface_time.cmp(&b.interface_time),
            })
    });
    Ok(entries)
}

/// A response was written into the workbook: complete the task, and when
/// the writer holds a superior role, confirm it in the same step.
pub fn apply_response_written(
    conn: &Connection,
    key: &TaskKey,
    response_number: &str,
    user_name: &str,
    role: &str,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let existing = task_repo::find_by_id(conn, &key.task_id())?;
    let has_assigner = existing
        .as_ref()
        .and_then(|row| row.assigned_by.as_deref())
        .is_some();
    let superior = roles::is_superior(role);
    let label = roles::response_display_status(superior, has_assigner);

    let fields = TaskUpsertFields {
        display_status: Some(label.to_string()),
        force_display_status: true,
        response_number: Some(response_number.to_string()),
        completed_by: Some(user_name.to_string()),
        role: Some(role.to_string()),
        // interface_time deliberately absent: a write must not look like a
        // due-date change to the auto-un-ignore logic.
        ..Default::default()
    };
    upsert_task(conn, &TaskUpsert::with_fields(key.clone(), fields), now)?;
    mark_completed(conn, key, now)?;

    let now_str = format_ts(now);
    event_repo::append(
        conn,
        EventKind::ResponseWritten,
        &now_str,
        key,
        Some(user_name),
        Some(&json!({ "response_number": response_number, "role": role })),
    )?;

    if superior {
        mark_confirmed(conn, key, now, user_name)?;
        event_repo::append(
            conn,
            EventKind::Confirmed,
            &now_str,
            key,
            Some(user_name),
            Some(&json!({ "auto": true })),
        )?;
    }
    Ok(())
}

/// A row was assigned to someone: record the assignment and force the
/// display status to "to do".
pub fn apply_assignment(
    conn: &Connection,
    key: &TaskKey,
    assigned_by: &str,
    assigned_to: &str,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let now_str = format_ts(now);
    let fields = TaskUpsertFields {
        display_status: Some(STATUS_TODO.to_string()),
        force_display_status: true,
        responsible_person: Some(assigned_to.to_string()),
        assigned_by: Some(assigned_by.to_string()),
        assigned_at: Some(now_str.clone()),
        ..Default::default()
    };
    upsert_task(conn, &TaskUpsert::with_fields(key.clone(), fields), now)?;
    event_repo::append(
        conn,
        EventKind::Assigned,
        &now_str,
        key,
        Some(assigned_by),
        Some(&json!({ "assigned_to": assigned_to })),
    )?;
    Ok(())
}

/// A superior confirmed a completed response.
pub fn apply_confirmation(
    conn: &Connection,
    key: &TaskKey,
    confirmed_by: &str,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    mark_confirmed(conn, key, now, confirmed_by)?;
    event_repo::append(
        conn,
        EventKind::Confirmed,
        &format_ts(now),
        key,
        Some(confirmed_by),
        None,
    )?;
    Ok(())
}

/// A superior withdrew a confirmation.
pub fn apply_unconfirmation(
    conn: &Connection,
    key: &TaskKey,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    unconfirm(conn, key)?;
    event_repo::append(
        conn,
        EventKind::Unconfirmed,
        &format_ts(now),
        key,
        Some(actor),
        None,
    )?;
    Ok(())
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Parses the loose interface-time formats seen in the workbooks:
/// `10.25` (month.day in the current year), `10-25`, `2025-10-25`.
pub fn parse_interface_time(raw: &str, today: NaiveDate) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    let parts: Vec<&str> = raw.split(['.', '-', '/']).collect();
    if parts.len() == 2 {
        let month: u32 = parts[0].parse().ok()?;
        let day: u32 = parts[1].parse().ok()?;
        return NaiveDate::from_ymd_opt(today.year(), month, day);
    }
    if parts.len() == 3 {
        let year: i32 = parts[0].parse().ok()?;
        let month: u32 = parts[1].parse().ok()?;
        let day: u32 = parts[2].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    None
}
