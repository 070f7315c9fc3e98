//! Excel-side execution of write tasks.
//!
//! Pure with respect to the registry: these functions only touch
//! workbooks. Every write is verified by reopening the file read-only and
//! comparing the cell against the submitted value.

use std::path::Path;

use chrono::NaiveDate;

use crate::error::ExcelError;
use crate::excel::columns::{self, T6_DUE_DATE_COLUMN, T6_ON_TIME, T6_OVERDUE, T6_TIMELINESS_COLUMN};
use crate::excel::{lock, Workbook};
use crate::keys::FileType;
use crate::registry::service::parse_interface_time;

use super::task::{AssignmentItem, ResponsePayload};

/// Result of an assignment batch: strict semantics, any failure fails the
/// whole task.
#[derive(Debug, Clone, Default)]
pub struct AssignmentOutcome {
    pub success_count: usize,
    /// `(interface_id, reason)` per failed item.
    pub failed: Vec<(String, String)>,
}

impl AssignmentOutcome {
    pub fn is_success(&self, expected: usize) -> bool {
        self.success_count == expected && self.failed.is_empty()
    }

    pub fn first_reason(&self) -> Option<&str> {
        self.failed.first().map(|(_, reason)| reason.as_str())
    }
}

fn cell_ref(col: &str, row: u32) -> String {
    format!("{col}{row}")
}

/// Writes a response into the workbook: response number, date, writer
/// name, and for type-6 sheets the on-time flag. Verifies the response
/// cell after saving.
pub fn execute_response(payload: &ResponsePayload, today: NaiveDate) -> Result<(), ExcelError> {
    let path = Path::new(&payload.file_path);
    lock::probe_exclusive(path)?;

    let mut workbook = Workbook::open(path)?;
    let cols = columns::response_columns(payload.file_type, payload.source_column.as_deref())?;
    let date = today.format("%Y-%m-%d").to_string();

    let response_cell = cell_ref(cols.response, payload.row_index);
    workbook.set_cell(&response_cell, &payload.response_number)?;
    workbook.set_cell(&cell_ref(cols.date, payload.row_index), &date)?;
    workbook.set_cell(&cell_ref(cols.writer, payload.row_index), &payload.user_name)?;

    if payload.file_type == FileType::T6 {
        write_timeliness_flag(&mut workbook, payload.row_index, today)?;
    }

    workbook.save_in_place()?;
    verify_cell(path, &response_cell, &payload.response_number)?;
    Ok(())
}

/// For type-6 sheets, fill the M column from the expected date in I.
/// An unparseable expected date leaves the flag untouched.
fn write_timeliness_flag(
    workbook: &mut Workbook,
    row_index: u32,
    today: NaiveDate,
) -> Result<(), ExcelError> {
    let due_cell = cell_ref(T6_DUE_DATE_COLUMN, row_index);
    let due = workbook
        .read_cell(&due_cell)?
        .and_then(|raw| parse_interface_time(&raw, today));
    match due {
        Some(due_date) => {
            let flag = if today <= due_date { T6_ON_TIME } else { T6_OVERDUE };
            workbook.set_cell(&cell_ref(T6_TIMELINESS_COLUMN, row_index), flag)?;
        }
        None => {
            log::warn!("Row {} has no parseable expected date, skipping flag", row_index);
        }
    }
    Ok(())
}

/// Writes one assignment row and verifies it.
pub fn execute_assignment_item(item: &AssignmentItem) -> Result<(), ExcelError> {
    let path = Path::new(&item.file_path);
    lock::probe_exclusive(path)?;

    let mut workbook = Workbook::open(path)?;
    let col = columns::assignee_column(item.file_type);
    let cell = cell_ref(col, item.row_index);
    workbook.set_cell(&cell, &item.assigned_name)?;
    workbook.save_in_place()?;
    verify_cell(path, &cell, &item.assigned_name)?;
    Ok(())
}

/// Runs a whole assignment batch, collecting per-item outcomes.
pub fn execute_assignment_batch(items: &[AssignmentItem]) -> AssignmentOutcome {
    let mut outcome = AssignmentOutcome::default();
    for item in items {
        match execute_assignment_item(item) {
            Ok(()) => outcome.success_count += 1,
            Err(e) => {
                log::warn!(
                    "Assignment for {} row {} failed: {}",
                    item.interface_id,
                    item.row_index,
                    e
                );
                outcome.failed.push((item.interface_id.clone(), e.to_string()));
            }
        }
    }
    outcome
}

fn verify_cell(path: &Path, cell: &str, expected: &str) -> Result<(), ExcelError> {
    let reread = Workbook::open(path)?;
    let actual = reread.read_cell(cell)?.unwrap_or_default();
    if actual != expected {
        return Err(ExcelError::VerifyMismatch {
            cell: cell.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::excel::xlsx::tests::build_fixture;
    use std::path::PathBuf;

    const SHEET: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>
<row r="1"><c r="A1" t="inlineStr"><is><t>项目号</t></is></c></row>
<row r="6"><c r="A6" t="inlineStr"><is><t>1818</t></is></c><c r="I6" t="inlineStr"><is><t>2025-08-10</t></is></c></row>
</sheetData></worksheet>"#;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 2).unwrap()
    }

    fn fixture(dir: &Path) -> PathBuf {
        let path = dir.join("book.xlsx");
        build_fixture(&path, SHEET);
        path
    }

    fn response(path: &Path, file_type: FileType) -> ResponsePayload {
        ResponsePayload {
            file_path: path.to_string_lossy().into_owned(),
            file_type,
            row_index: 6,
            project_id: "1818".to_string(),
            interface_id: "S-YA-01".to_string(),
            response_number: "HFMR001".to_string(),
            user_name: "严鹏南".to_string(),
            source_column: None,
            role: "设计人员".to_string(),
        }
    }

    fn assignment(path: &Path) -> AssignmentItem {
        AssignmentItem {
            file_type: FileType::T1,
            file_path: path.to_string_lossy().into_owned(),
            row_index: 6,
            project_id: "1818".to_string(),
            interface_id: "S-YA-01".to_string(),
            assigned_name: "张三".to_string(),
            assigned_by: "李经理（所领导）".to_string(),
        }
    }

    #[test]
    fn test_response_writes_all_three_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        execute_response(&response(&path, FileType::T1), today()).unwrap();

        let wb = Workbook::open(&path).unwrap();
        assert_eq!(wb.read_cell("S6").unwrap().as_deref(), Some("HFMR001"));
        assert_eq!(wb.read_cell("M6").unwrap().as_deref(), Some("2025-08-02"));
        assert_eq!(wb.read_cell("V6").unwrap().as_deref(), Some("严鹏南"));
    }

    #[test]
    fn test_type6_on_time_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        // Due 2025-08-10, today 2025-08-02: on time.
        execute_response(&response(&path, FileType::T6), today()).unwrap();
        let wb = Workbook::open(&path).unwrap();
        assert_eq!(wb.read_cell("L6").unwrap().as_deref(), Some("HFMR001"));
        assert_eq!(wb.read_cell("M6").unwrap().as_deref(), Some("按时回复"));
    }

    #[test]
    fn test_type6_overdue_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let late = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap();
        execute_response(&response(&path, FileType::T6), late).unwrap();
        let wb = Workbook::open(&path).unwrap();
        assert_eq!(wb.read_cell("M6").unwrap().as_deref(), Some("延期回复"));
    }

    #[test]
    fn test_response_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut payload = response(&dir.path().join("gone.xlsx"), FileType::T1);
        payload.file_path = dir.path().join("gone.xlsx").to_string_lossy().into_owned();
        let err = execute_response(&payload, today()).unwrap_err();
        assert_eq!(err.to_string(), "文件不存在");
    }

    #[test]
    fn test_response_locked_workbook_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        // Simulate Excel holding the file: write the UTF-16 sidecar.
        let sidecar = lock::sidecar_path(&path);
        let mut bytes = vec![2u8, 0, 0, 0];
        for unit in "王五".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        std::fs::write(&sidecar, bytes).unwrap();

        let err = execute_response(&response(&path, FileType::T1), today()).unwrap_err();
        assert_eq!(err.to_string(), "文件正被 【王五】 占用，请稍后再试");
        let wb = Workbook::open(&path).unwrap();
        assert_eq!(wb.read_cell("S6").unwrap(), None);
    }

    #[test]
    fn test_assignment_writes_assignee_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        execute_assignment_item(&assignment(&path)).unwrap();
        let wb = Workbook::open(&path).unwrap();
        assert_eq!(wb.read_cell("R6").unwrap().as_deref(), Some("张三"));
    }

    #[test]
    fn test_assignment_batch_partial_failure() {
        let dir = tempfile::tempdir().unwrap();
        let good = fixture(dir.path());
        let other = dir.path().join("other.xlsx");
        build_fixture(&other, SHEET);

        let mut missing = assignment(&good);
        missing.file_path = dir.path().join("gone.xlsx").to_string_lossy().into_owned();
        missing.interface_id = "S-YA-02".to_string();

        let items = vec![assignment(&good), assignment(&other), missing];
        let outcome = execute_assignment_batch(&items);
        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.first_reason(), Some("文件不存在"));
        assert!(!outcome.is_success(3));
    }
}
