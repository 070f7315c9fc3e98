//! Per-file-type workbook column schema.
//!
//! These letters are dictated by the department's workbook templates and
//! must match them exactly; changing one silently corrupts the sheets.

use crate::error::ExcelError;
use crate::keys::FileType;

/// Columns a response write touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseColumns {
    pub response: &'static str,
    pub date: &'static str,
    pub writer: &'static str,
}

/// For type-6 sheets, the column holding the expected date.
pub const T6_DUE_DATE_COLUMN: &str = "I";
/// For type-6 sheets, the column receiving the on-time flag.
pub const T6_TIMELINESS_COLUMN: &str = "M";
pub const T6_ON_TIME: &str = "按时回复";
pub const T6_OVERDUE: &str = "延期回复";

/// Resolves the response/date/writer columns for a file type.
///
/// Type-3 sheets have two trigger columns; `source_column` says which one
/// held the value the user responded to and picks the variant. Other types
/// ignore it.
pub fn response_columns(
    file_type: FileType,
    source_column: Option<&str>,
) -> Result<ResponseColumns, ExcelError> {
    let cols = match file_type {
        FileType::T1 => ResponseColumns {
            response: "S",
            date: "M",
            writer: "V",
        },
        FileType::T2 => ResponseColumns {
            response: "P",
            date: "N",
            writer: "AL",
        },
        FileType::T3 => match source_column {
            Some("L") => ResponseColumns {
                response: "S",
                date: "Q",
                writer: "BM",
            },
            Some("M") | None => ResponseColumns {
                response: "V",
                date: "T",
                writer: "BM",
            },
            Some(other) => {
                return Err(ExcelError::SheetXml(format!(
                    "unknown source column '{other}' for file type 3"
                )));
            }
        },
        FileType::T4 => ResponseColumns {
            response: "U",
            date: "V",
            writer: "AT",
        },
        FileType::T5 => ResponseColumns {
            response: "V",
            date: "N",
            writer: "W",
        },
        FileType::T6 => ResponseColumns {
            response: "L",
            date: "J",
            writer: "N",
        },
    };
    Ok(cols)
}

/// The responsible-person column for assignment writes.
pub fn assignee_column(file_type: FileType) -> &'static str {
    match file_type {
        FileType::T1 => "R",
        FileType::T2 => "AM",
        FileType::T3 => "AP",
        FileType::T4 => "AH",
        FileType::T5 => "K",
        FileType::T6 => "X",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_columns_per_type() {
        let c = response_columns(FileType::T1, None).unwrap();
        assert_eq!((c.response, c.date, c.writer), ("S", "M", "V"));
        let c = response_columns(FileType::T6, None).unwrap();
        assert_eq!((c.response, c.date, c.writer), ("L", "J", "N"));
    }

    #[test]
    fn test_type3_variants() {
        let m = response_columns(FileType::T3, Some("M")).unwrap();
        assert_eq!((m.response, m.date, m.writer), ("V", "T", "BM"));
        let l = response_columns(FileType::T3, Some("L")).unwrap();
        assert_eq!((l.response, l.date, l.writer), ("S", "Q", "BM"));
        // Missing trigger falls back to the M variant.
        let default = response_columns(FileType::T3, None).unwrap();
        assert_eq!(default, m);
        assert!(response_columns(FileType::T3, Some("Z")).is_err());
    }

    #[test]
    fn test_assignee_columns() {
        assert_eq!(assignee_column(FileType::T1), "R");
        assert_eq!(assignee_column(FileType::T2), "AM");
        assert_eq!(assignee_column(FileType::T3), "AP");
        assert_eq!(assignee_column(FileType::T4), "AH");
        assert_eq!(assignee_column(FileType::T5), "K");
        assert_eq!(assignee_column(FileType::T6), "X");
    }
}
