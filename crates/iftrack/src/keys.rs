//! Canonical task identifiers.
//!
//! A task has two identities: the `business_id`, which is stable across
//! source-file renames and row reorderings, and the `task_id`, the
//! point-identity of one worksheet row (file + row included in the hash).

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Workbook category. Each category carries its own column schema
/// (see `excel::columns`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FileType {
    T1,
    T2,
    T3,
    T4,
    T5,
    T6,
}

impl FileType {
    pub const ALL: [FileType; 6] = [
        FileType::T1,
        FileType::T2,
        FileType::T3,
        FileType::T4,
        FileType::T5,
        FileType::T6,
    ];

    pub fn as_u8(self) -> u8 {
        match self {
            FileType::T1 => 1,
            FileType::T2 => 2,
            FileType::T3 => 3,
            FileType::T4 => 4,
            FileType::T5 => 5,
            FileType::T6 => 6,
        }
    }
}

impl TryFrom<u8> for FileType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FileType::T1),
            2 => Ok(FileType::T2),
            3 => Ok(FileType::T3),
            4 => Ok(FileType::T4),
            5 => Ok(FileType::T5),
            6 => Ok(FileType::T6),
            other => Err(format!("invalid file_type {other}, expected 1..=6")),
        }
    }
}

impl From<FileType> for u8 {
    fn from(value: FileType) -> Self {
        value.as_u8()
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Identity of one observed worksheet row.
///
/// `row_index` is 1-based: the header row is 1, data rows start at 2.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub file_type: FileType,
    pub project_id: String,
    pub interface_id: String,
    pub source_file: String,
    pub row_index: u32,
}

impl TaskKey {
    pub fn new(
        file_type: FileType,
        project_id: impl Into<String>,
        interface_id: impl Into<String>,
        source_file: impl Into<String>,
        row_index: u32,
    ) -> Self {
        Self {
            file_type,
            project_id: normalize_project_id(&project_id.into()),
            interface_id: strip_role_suffix(&interface_id.into()).0,
            source_file: source_file.into(),
            row_index,
        }
    }

    /// Identifier stable across file renames and row moves.
    pub fn business_id(&self) -> String {
        format!(
            "{}|{}|{}",
            self.file_type, self.project_id, self.interface_id
        )
    }

    /// Point-identity used as the registry primary key: a truncated
    /// SHA-256 over the five key fields, with only the basename of the
    /// source file so a directory move does not change identity.
    pub fn task_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.file_type.as_u8().to_string());
        hasher.update(b"|");
        hasher.update(&self.project_id);
        hasher.update(b"|");
        hasher.update(&self.interface_id);
        hasher.update(b"|");
        hasher.update(basename(&self.source_file));
        hasher.update(b"|");
        hasher.update(self.row_index.to_string());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(32);
        for byte in &digest[..16] {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

/// Returns the final path component of `path`, or the whole string when it
/// has no separators. Splits on both `/` and `\` so UNC paths coming from
/// Windows payloads resolve the same everywhere.
pub fn basename(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_string()
}

/// Coerces a project id to its canonical four-digit string form.
///
/// Source dataframes sometimes carry project ids as floats (`1907.0`);
/// file names carry them as plain digit runs.
pub fn normalize_project_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains('.') {
        if let Ok(value) = trimmed.parse::<f64>() {
            if value.fract() == 0.0 && value >= 0.0 {
                return format!("{}", value as u64);
            }
        }
    }
    trimmed.to_string()
}

/// Strips a trailing `(role)` parenthetical (ASCII or full-width) from an
/// interface id. Returns the stripped id and the role text, if any.
pub fn strip_role_suffix(interface_id: &str) -> (String, Option<String>) {
    let trimmed = interface_id.trim();
    for (open, close) in [('（', '）'), ('(', ')')] {
        if trimmed.ends_with(close) {
            if let Some(start) = trimmed.rfind(open) {
                let role = trimmed[start + open.len_utf8()..trimmed.len() - close.len_utf8()]
                    .trim()
                    .to_string();
                let stripped = trimmed[..start].trim_end().to_string();
                if !stripped.is_empty() {
                    let role = if role.is_empty() { None } else { Some(role) };
                    return (stripped, role);
                }
            }
        }
    }
    (trimmed.to_string(), None)
}
