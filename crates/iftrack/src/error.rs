use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IftrackError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DbError),

    #[error("Workbook error: {0}")]
    Excel(#[from] ExcelError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Data folder is not set")]
    DataFolderUnset,

    #[error("Data folder does not exist: {0}")]
    DataFolderMissing(PathBuf),

    #[error("Failed to create registry directory '{path}': {source}")]
    CreateRegistryDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State directory '{path}' is not writable: {source}")]
    StateDirUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while mutating a workbook on the share.
///
/// The `Display` text of `Locked` and `FileMissing` is surfaced verbatim to
/// users, so those messages stay in the operators' language.
#[derive(Error, Debug)]
pub enum ExcelError {
    #[error("文件不存在")]
    FileMissing(PathBuf),

    #[error("文件正被 【{holder}】 占用，请稍后再试")]
    Locked { holder: String },

    #[error("Failed to read workbook '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write workbook '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workbook archive error: {0}")]
    Archive(String),

    #[error("Sheet XML error: {0}")]
    SheetXml(String),

    #[error("Worksheet '{0}' not found in workbook")]
    SheetMissing(String),

    #[error("Cell {cell} read back as '{actual}', expected '{expected}'")]
    VerifyMismatch {
        cell: String,
        expected: String,
        actual: String,
    },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Write queue did not drain within {0:?}")]
    FlushTimeout(std::time::Duration),

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, IftrackError>;
