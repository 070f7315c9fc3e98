//! Workbook access: column schemas, the Excel lock sidecar, and a small
//! cell-level xlsx editor built on `zip` + `quick-xml`.

pub mod columns;
pub mod lock;
pub mod xlsx;

pub use columns::ResponseColumns;
pub use xlsx::Workbook;
