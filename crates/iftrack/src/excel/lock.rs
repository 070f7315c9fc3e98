//! Excel lock-sidecar handling.
//!
//! While a workbook is open in Excel, a hidden `~$<basename>` sidecar sits
//! next to it. Its first ~128 bytes carry the holder's user name, nominally
//! UTF-16-LE with leading zero bytes, but old clients wrote GBK. The parser
//! extracts the longest printable run and falls back across encodings.

use std::fs::OpenOptions;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::ExcelError;

const SIDECAR_PREFIX: &str = "~$";
const HOLDER_REGION: usize = 128;
const UNKNOWN_HOLDER: &str = "未知用户";

/// Path of the sidecar Excel would create for `workbook`.
pub fn sidecar_path(workbook: &Path) -> PathBuf {
    let name = workbook
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    workbook.with_file_name(format!("{SIDECAR_PREFIX}{name}"))
}

/// Reads the holder name from the sidecar, if one exists.
pub fn read_lock_holder(workbook: &Path) -> Option<String> {
    let sidecar = sidecar_path(workbook);
    let mut file = std::fs::File::open(&sidecar).ok()?;
    let mut buf = vec![0u8; HOLDER_REGION];
    let read = file.read(&mut buf).ok()?;
    buf.truncate(read);
    decode_holder(&buf)
}

/// Probes for exclusive write access with a single attempt, no spinning.
///
/// A present sidecar means another Excel instance holds the workbook; the
/// open probe catches OS-level denials the sidecar cannot.
pub fn probe_exclusive(workbook: &Path) -> Result<(), ExcelError> {
    if !workbook.is_file() {
        return Err(ExcelError::FileMissing(workbook.to_path_buf()));
    }
    if sidecar_path(workbook).is_file() {
        let holder = read_lock_holder(workbook).unwrap_or_else(|| UNKNOWN_HOLDER.to_string());
        return Err(ExcelError::Locked { holder });
    }
    match OpenOptions::new().read(true).write(true).open(workbook) {
        Ok(_) => Ok(()),
        Err(_) => {
            let holder = read_lock_holder(workbook).unwrap_or_else(|| UNKNOWN_HOLDER.to_string());
            Err(ExcelError::Locked { holder })
        }
    }
}

fn decode_holder(buf: &[u8]) -> Option<String> {
    // UTF-16-LE first; the name is padded with zero bytes on both sides.
    if let Some(name) = longest_printable_run(&decode_utf16le(buf)) {
        return Some(name);
    }
    // Legacy clients wrote a GBK name instead.
    let (decoded, _, _) = encoding_rs::GBK.decode(buf);
    longest_printable_run(&decoded)
}

fn decode_utf16le(buf: &[u8]) -> String {
    let units: Vec<u16> = buf
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Longest contiguous run of name-like characters, or `None` if nothing
/// plausible was decoded. Restricting to ASCII and CJK ideographs rejects
/// the Hangul-range garbage a GBK name produces under a UTF-16 decode.
fn longest_printable_run(s: &str) -> Option<String> {
    let best = s
        .split(|c: char| !is_name_char(c))
        .map(str::trim)
        .max_by_key(|seg| seg.chars().count())?;
    if best.is_empty() {
        None
    } else {
        Some(best.to_string())
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ' ' || c == '_' || ('\u{4e00}'..='\u{9fff}').contains(&c)
}
