//! Minimal cell-level xlsx editor.
//!
//! The write pipeline only ever needs to read and set individual cells, so
//! instead of a full spreadsheet engine this keeps the zip entries verbatim
//! and rewrites the worksheet XML event-by-event. Everything the editor
//! does not understand (styles, formulas, drawings) passes through
//! untouched. Written cells become inline strings; the style index of a
//! replaced cell is preserved.

use std::fs::File;
use std::io::{Read, Write as IoWrite};
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesEnd, BytesRef, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::ExcelError;

/// An xlsx workbook held fully in memory.
pub struct Workbook {
    path: PathBuf,
    entries: Vec<(String, Vec<u8>)>,
    sheet_entry: usize,
    shared: Vec<String>,
}

impl Workbook {
    /// Loads the workbook at `path`, including its shared-string table.
    pub fn open(path: &Path) -> Result<Self, ExcelError> {
        if !path.is_file() {
            return Err(ExcelError::FileMissing(path.to_path_buf()));
        }
        let file = File::open(path).map_err(|e| ExcelError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|e| ExcelError::Archive(e.to_string()))?;

        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| ExcelError::Archive(e.to_string()))?;
            if entry.is_dir() {
                continue;
            }
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes).map_err(|e| ExcelError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;
            entries.push((entry.name().to_string(), bytes));
        }

        let sheet_entry = entries
            .iter()
            .position(|(name, _)| name == "xl/worksheets/sheet1.xml")
            .or_else(|| {
                entries.iter().position(|(name, _)| {
                    name.starts_with("xl/worksheets/") && name.ends_with(".xml")
                })
            })
            .ok_or_else(|| ExcelError::SheetMissing("xl/worksheets/sheet1.xml".to_string()))?;

        let shared = match entries.iter().find(|(name, _)| name == "xl/sharedStrings.xml") {
            Some((_, bytes)) => parse_shared_strings(bytes)?,
            None => Vec::new(),
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            sheet_entry,
            shared,
        })
    }

    /// Reads a cell by A1 reference. `None` for absent or empty cells.
    pub fn read_cell(&self, cell: &str) -> Result<Option<String>, ExcelError> {
        let sheet = &self.entries[self.sheet_entry].1;
        let mut reader = Reader::from_reader(sheet.as_slice());
        let mut buf = Vec::new();

        let mut in_target = false;
        let mut cell_type: Option<String> = None;
        let mut in_value = false;
        let mut text = String::new();

        loop {
            buf.clear();
            match reader.read_event_into(&mut buf).map_err(xml_err)? {
                Event::Start(e) if e.local_name().as_ref() == b"c" => {
                    if attr_string(&e, "r")?.as_deref() == Some(cell) {
                        in_target = true;
                        cell_type = attr_string(&e, "t")?;
                    }
                }
                Event::Empty(e) if e.local_name().as_ref() == b"c" => {
                    if attr_string(&e, "r")?.as_deref() == Some(cell) {
                        return Ok(None);
                    }
                }
                Event::Start(e)
                    if in_target && matches!(e.local_name().as_ref(), b"v" | b"t") =>
                {
                    in_value = true;
                }
                Event::Text(t) if in_value => {
                    text.push_str(&t.xml_content().map_err(xml_err)?);
                }
                Event::GeneralRef(r) if in_value => {
                    text.push_str(&resolve_ref(&r)?);
                }
                Event::End(e) if in_value && matches!(e.local_name().as_ref(), b"v" | b"t") => {
                    in_value = false;
                }
                Event::End(e) if in_target && e.local_name().as_ref() == b"c" => {
                    return self.resolve_value(cell_type.as_deref(), text);
                }
                Event::Eof => return Ok(None),
                _ => {}
            }
        }
    }

    fn resolve_value(
        &self,
        cell_type: Option<&str>,
        text: String,
    ) -> Result<Option<String>, ExcelError> {
        match cell_type {
            Some("s") => {
                let idx: usize = text
                    .trim()
                    .parse()
                    .map_err(|_| ExcelError::SheetXml(format!("bad shared-string index '{text}'")))?;
                let value = self.shared.get(idx).cloned().ok_or_else(|| {
                    ExcelError::SheetXml(format!("shared-string index {idx} out of range"))
                })?;
                Ok(if value.is_empty() { None } else { Some(value) })
            }
            _ => Ok(if text.is_empty() { None } else { Some(text) }),
        }
    }

    /// Sets a cell to an inline-string value, creating the row or cell if
    /// needed and keeping the sheet's row/cell ordering intact.
    pub fn set_cell(&mut self, cell: &str, value: &str) -> Result<(), ExcelError> {
        let (target_col, target_row) = split_ref(cell)?;
        let sheet = self.entries[self.sheet_entry].1.clone();
        let mut reader = Reader::from_reader(sheet.as_slice());
        let mut writer = Writer::new(Vec::new());
        let mut buf = Vec::new();

        let mut in_target_row = false;
        let mut done = false;

        loop {
            buf.clear();
            match reader.read_event_into(&mut buf).map_err(xml_err)? {
                Event::Start(e) if e.local_name().as_ref() == b"row" => {
                    if let Some(n) = attr_u32(&e, "r")? {
                        if n == target_row {
                            in_target_row = true;
                        } else if n > target_row && !done {
                            write_new_row(&mut writer, cell, target_row, value)?;
                            done = true;
                        }
                    }
                    writer.write_event(Event::Start(e)).map_err(xml_err)?;
                }
                Event::Empty(e) if e.local_name().as_ref() == b"row" => {
                    match attr_u32(&e, "r")? {
                        Some(n) if n == target_row => {
                            writer
                                .write_event(Event::Start(e.to_owned()))
                                .map_err(xml_err)?;
                            write_cell(&mut writer, cell, None, value)?;
                            writer
                                .write_event(Event::End(BytesEnd::new("row")))
                                .map_err(xml_err)?;
                            done = true;
                        }
                        Some(n) if n > target_row && !done => {
                            write_new_row(&mut writer, cell, target_row, value)?;
                            done = true;
                            writer.write_event(Event::Empty(e)).map_err(xml_err)?;
                        }
                        _ => writer.write_event(Event::Empty(e)).map_err(xml_err)?,
                    }
                }
                Event::End(e) if e.local_name().as_ref() == b"row" => {
                    if in_target_row && !done {
                        write_cell(&mut writer, cell, None, value)?;
                        done = true;
                    }
                    in_target_row = false;
                    writer.write_event(Event::End(e)).map_err(xml_err)?;
                }
                Event::Start(e) if in_target_row && e.local_name().as_ref() == b"c" => {
                    let r = attr_string(&e, "r")?;
                    match r.as_deref() {
                        Some(r_ref) if r_ref == cell => {
                            let style = attr_string(&e, "s")?;
                            skip_to_end(&mut reader, b"c")?;
                            write_cell(&mut writer, cell, style.as_deref(), value)?;
                            done = true;
                        }
                        Some(r_ref) if !done && col_of(r_ref)? > target_col => {
                            write_cell(&mut writer, cell, None, value)?;
                            done = true;
                            writer.write_event(Event::Start(e)).map_err(xml_err)?;
                        }
                        _ => writer.write_event(Event::Start(e)).map_err(xml_err)?,
                    }
                }
                Event::Empty(e) if in_target_row && e.local_name().as_ref() == b"c" => {
                    let r = attr_string(&e, "r")?;
                    match r.as_deref() {
                        Some(r_ref) if r_ref == cell => {
                            let style = attr_string(&e, "s")?;
                            write_cell(&mut writer, cell, style.as_deref(), value)?;
                            done = true;
                        }
                        Some(r_ref) if !done && col_of(r_ref)? > target_col => {
                            write_cell(&mut writer, cell, None, value)?;
                            done = true;
                            writer.write_event(Event::Empty(e)).map_err(xml_err)?;
                        }
                        _ => writer.write_event(Event::Empty(e)).map_err(xml_err)?,
                    }
                }
                Event::End(e) if e.local_name().as_ref() == b"sheetData" => {
                    if !done {
                        write_new_row(&mut writer, cell, target_row, value)?;
                        done = true;
                    }
                    writer.write_event(Event::End(e)).map_err(xml_err)?;
                }
                Event::Empty(e) if e.local_name().as_ref() == b"sheetData" => {
                    writer
                        .write_event(Event::Start(e.to_owned()))
                        .map_err(xml_err)?;
                    write_new_row(&mut writer, cell, target_row, value)?;
                    writer
                        .write_event(Event::End(BytesEnd::new("sheetData")))
                        .map_err(xml_err)?;
                    done = true;
                }
                Event::Eof => break,
                ev => writer.write_event(ev).map_err(xml_err)?,
            }
        }

        if !done {
            return Err(ExcelError::SheetXml(
                "worksheet has no sheetData element".to_string(),
            ));
        }
        self.entries[self.sheet_entry].1 = writer.into_inner();
        Ok(())
    }

    /// Writes the workbook to `path` atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), ExcelError> {
        let tmp = path.with_extension("xlsx.tmp");
        let file = File::create(&tmp).map_err(|e| ExcelError::Write {
            path: tmp.clone(),
            source: e,
        })?;
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, bytes) in &self.entries {
            zip.start_file(name.as_str(), options)
                .map_err(|e| ExcelError::Archive(e.to_string()))?;
            zip.write_all(bytes).map_err(|e| ExcelError::Write {
                path: tmp.clone(),
                source: e,
            })?;
        }
        zip.finish().map_err(|e| ExcelError::Archive(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| ExcelError::Write {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }

    /// Writes back to the file the workbook was opened from.
    pub fn save_in_place(&self) -> Result<(), ExcelError> {
        let path = self.path.clone();
        self.save(&path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_shared_strings(bytes: &[u8]) -> Result<Vec<String>, ExcelError> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) if e.local_name().as_ref() == b"si" => {
                in_si = true;
                current.clear();
            }
            Event::Start(e) if in_si && e.local_name().as_ref() == b"t" => in_t = true,
            Event::Text(t) if in_t => current.push_str(&t.xml_content().map_err(xml_err)?),
            Event::GeneralRef(r) if in_t => current.push_str(&resolve_ref(&r)?),
            Event::End(e) if e.local_name().as_ref() == b"t" => in_t = false,
            Event::End(e) if e.local_name().as_ref() == b"si" => {
                in_si = false;
                strings.push(std::mem::take(&mut current));
            }
            Event::Empty(e) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(strings)
}

fn write_cell<W: IoWrite>(
    writer: &mut Writer<W>,
    cell_ref: &str,
    style: Option<&str>,
    value: &str,
) -> Result<(), ExcelError> {
    let mut c = BytesStart::new("c");
    c.push_attribute(("r", cell_ref));
    if let Some(s) = style {
        c.push_attribute(("s", s));
    }
    c.push_attribute(("t", "inlineStr"));
    writer.write_event(Event::Start(c)).map_err(xml_err)?;
    writer
        .write_event(Event::Start(BytesStart::new("is")))
        .map_err(xml_err)?;
    writer
        .write_event(Event::Start(BytesStart::new("t")))
        .map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(value)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("t")))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("is")))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("c")))
        .map_err(xml_err)?;
    Ok(())
}

fn write_new_row<W: IoWrite>(
    writer: &mut Writer<W>,
    cell_ref: &str,
    row: u32,
    value: &str,
) -> Result<(), ExcelError> {
    let mut r = BytesStart::new("row");
    r.push_attribute(("r", row.to_string().as_str()));
    writer.write_event(Event::Start(r)).map_err(xml_err)?;
    write_cell(writer, cell_ref, None, value)?;
    writer
        .write_event(Event::End(BytesEnd::new("row")))
        .map_err(xml_err)?;
    Ok(())
}

fn skip_to_end(reader: &mut Reader<&[u8]>, tag: &[u8]) -> Result<(), ExcelError> {
    let mut depth = 1u32;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(_) => depth += 1,
            Event::End(e) => {
                depth -= 1;
                if depth == 0 && e.local_name().as_ref() == tag {
                    return Ok(());
                }
            }
            Event::Eof => {
                return Err(ExcelError::SheetXml(format!(
                    "unterminated <{}> element",
                    String::from_utf8_lossy(tag)
                )));
            }
            _ => {}
        }
    }
}

/// Resolves a character or builtin entity reference to its text.
fn resolve_ref(r: &BytesRef<'_>) -> Result<String, ExcelError> {
    if let Some(ch) = r.resolve_char_ref().map_err(xml_err)? {
        return Ok(ch.to_string());
    }
    match r.decode().map_err(xml_err)?.as_ref() {
        "lt" => Ok("<".to_string()),
        "gt" => Ok(">".to_string()),
        "amp" => Ok("&".to_string()),
        "apos" => Ok("'".to_string()),
        "quot" => Ok("\"".to_string()),
        other => Err(ExcelError::SheetXml(format!(
            "unknown entity reference '&{other};'"
        ))),
    }
}

fn xml_err<E: std::fmt::Display>(e: E) -> ExcelError {
    ExcelError::SheetXml(e.to_string())
}

fn attr_string(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, ExcelError> {
    let attr = e.try_get_attribute(name).map_err(xml_err)?;
    Ok(attr.map(|a| String::from_utf8_lossy(&a.value).into_owned()))
}

fn attr_u32(e: &BytesStart<'_>, name: &str) -> Result<Option<u32>, ExcelError> {
    Ok(attr_string(e, name)?.and_then(|v| v.parse().ok()))
}

/// Splits `"S6"` into the column index and row number.
fn split_ref(cell: &str) -> Result<(u32, u32), ExcelError> {
    let letters: String = cell.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let digits = &cell[letters.len()..];
    let row: u32 = digits
        .parse()
        .map_err(|_| ExcelError::SheetXml(format!("bad cell reference '{cell}'")))?;
    if letters.is_empty() || row == 0 {
        return Err(ExcelError::SheetXml(format!("bad cell reference '{cell}'")));
    }
    Ok((col_index(&letters), row))
}

fn col_of(cell_ref: &str) -> Result<u32, ExcelError> {
    Ok(split_ref(cell_ref)?.0)
}

/// 1-based column index: A=1, Z=26, AA=27.
fn col_index(letters: &str) -> u32 {
    letters
        .chars()
        .fold(0u32, |acc, c| acc * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1))
}
