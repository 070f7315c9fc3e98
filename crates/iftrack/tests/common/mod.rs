//! Shared test utilities: an isolated data folder per test and minimal
//! xlsx fixtures built from raw sheet XML.

#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A sheet with a header row only; writes create the data rows.
pub const BASIC_SHEET: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>
<row r="1"><c r="A1" t="inlineStr"><is><t>项目号</t></is></c><c r="B1" t="inlineStr"><is><t>接口编号</t></is></c></row>
</sheetData></worksheet>"#;

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="xml" ContentType="application/xml"/><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheets><sheet name="Sheet1" sheetId="1" r:id="rId1" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"/></sheets></workbook>"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

/// Writes a complete xlsx archive with the given worksheet XML.
pub fn build_workbook(path: &Path, sheet_xml: &str) {
    let file = File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    let entries = [
        ("[Content_Types].xml", CONTENT_TYPES),
        ("_rels/.rels", ROOT_RELS),
        ("xl/workbook.xml", WORKBOOK),
        ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS),
        ("xl/worksheets/sheet1.xml", sheet_xml),
    ];
    for (name, content) in entries {
        zip.start_file(name, options).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

/// Writes the `~$` sidecar Excel leaves next to an open workbook, holding
/// `holder` in UTF-16LE after a short header.
pub fn write_lock_sidecar(workbook: &Path, holder: &str) {
    let sidecar = iftrack::excel::lock::sidecar_path(workbook);
    let mut bytes = vec![2u8, 0, 0, 0];
    for unit in holder.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    std::fs::write(sidecar, bytes).unwrap();
}

/// One test's world: a temp dir registered as the data folder. Resets the
/// process-global configuration on drop, so tests must run serially.
pub struct TestEnv {
    dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        iftrack::config::set_data_folder(dir.path()).unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn workbook(&self, name: &str, sheet_xml: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        build_workbook(&path, sheet_xml);
        path
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.path().join("write_tasks.json")
    }

    /// A fresh connection to the registry DB, bypassing caches.
    pub fn registry(&self) -> iftrack::Database {
        let db_path = iftrack::config::resolve_current_db_path().unwrap();
        iftrack::db::open_isolated_connection(&db_path).unwrap()
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        iftrack::config::reset_data_folder();
        iftrack::db::close_connection_after_use();
    }
}
