use crate::store::{Row, RowStore, StoreError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;
use uuid::Uuid;

/// Rows before the first data row. Reported row numbers are 1-indexed file
/// positions, so the first data row is row 2.
pub const HEADER_ROWS: usize = 1;

/// One raw row of an uploaded roster, column names matching the register's
/// import template.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImportRow {
    pub apellidos: String,
    pub nombres: String,
    pub grado: String,
    pub seccion: String,
    pub dni: String,
    pub ncelular: String,
    pub apoderado: String,
    pub ncelular2: String,
    pub direccion: String,
}

impl ImportRow {
    /// Lenient JSON mapping for inline uploads: numbers (a bare DNI or
    /// grade cell) coerce to their text form, anything else to empty.
    pub fn from_json(v: &Value) -> ImportRow {
        fn text(v: &Value, key: &str) -> String {
            match v.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => String::new(),
            }
        }
        ImportRow {
            apellidos: text(v, "apellidos"),
            nombres: text(v, "nombres"),
            grado: text(v, "grado"),
            seccion: text(v, "seccion"),
            dni: text(v, "dni"),
            ncelular: text(v, "ncelular"),
            apoderado: text(v, "apoderado"),
            ncelular2: text(v, "ncelular2"),
            direccion: text(v, "direccion"),
        }
    }
}

/// A row that survived classification, normalized into the persisted field
/// shape: names as two distinct columns, optional fields as explicit
/// absence rather than empty text.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStudent {
    pub last_name: String,
    pub first_name: String,
    pub grade: String,
    pub section: String,
    pub dni: Option<String>,
    pub parent_phone: Option<String>,
    pub apoderado: Option<String>,
    pub phone2: Option<String>,
    pub direccion: Option<String>,
}

impl NewStudent {
    pub fn display_name(&self) -> String {
        format!("{}, {}", self.last_name, self.first_name)
    }
}

#[derive(Debug, Default)]
pub struct ImportBatch {
    pub importable: Vec<NewStudent>,
    /// Natural keys already present in the store.
    pub duplicates: Vec<String>,
    /// 1-indexed file row numbers with a required field missing.
    pub incomplete: Vec<usize>,
}

fn opt(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Pure classification of uploaded rows against the already-persisted
/// natural keys. A row missing any required field is incomplete regardless
/// of its key; otherwise a non-empty key found in `existing_keys` makes it
/// a duplicate; everything else is importable. Neither `existing_keys` nor
/// the store is touched.
pub fn reconcile(rows: &[ImportRow], existing_keys: &HashSet<String>) -> ImportBatch {
    let mut batch = ImportBatch::default();
    for (idx, row) in rows.iter().enumerate() {
        let required = [&row.apellidos, &row.nombres, &row.grado, &row.seccion];
        if required.iter().any(|f| f.trim().is_empty()) {
            batch.incomplete.push(idx + HEADER_ROWS + 1);
            continue;
        }
        let dni = row.dni.trim();
        if !dni.is_empty() && existing_keys.contains(dni) {
            batch.duplicates.push(dni.to_string());
            continue;
        }
        batch.importable.push(NewStudent {
            last_name: row.apellidos.trim().to_string(),
            first_name: row.nombres.trim().to_string(),
            grade: row.grado.trim().to_string(),
            section: row.seccion.trim().to_string(),
            dni: opt(&row.dni),
            parent_phone: opt(&row.ncelular),
            apoderado: opt(&row.apoderado),
            phone2: opt(&row.ncelular2),
            direccion: opt(&row.direccion),
        });
    }
    batch
}

/// Gathers the natural-key set the reconciler classifies against.
pub fn existing_natural_keys(store: &dyn RowStore) -> Result<HashSet<String>, StoreError> {
    let rows = store.select("students", &[], None)?;
    Ok(rows
        .iter()
        .filter_map(|r| r.get("dni").and_then(Value::as_str))
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect())
}

/// Submits a confirmed importable set as a single batch insert. An empty
/// set short-circuits without contacting the store.
pub fn commit(store: &dyn RowStore, students: &[NewStudent]) -> Result<usize, StoreError> {
    if students.is_empty() {
        return Ok(0);
    }
    let created_at = chrono::Utc::now().to_rfc3339();
    let rows: Vec<Row> = students
        .iter()
        .map(|s| {
            let mut row = Row::new();
            row.insert("id".into(), json!(Uuid::new_v4().to_string()));
            row.insert("last_name".into(), json!(s.last_name));
            row.insert("first_name".into(), json!(s.first_name));
            row.insert("grade".into(), json!(s.grade));
            row.insert("section".into(), json!(s.section));
            row.insert("dni".into(), json!(s.dni));
            row.insert("parent_phone".into(), json!(s.parent_phone));
            row.insert("apoderado".into(), json!(s.apoderado));
            row.insert("phone2".into(), json!(s.phone2));
            row.insert("direccion".into(), json!(s.direccion));
            row.insert("status".into(), json!("active"));
            row.insert("created_at".into(), json!(created_at));
            row
        })
        .collect();
    store.insert("students", &rows)
}

pub fn read_csv(path: &Path) -> anyhow::Result<Vec<ImportRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: ImportRow = record?;
        rows.push(row);
    }
    Ok(rows)
}
