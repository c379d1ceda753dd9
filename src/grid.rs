use crate::store::{Filter, Row, RowStore, StoreError};
use chrono::{Datelike, NaiveDate, Weekday};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

pub const ATTENDANCE_CODES: [&str; 4] = ["Presente", "Falta", "Justificada", "Tardanza"];
pub const ACHIEVEMENT_CODES: [&str; 4] = ["Logrado", "Proceso", "Inicio", "Destacado"];

/// Achievement grids always span sessions S1..S10, independent of month.
pub const ACHIEVEMENT_SESSIONS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridKind {
    Attendance { year: i32, month: u32 },
    Achievement,
}

impl GridKind {
    pub fn table(&self) -> &'static str {
        match self {
            GridKind::Attendance { .. } => "attendance",
            GridKind::Achievement => "achievements",
        }
    }

    pub fn slot_column(&self) -> &'static str {
        match self {
            GridKind::Attendance { .. } => "date",
            GridKind::Achievement => "period",
        }
    }

    pub fn status_column(&self) -> &'static str {
        match self {
            GridKind::Attendance { .. } => "status",
            GridKind::Achievement => "level",
        }
    }

    pub fn conflict_keys(&self) -> [&'static str; 3] {
        ["student_id", self.slot_column(), "area"]
    }

    pub fn slot_count(&self) -> u32 {
        match self {
            GridKind::Attendance { year, month } => days_in_month(*year, *month),
            GridKind::Achievement => ACHIEVEMENT_SESSIONS,
        }
    }

    /// Whether a slot accepts a default fill. Weekend days are addressable
    /// in storage but excluded from bulk fills; every session is working.
    pub fn is_working_slot(&self, slot: u32) -> bool {
        match self {
            GridKind::Attendance { year, month } => {
                match NaiveDate::from_ymd_opt(*year, *month, slot) {
                    Some(d) => !matches!(d.weekday(), Weekday::Sat | Weekday::Sun),
                    None => false,
                }
            }
            GridKind::Achievement => slot >= 1 && slot <= ACHIEVEMENT_SESSIONS,
        }
    }

    /// The persisted slot key: a calendar date for attendance, an "S<n>"
    /// token for achievement.
    pub fn slot_key(&self, slot: u32) -> String {
        match self {
            GridKind::Attendance { year, month } => {
                format!("{year:04}-{month:02}-{slot:02}")
            }
            GridKind::Achievement => format!("S{slot}"),
        }
    }

    /// Inverse of `slot_key`. Rows with unparsable keys are dropped when a
    /// grid is rebuilt, matching the tolerant read path of the register.
    pub fn parse_slot(&self, key: &str) -> Option<u32> {
        match self {
            GridKind::Attendance { .. } => NaiveDate::parse_from_str(key, "%Y-%m-%d")
                .ok()
                .map(|d| d.day()),
            GridKind::Achievement => {
                let n: u32 = key.strip_prefix('S')?.parse().ok()?;
                (1..=ACHIEVEMENT_SESSIONS).contains(&n).then_some(n)
            }
        }
    }

    pub fn is_valid_code(&self, code: &str) -> bool {
        match self {
            GridKind::Attendance { .. } => ATTENDANCE_CODES.contains(&code),
            GridKind::Achievement => ACHIEVEMENT_CODES.contains(&code),
        }
    }
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if leap => 29,
        2 => 28,
        _ => 30,
    }
}

#[derive(Debug)]
pub enum GridError {
    Validation(String),
    Store(StoreError),
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridError::Validation(m) => write!(f, "{m}"),
            GridError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for GridError {}

impl From<StoreError> for GridError {
    fn from(e: StoreError) -> Self {
        GridError::Store(e)
    }
}

#[derive(Debug, Clone)]
pub struct CohortFilter {
    pub grade: String,
    pub section: String,
    pub area: String,
}

impl CohortFilter {
    fn validate(&self) -> Result<(), GridError> {
        for (name, v) in [
            ("grade", &self.grade),
            ("section", &self.section),
            ("area", &self.area),
        ] {
            if v.trim().is_empty() {
                return Err(GridError::Validation(format!(
                    "cohort filter {name} must not be empty"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub id: String,
    pub last_name: String,
    pub first_name: String,
}

impl RosterEntry {
    /// Presentation-only derivation. Names are stored as two columns; the
    /// register never splits a combined string back apart.
    pub fn display_name(&self) -> String {
        format!("{}, {}", self.last_name, self.first_name)
    }

    fn sort_key(&self) -> String {
        format!("{} {}", self.last_name, self.first_name).to_lowercase()
    }
}

/// One open cohort grid: the sorted roster plus a sparse
/// (student, slot) -> code map. Rebuilt from scratch on every load;
/// missing pairs are "no status" and are never materialized.
#[derive(Debug)]
pub struct GridSession {
    pub cohort: CohortFilter,
    pub kind: GridKind,
    pub roster: Vec<RosterEntry>,
    cells: BTreeMap<String, BTreeMap<u32, String>>,
}

impl GridSession {
    /// Fetches the roster for (grade, section) and the existing records for
    /// (area, slot range), and folds them into a fresh session. All three
    /// cohort fields are required.
    pub fn load(
        store: &dyn RowStore,
        cohort: CohortFilter,
        kind: GridKind,
    ) -> Result<GridSession, GridError> {
        cohort.validate()?;

        let student_rows = store.select(
            "students",
            &[
                Filter::eq("grade", cohort.grade.as_str()),
                Filter::eq("section", cohort.section.as_str()),
            ],
            None,
        )?;

        let mut roster: Vec<RosterEntry> = student_rows
            .iter()
            .filter_map(|row| {
                Some(RosterEntry {
                    id: row.get("id")?.as_str()?.to_string(),
                    last_name: row
                        .get("last_name")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    first_name: row
                        .get("first_name")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                })
            })
            .collect();
        roster.sort_by_key(|e| e.sort_key());

        let mut cells: BTreeMap<String, BTreeMap<u32, String>> = BTreeMap::new();
        if !roster.is_empty() {
            let ids: Vec<Value> = roster.iter().map(|e| json!(e.id)).collect();
            let mut filters = vec![
                Filter::is_in("student_id", ids),
                Filter::eq("area", cohort.area.as_str()),
            ];
            if let GridKind::Attendance { .. } = kind {
                filters.push(Filter::gte("date", kind.slot_key(1)));
                filters.push(Filter::lte("date", kind.slot_key(kind.slot_count())));
            }
            let records = store.select(kind.table(), &filters, None)?;
            for rec in &records {
                let student = rec.get("student_id").and_then(Value::as_str);
                let key = rec.get(kind.slot_column()).and_then(Value::as_str);
                let code = rec.get(kind.status_column()).and_then(Value::as_str);
                let (Some(student), Some(key), Some(code)) = (student, key, code) else {
                    continue;
                };
                let Some(slot) = kind.parse_slot(key) else {
                    continue;
                };
                cells
                    .entry(student.to_string())
                    .or_default()
                    .insert(slot, code.to_string());
            }
        }

        Ok(GridSession {
            cohort,
            kind,
            roster,
            cells,
        })
    }

    pub fn cells(&self) -> &BTreeMap<String, BTreeMap<u32, String>> {
        &self.cells
    }

    pub fn cell(&self, student_id: &str, slot: u32) -> Option<&str> {
        self.cells
            .get(student_id)
            .and_then(|m| m.get(&slot))
            .map(String::as_str)
    }

    fn require_member(&self, student_id: &str) -> Result<(), GridError> {
        if self.roster.iter().any(|e| e.id == student_id) {
            Ok(())
        } else {
            Err(GridError::Validation(format!(
                "student {student_id} is not in the open roster"
            )))
        }
    }

    fn require_slot(&self, slot: u32) -> Result<(), GridError> {
        if slot >= 1 && slot <= self.kind.slot_count() {
            Ok(())
        } else {
            Err(GridError::Validation(format!(
                "slot {slot} out of range 1..={}",
                self.kind.slot_count()
            )))
        }
    }

    /// In-memory mutation only. The code itself is deliberately not checked
    /// against the enumeration here; `save` re-validates before persisting.
    pub fn set_cell(
        &mut self,
        student_id: &str,
        slot: u32,
        code: Option<&str>,
    ) -> Result<(), GridError> {
        self.require_member(student_id)?;
        self.require_slot(slot)?;
        let row = self.cells.entry(student_id.to_string()).or_default();
        match code.map(str::trim).filter(|c| !c.is_empty()) {
            Some(c) => {
                row.insert(slot, c.to_string());
            }
            None => {
                row.remove(&slot);
            }
        }
        Ok(())
    }

    /// Sets every empty working slot of every roster student to `code`.
    /// Existing values are never overwritten; weekend days are skipped even
    /// when empty. Returns the number of cells filled.
    pub fn fill_default(&mut self, code: &str) -> Result<usize, GridError> {
        if !self.kind.is_valid_code(code) {
            return Err(GridError::Validation(format!(
                "unknown status code: {code}"
            )));
        }
        let mut filled = 0usize;
        for entry in &self.roster {
            let row = self.cells.entry(entry.id.clone()).or_default();
            for slot in 1..=self.kind.slot_count() {
                if self.kind.is_working_slot(slot) && !row.contains_key(&slot) {
                    row.insert(slot, code.to_string());
                    filled += 1;
                }
            }
        }
        Ok(filled)
    }

    /// Flattens every non-empty cell into a record batch and performs one
    /// upsert keyed on (student, slot, area). An all-empty grid is a no-op
    /// reporting zero writes. The batch is treated as atomic by callers;
    /// the store does not actually guarantee that, so a mid-batch failure
    /// can leave the grid stale until the next load.
    pub fn save(&self, store: &dyn RowStore) -> Result<usize, GridError> {
        let mut records: Vec<Row> = Vec::new();
        for entry in &self.roster {
            let Some(row) = self.cells.get(&entry.id) else {
                continue;
            };
            for (&slot, code) in row {
                if code.is_empty() {
                    continue;
                }
                if !self.kind.is_valid_code(code) {
                    return Err(GridError::Validation(format!(
                        "unknown status code: {code}"
                    )));
                }
                let mut rec = Row::new();
                rec.insert("student_id".into(), json!(entry.id));
                rec.insert(self.kind.slot_column().into(), json!(self.kind.slot_key(slot)));
                rec.insert("area".into(), json!(self.cohort.area));
                rec.insert(self.kind.status_column().into(), json!(code));
                if self.kind == GridKind::Achievement {
                    // The register has no competency selector; the writer
                    // tags every session record with the general one.
                    rec.insert("competencia".into(), json!("General"));
                }
                records.push(rec);
            }
        }
        if records.is_empty() {
            return Ok(0);
        }
        Ok(store.upsert(self.kind.table(), &records, &self.kind.conflict_keys())?)
    }

    /// Deletes every persisted record for the open roster restricted to
    /// (area, slot range), then empties the in-memory grid. Irreversible;
    /// callers confirm first. Zero matches is still success.
    pub fn clear(&mut self, store: &dyn RowStore) -> Result<usize, GridError> {
        if self.roster.is_empty() {
            self.cells.clear();
            return Ok(0);
        }
        let ids: Vec<Value> = self.roster.iter().map(|e| json!(e.id)).collect();
        let mut filters = vec![
            Filter::is_in("student_id", ids),
            Filter::eq("area", self.cohort.area.as_str()),
        ];
        if let GridKind::Attendance { .. } = self.kind {
            filters.push(Filter::gte("date", self.kind.slot_key(1)));
            filters.push(Filter::lte("date", self.kind.slot_key(self.kind.slot_count())));
        }
        let deleted = store.delete(self.kind.table(), &filters)?;
        self.cells.clear();
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use rusqlite::Connection;
    use serde_json::json;

    fn mem_store() -> SqliteStore {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        crate::db::init_schema(&conn).expect("schema");
        SqliteStore::new(conn)
    }

    fn seed_student(store: &SqliteStore, id: &str, last: &str, first: &str) {
        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row.insert("last_name".into(), json!(last));
        row.insert("first_name".into(), json!(first));
        row.insert("grade".into(), json!("1"));
        row.insert("section".into(), json!("A"));
        store.insert("students", &[row]).expect("seed student");
    }

    fn cohort() -> CohortFilter {
        CohortFilter {
            grade: "1".into(),
            section: "A".into(),
            area: "Matemática".into(),
        }
    }

    // August 2026 starts on a Saturday: 21 weekdays, 10 weekend days.
    const AUG_2026: GridKind = GridKind::Attendance {
        year: 2026,
        month: 8,
    };

    #[test]
    fn load_rejects_missing_cohort_filters() {
        let store = mem_store();
        let mut c = cohort();
        c.area = "  ".into();
        let err = GridSession::load(&store, c, AUG_2026).unwrap_err();
        assert!(matches!(err, GridError::Validation(_)));
    }

    #[test]
    fn roster_is_ordered_by_last_then_first_case_insensitively() {
        let store = mem_store();
        seed_student(&store, "1", "Paz", "Ana");
        seed_student(&store, "2", "Diaz", "Leo");
        seed_student(&store, "3", "diaz", "Ana");

        let grid = GridSession::load(&store, cohort(), AUG_2026).unwrap();
        let names: Vec<String> = grid.roster.iter().map(|e| e.display_name()).collect();
        assert_eq!(names, vec!["diaz, Ana", "Diaz, Leo", "Paz, Ana"]);
    }

    #[test]
    fn save_then_load_round_trips_non_empty_cells() {
        let store = mem_store();
        seed_student(&store, "s1", "Paz", "Ana");
        seed_student(&store, "s2", "Diaz", "Leo");

        let mut grid = GridSession::load(&store, cohort(), AUG_2026).unwrap();
        grid.set_cell("s1", 5, Some("Presente")).unwrap();
        grid.set_cell("s1", 6, Some("Falta")).unwrap();
        grid.set_cell("s2", 5, Some("Tardanza")).unwrap();
        // Cleared before save: must not persist.
        grid.set_cell("s2", 7, Some("Presente")).unwrap();
        grid.set_cell("s2", 7, None).unwrap();

        let written = grid.save(&store).unwrap();
        assert_eq!(written, 3);

        let reloaded = GridSession::load(&store, cohort(), AUG_2026).unwrap();
        assert_eq!(reloaded.cells(), grid.cells());
        assert_eq!(reloaded.cell("s2", 7), None);
    }

    #[test]
    fn save_produces_the_exact_record_shape() {
        let store = mem_store();
        seed_student(&store, "s1", "Paz", "Ana");

        let mut grid = GridSession::load(&store, cohort(), AUG_2026).unwrap();
        grid.set_cell("s1", 5, Some("Presente")).unwrap();
        assert_eq!(grid.save(&store).unwrap(), 1);

        let rows = store.select("attendance", &[], None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["student_id"], json!("s1"));
        assert_eq!(rows[0]["date"], json!("2026-08-05"));
        assert_eq!(rows[0]["area"], json!("Matemática"));
        assert_eq!(rows[0]["status"], json!("Presente"));
    }

    #[test]
    fn save_of_an_empty_grid_writes_nothing() {
        let store = mem_store();
        seed_student(&store, "s1", "Paz", "Ana");

        let grid = GridSession::load(&store, cohort(), AUG_2026).unwrap();
        assert_eq!(grid.save(&store).unwrap(), 0);
        assert!(store.select("attendance", &[], None).unwrap().is_empty());
    }

    #[test]
    fn save_rejects_codes_outside_the_enumeration() {
        let store = mem_store();
        seed_student(&store, "s1", "Paz", "Ana");

        let mut grid = GridSession::load(&store, cohort(), AUG_2026).unwrap();
        // set_cell is intentionally permissive...
        grid.set_cell("s1", 5, Some("X")).unwrap();
        // ...and save is not.
        assert!(matches!(
            grid.save(&store).unwrap_err(),
            GridError::Validation(_)
        ));
    }

    #[test]
    fn fill_default_skips_weekends_and_existing_values() {
        let store = mem_store();
        seed_student(&store, "s1", "Paz", "Ana");

        let mut grid = GridSession::load(&store, cohort(), AUG_2026).unwrap();
        grid.set_cell("s1", 3, Some("Falta")).unwrap(); // Monday, pre-filled

        let filled = grid.fill_default("Presente").unwrap();
        assert_eq!(filled, 20); // 21 weekdays minus the pre-filled one

        assert_eq!(grid.cell("s1", 3), Some("Falta"));
        assert_eq!(grid.cell("s1", 4), Some("Presente"));
        assert_eq!(grid.cell("s1", 1), None); // Saturday
        assert_eq!(grid.cell("s1", 2), None); // Sunday
    }

    #[test]
    fn achievement_grid_spans_ten_sessions_and_fills_all() {
        let store = mem_store();
        seed_student(&store, "s1", "Paz", "Ana");

        let mut grid = GridSession::load(&store, cohort(), GridKind::Achievement).unwrap();
        assert_eq!(grid.kind.slot_count(), 10);
        grid.set_cell("s1", 2, Some("Logrado")).unwrap();
        assert_eq!(grid.fill_default("Inicio").unwrap(), 9);
        assert_eq!(grid.cell("s1", 2), Some("Logrado"));

        assert_eq!(grid.save(&store).unwrap(), 10);
        let rows = store.select("achievements", &[], None).unwrap();
        assert_eq!(rows.len(), 10);
        assert!(rows.iter().all(|r| r["competencia"] == json!("General")));
        assert!(rows
            .iter()
            .any(|r| r["period"] == json!("S2") && r["level"] == json!("Logrado")));
    }

    #[test]
    fn clear_on_an_empty_range_reports_zero_deletions() {
        let store = mem_store();
        seed_student(&store, "s1", "Paz", "Ana");

        let mut grid = GridSession::load(&store, cohort(), AUG_2026).unwrap();
        assert_eq!(grid.clear(&store).unwrap(), 0);
    }

    #[test]
    fn clear_only_touches_the_open_area_and_range() {
        let store = mem_store();
        seed_student(&store, "s1", "Paz", "Ana");

        let mut grid = GridSession::load(&store, cohort(), AUG_2026).unwrap();
        grid.set_cell("s1", 5, Some("Presente")).unwrap();
        grid.save(&store).unwrap();

        let mut other = cohort();
        other.area = "Inglés".into();
        let mut ingles = GridSession::load(&store, other, AUG_2026).unwrap();
        ingles.set_cell("s1", 5, Some("Falta")).unwrap();
        ingles.save(&store).unwrap();

        assert_eq!(grid.clear(&store).unwrap(), 1);
        let left = store.select("attendance", &[], None).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0]["area"], json!("Inglés"));
    }

    #[test]
    fn unparsable_slot_keys_are_dropped_on_load() {
        let store = mem_store();
        seed_student(&store, "s1", "Paz", "Ana");

        let mut rec = Row::new();
        rec.insert("student_id".into(), json!("s1"));
        rec.insert("period".into(), json!("extra"));
        rec.insert("area".into(), json!("Matemática"));
        rec.insert("level".into(), json!("Logrado"));
        store
            .upsert("achievements", &[rec], &["student_id", "period", "area"])
            .unwrap();

        let grid = GridSession::load(&store, cohort(), GridKind::Achievement).unwrap();
        assert!(grid.cells().is_empty());
    }

    #[test]
    fn february_is_leap_aware() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2026, 2), 28);
        assert_eq!(days_in_month(2000, 2), 29);
        assert_eq!(days_in_month(1900, 2), 28);
    }
}
