use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Map, Value};
use std::fmt;

/// One stored row, keyed by column name.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// The named table does not exist. Benign for connectivity probes.
    MissingRelation,
    /// A lookup that expected a row found none. Benign for probes.
    NoRows,
    Other,
}

#[derive(Debug, Clone)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn is_benign(&self) -> bool {
        matches!(
            self.kind,
            StoreErrorKind::MissingRelation | StoreErrorKind::NoRows
        )
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, Clone)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
    Gte(String, Value),
    Lte(String, Value),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }
    pub fn is_in(column: &str, values: Vec<Value>) -> Self {
        Filter::In(column.to_string(), values)
    }
    pub fn gte(column: &str, value: impl Into<Value>) -> Self {
        Filter::Gte(column.to_string(), value.into())
    }
    pub fn lte(column: &str, value: impl Into<Value>) -> Self {
        Filter::Lte(column.to_string(), value.into())
    }
}

#[derive(Debug, Clone)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// The row-store boundary: generic filtered reads and batch writes over
/// named tables. The grid model and the import reconciler are written
/// against this trait so they can be exercised without the daemon.
pub trait RowStore {
    fn select(
        &self,
        table: &str,
        filters: &[Filter],
        order: Option<&Order>,
    ) -> Result<Vec<Row>, StoreError>;
    fn insert(&self, table: &str, rows: &[Row]) -> Result<usize, StoreError>;
    fn update(&self, table: &str, patch: &Row, filters: &[Filter]) -> Result<usize, StoreError>;
    fn delete(&self, table: &str, filters: &[Filter]) -> Result<usize, StoreError>;
    /// Insert-or-overwrite keyed on `conflict_keys`. At most one row
    /// survives per key tuple.
    fn upsert(&self, table: &str, rows: &[Row], conflict_keys: &[&str])
        -> Result<usize, StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        SqliteStore { conn }
    }
}

fn store_err(e: rusqlite::Error) -> StoreError {
    let message = e.to_string();
    let kind = if matches!(e, rusqlite::Error::QueryReturnedNoRows) {
        StoreErrorKind::NoRows
    } else if message.contains("no such table") {
        StoreErrorKind::MissingRelation
    } else {
        StoreErrorKind::Other
    };
    StoreError { kind, message }
}

fn bad_identifier(name: &str) -> StoreError {
    StoreError {
        kind: StoreErrorKind::Other,
        message: format!("invalid identifier: {name}"),
    }
}

fn check_identifier(name: &str) -> Result<(), StoreError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(bad_identifier(name))
    }
}

fn to_sql_value(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql_value(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(r) => Value::from(r),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Value::from(String::from_utf8_lossy(b).to_string()),
    }
}

/// Renders `filters` as a WHERE clause with positional placeholders.
/// An `In` filter over an empty list matches nothing.
fn where_clause(filters: &[Filter]) -> Result<(String, Vec<SqlValue>), StoreError> {
    if filters.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    let mut parts: Vec<String> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();
    for f in filters {
        match f {
            Filter::Eq(col, v) => {
                check_identifier(col)?;
                parts.push(format!("{col} = ?"));
                params.push(to_sql_value(v));
            }
            Filter::Gte(col, v) => {
                check_identifier(col)?;
                parts.push(format!("{col} >= ?"));
                params.push(to_sql_value(v));
            }
            Filter::Lte(col, v) => {
                check_identifier(col)?;
                parts.push(format!("{col} <= ?"));
                params.push(to_sql_value(v));
            }
            Filter::In(col, vs) => {
                check_identifier(col)?;
                if vs.is_empty() {
                    parts.push("1 = 0".to_string());
                } else {
                    let marks = vec!["?"; vs.len()].join(", ");
                    parts.push(format!("{col} IN ({marks})"));
                    params.extend(vs.iter().map(to_sql_value));
                }
            }
        }
    }
    Ok((format!(" WHERE {}", parts.join(" AND ")), params))
}

impl RowStore for SqliteStore {
    fn select(
        &self,
        table: &str,
        filters: &[Filter],
        order: Option<&Order>,
    ) -> Result<Vec<Row>, StoreError> {
        check_identifier(table)?;
        let (clause, params) = where_clause(filters)?;
        let mut sql = format!("SELECT * FROM {table}{clause}");
        if let Some(o) = order {
            check_identifier(&o.column)?;
            sql.push_str(&format!(
                " ORDER BY {} {}",
                o.column,
                if o.ascending { "ASC" } else { "DESC" }
            ));
        }
        let mut stmt = self.conn.prepare(&sql).map_err(store_err)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(params_from_iter(params)).map_err(store_err)?;
        let mut out = Vec::new();
        while let Some(r) = rows.next().map_err(store_err)? {
            let mut row = Row::new();
            for (i, col) in columns.iter().enumerate() {
                let v = r.get_ref(i).map_err(store_err)?;
                row.insert(col.clone(), from_sql_value(v));
            }
            out.push(row);
        }
        Ok(out)
    }

    fn insert(&self, table: &str, rows: &[Row]) -> Result<usize, StoreError> {
        check_identifier(table)?;
        if rows.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction().map_err(store_err)?;
        let mut written = 0usize;
        for row in rows {
            written += exec_insert(&tx, table, row, None)?;
        }
        tx.commit().map_err(store_err)?;
        Ok(written)
    }

    fn update(&self, table: &str, patch: &Row, filters: &[Filter]) -> Result<usize, StoreError> {
        check_identifier(table)?;
        if patch.is_empty() {
            return Ok(0);
        }
        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        for (col, v) in patch {
            check_identifier(col)?;
            sets.push(format!("{col} = ?"));
            params.push(to_sql_value(v));
        }
        let (clause, where_params) = where_clause(filters)?;
        params.extend(where_params);
        let sql = format!("UPDATE {table} SET {}{clause}", sets.join(", "));
        self.conn
            .execute(&sql, params_from_iter(params))
            .map_err(store_err)
    }

    fn delete(&self, table: &str, filters: &[Filter]) -> Result<usize, StoreError> {
        check_identifier(table)?;
        let (clause, params) = where_clause(filters)?;
        let sql = format!("DELETE FROM {table}{clause}");
        self.conn
            .execute(&sql, params_from_iter(params))
            .map_err(store_err)
    }

    fn upsert(
        &self,
        table: &str,
        rows: &[Row],
        conflict_keys: &[&str],
    ) -> Result<usize, StoreError> {
        check_identifier(table)?;
        for key in conflict_keys {
            check_identifier(key)?;
        }
        if rows.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction().map_err(store_err)?;
        let mut written = 0usize;
        for row in rows {
            written += exec_insert(&tx, table, row, Some(conflict_keys))?;
        }
        tx.commit().map_err(store_err)?;
        Ok(written)
    }
}

fn exec_insert(
    conn: &Connection,
    table: &str,
    row: &Row,
    conflict_keys: Option<&[&str]>,
) -> Result<usize, StoreError> {
    if row.is_empty() {
        return Ok(0);
    }
    let mut columns: Vec<&str> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();
    for (col, v) in row {
        check_identifier(col)?;
        columns.push(col.as_str());
        params.push(to_sql_value(v));
    }
    let marks = vec!["?"; columns.len()].join(", ");
    let mut sql = format!(
        "INSERT INTO {table}({}) VALUES({marks})",
        columns.join(", ")
    );
    if let Some(keys) = conflict_keys {
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !keys.contains(c))
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT({}) DO NOTHING", keys.join(", ")));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT({}) DO UPDATE SET {}",
                keys.join(", "),
                updates.join(", ")
            ));
        }
    }
    conn.execute(&sql, params_from_iter(params)).map_err(store_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mem_store() -> SqliteStore {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        crate::db::init_schema(&conn).expect("schema");
        SqliteStore::new(conn)
    }

    fn student_row(id: &str, last: &str, first: &str) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row.insert("last_name".into(), json!(last));
        row.insert("first_name".into(), json!(first));
        row.insert("grade".into(), json!("1"));
        row.insert("section".into(), json!("A"));
        row
    }

    #[test]
    fn upsert_overwrites_on_conflict_key() {
        let store = mem_store();
        store
            .insert("students", &[student_row("s1", "Paz", "Ana")])
            .unwrap();

        let mut rec = Row::new();
        rec.insert("student_id".into(), json!("s1"));
        rec.insert("date".into(), json!("2026-03-05"));
        rec.insert("area".into(), json!("Matemática"));
        rec.insert("status".into(), json!("Falta"));
        store
            .upsert("attendance", &[rec.clone()], &["student_id", "date", "area"])
            .unwrap();

        rec.insert("status".into(), json!("Presente"));
        store
            .upsert("attendance", &[rec], &["student_id", "date", "area"])
            .unwrap();

        let rows = store
            .select("attendance", &[Filter::eq("student_id", "s1")], None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], json!("Presente"));
    }

    #[test]
    fn delete_with_no_matches_reports_zero() {
        let store = mem_store();
        let n = store
            .delete("attendance", &[Filter::eq("area", "Inglés")])
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn missing_relation_is_a_benign_error() {
        let store = mem_store();
        let err = store
            .select("_keep_alive_activity", &[], None)
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::MissingRelation);
        assert!(err.is_benign());
    }

    #[test]
    fn in_filter_over_empty_list_matches_nothing() {
        let store = mem_store();
        store
            .insert("students", &[student_row("s1", "Paz", "Ana")])
            .unwrap();
        let rows = store
            .select("students", &[Filter::is_in("id", vec![])], None)
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn range_filters_bound_both_ends() {
        let store = mem_store();
        store
            .insert("students", &[student_row("s1", "Paz", "Ana")])
            .unwrap();
        for (date, status) in [
            ("2026-02-28", "Presente"),
            ("2026-03-05", "Falta"),
            ("2026-04-01", "Presente"),
        ] {
            let mut rec = Row::new();
            rec.insert("student_id".into(), json!("s1"));
            rec.insert("date".into(), json!(date));
            rec.insert("area".into(), json!("Matemática"));
            rec.insert("status".into(), json!(status));
            store
                .upsert("attendance", &[rec], &["student_id", "date", "area"])
                .unwrap();
        }
        let rows = store
            .select(
                "attendance",
                &[
                    Filter::gte("date", "2026-03-01"),
                    Filter::lte("date", "2026-03-31"),
                ],
                None,
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["date"], json!("2026-03-05"));
    }
}
