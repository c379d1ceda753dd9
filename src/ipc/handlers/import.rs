use crate::import::{self, ImportRow, NewStudent};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::RowStore;
use serde_json::{json, Value};
use std::path::PathBuf;

/// Uploaded rows arrive either inline (`rows`) or as a CSV file path
/// (`csvPath`) matching the register's template headers.
fn gather_rows(params: &Value) -> Result<Vec<ImportRow>, HandlerErr> {
    if let Some(rows) = params.get("rows").and_then(|v| v.as_array()) {
        return Ok(rows.iter().map(ImportRow::from_json).collect());
    }
    if let Some(path) = params.get("csvPath").and_then(|v| v.as_str()) {
        return import::read_csv(&PathBuf::from(path)).map_err(|e| HandlerErr {
            code: "bad_params",
            message: format!("could not read csv: {e}"),
            details: None,
        });
    }
    Err(HandlerErr::bad_params("missing rows or csvPath"))
}

fn importable_json(s: &NewStudent) -> Value {
    json!({
        "lastName": s.last_name,
        "firstName": s.first_name,
        "displayName": s.display_name(),
        "grade": s.grade,
        "section": s.section,
        "dni": s.dni,
        "parentPhone": s.parent_phone,
        "apoderado": s.apoderado,
        "phone2": s.phone2,
        "direccion": s.direccion,
    })
}

/// Classification only: nothing is written. The caller shows the three
/// counts and asks the user before committing.
fn import_preview(store: &dyn RowStore, params: &Value) -> Result<Value, HandlerErr> {
    let rows = gather_rows(params)?;
    let existing = import::existing_natural_keys(store)?;
    let batch = import::reconcile(&rows, &existing);
    Ok(json!({
        "total": rows.len(),
        "importable": batch.importable.iter().map(importable_json).collect::<Vec<_>>(),
        "importableCount": batch.importable.len(),
        "duplicates": batch.duplicates,
        "incomplete": batch.incomplete,
    }))
}

/// Re-classifies against the keys as they stand now and inserts the
/// importable set in one batch. Rows that went stale between preview and
/// commit are skipped, not failed.
fn import_commit(store: &dyn RowStore, params: &Value) -> Result<Value, HandlerErr> {
    let rows = gather_rows(params)?;
    let existing = import::existing_natural_keys(store)?;
    let batch = import::reconcile(&rows, &existing);
    let inserted = import::commit(store, &batch.importable)?;
    Ok(json!({
        "inserted": inserted,
        "skippedDuplicates": batch.duplicates.len(),
        "skippedIncomplete": batch.incomplete.len(),
    }))
}

fn dispatch(
    state: &mut AppState,
    req: &Request,
    f: impl Fn(&dyn RowStore, &Value) -> Result<Value, HandlerErr>,
) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(store, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.importPreview" => Some(dispatch(state, req, import_preview)),
        "students.importCommit" => Some(dispatch(state, req, import_commit)),
        _ => None,
    }
}
