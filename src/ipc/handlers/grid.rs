use crate::grid::{CohortFilter, GridKind, GridSession};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteStore;
use chrono::Datelike;
use serde_json::{json, Map, Value};

fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::missing(key))
}

fn parse_kind(params: &Value) -> Result<GridKind, HandlerErr> {
    match params.get("kind").and_then(|v| v.as_str()) {
        Some("achievement") => Ok(GridKind::Achievement),
        Some("attendance") => {
            let now = chrono::Local::now();
            let month = match params.get("month") {
                None => now.month() as u64,
                Some(v) => v
                    .as_u64()
                    .ok_or_else(|| HandlerErr::bad_params("month must be a number"))?,
            };
            if !(1..=12).contains(&month) {
                return Err(HandlerErr::bad_params("month must be between 1 and 12"));
            }
            let year = match params.get("year") {
                None => now.year() as i64,
                Some(v) => v
                    .as_i64()
                    .ok_or_else(|| HandlerErr::bad_params("year must be a number"))?,
            };
            Ok(GridKind::Attendance {
                year: year as i32,
                month: month as u32,
            })
        }
        Some(other) => Err(HandlerErr::bad_params(format!(
            "kind must be attendance or achievement, got {other}"
        ))),
        None => Err(HandlerErr::missing("kind")),
    }
}

fn session_json(grid: &GridSession) -> Value {
    let students: Vec<Value> = grid
        .roster
        .iter()
        .map(|e| {
            json!({
                "id": e.id,
                "lastName": e.last_name,
                "firstName": e.first_name,
                "displayName": e.display_name(),
            })
        })
        .collect();
    let mut cells = Map::new();
    for (student, row) in grid.cells() {
        let mut slots = Map::new();
        for (slot, code) in row {
            slots.insert(slot.to_string(), json!(code));
        }
        cells.insert(student.clone(), Value::Object(slots));
    }
    let working: Vec<u32> = (1..=grid.kind.slot_count())
        .filter(|&s| grid.kind.is_working_slot(s))
        .collect();
    let mut result = json!({
        "grade": grid.cohort.grade,
        "section": grid.cohort.section,
        "area": grid.cohort.area,
        "slots": grid.kind.slot_count(),
        "workingSlots": working,
        "students": students,
        "cells": Value::Object(cells),
    });
    match grid.kind {
        GridKind::Attendance { year, month } => {
            result["kind"] = json!("attendance");
            result["year"] = json!(year);
            result["month"] = json!(month);
        }
        GridKind::Achievement => {
            result["kind"] = json!("achievement");
        }
    }
    result
}

fn grid_open(
    store: &SqliteStore,
    grid: &mut Option<GridSession>,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let kind = parse_kind(params)?;
    let cohort = CohortFilter {
        grade: params
            .get("grade")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string(),
        section: params
            .get("section")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string(),
        area: params
            .get("area")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string(),
    };
    // Filters change means full rebuild; the previous grid is discarded
    // even when the load fails.
    *grid = None;
    let session = GridSession::load(store, cohort, kind)?;
    let snapshot = session_json(&session);
    *grid = Some(session);
    Ok(snapshot)
}

fn grid_set_cell(grid: &mut GridSession, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let slot = params
        .get("slot")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr::missing("slot"))?;
    let code = match params.get("code") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.as_str()),
        Some(_) => return Err(HandlerErr::bad_params("code must be string or null")),
    };
    grid.set_cell(&student_id, slot as u32, code)?;
    Ok(json!({ "ok": true }))
}

fn grid_fill_default(grid: &mut GridSession, params: &Value) -> Result<Value, HandlerErr> {
    let code = get_required_str(params, "code")?;
    let filled = grid.fill_default(&code)?;
    Ok(json!({ "filled": filled }))
}

fn grid_save(store: &SqliteStore, grid: &GridSession) -> Result<Value, HandlerErr> {
    let written = grid.save(store)?;
    Ok(json!({ "written": written }))
}

fn grid_clear(
    store: &SqliteStore,
    grid: &mut GridSession,
    params: &Value,
) -> Result<Value, HandlerErr> {
    // Irreversible; the caller must have shown a confirmation prompt.
    if params.get("confirm").and_then(|v| v.as_bool()) != Some(true) {
        return Err(HandlerErr::bad_params(
            "clear is irreversible; pass confirm: true",
        ));
    }
    let deleted = grid.clear(store)?;
    Ok(json!({ "deleted": deleted }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let method = req.method.as_str();
    if !matches!(
        method,
        "grid.open" | "grid.setCell" | "grid.fillDefault" | "grid.save" | "grid.clear"
            | "grid.close"
    ) {
        return None;
    }

    let AppState { store, grid, .. } = state;
    let Some(store) = store.as_ref() else {
        return Some(err(
            &req.id,
            "no_workspace",
            "select a workspace first",
            None,
        ));
    };

    if method == "grid.open" {
        return Some(match grid_open(store, grid, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        });
    }
    if method == "grid.close" {
        let was_open = grid.take().is_some();
        return Some(ok(&req.id, json!({ "closed": was_open })));
    }

    let Some(session) = grid.as_mut() else {
        return Some(err(&req.id, "no_grid", "open a grid first", None));
    };
    let outcome = match method {
        "grid.setCell" => grid_set_cell(session, &req.params),
        "grid.fillDefault" => grid_fill_default(session, &req.params),
        "grid.save" => grid_save(store, session),
        _ => grid_clear(store, session, &req.params),
    };
    Some(match outcome {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
