use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::{Filter, Row, RowStore};
use serde_json::{json, Value};
use uuid::Uuid;

fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::missing(key))
}

fn get_optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// The columns a caller may set. Ids, status and timestamps are ours.
const EDITABLE: [&str; 9] = [
    "last_name",
    "first_name",
    "grade",
    "section",
    "dni",
    "parent_phone",
    "apoderado",
    "phone2",
    "direccion",
];

fn param_key(column: &str) -> &'static str {
    match column {
        "last_name" => "lastName",
        "first_name" => "firstName",
        "grade" => "grade",
        "section" => "section",
        "dni" => "dni",
        "parent_phone" => "parentPhone",
        "apoderado" => "apoderado",
        "phone2" => "phone2",
        _ => "direccion",
    }
}

fn student_json(row: &Row) -> Value {
    let text = |key: &str| row.get(key).and_then(Value::as_str).unwrap_or("");
    json!({
        "id": text("id"),
        "lastName": text("last_name"),
        "firstName": text("first_name"),
        "displayName": format!("{}, {}", text("last_name"), text("first_name")),
        "grade": text("grade"),
        "section": text("section"),
        "dni": row.get("dni").cloned().unwrap_or(Value::Null),
        "parentPhone": row.get("parent_phone").cloned().unwrap_or(Value::Null),
        "apoderado": row.get("apoderado").cloned().unwrap_or(Value::Null),
        "phone2": row.get("phone2").cloned().unwrap_or(Value::Null),
        "direccion": row.get("direccion").cloned().unwrap_or(Value::Null),
        "status": text("status"),
    })
}

fn students_list(store: &dyn RowStore, params: &Value) -> Result<Value, HandlerErr> {
    let mut filters = Vec::new();
    if let Some(grade) = get_optional_str(params, "grade") {
        filters.push(Filter::eq("grade", grade));
    }
    if let Some(section) = get_optional_str(params, "section") {
        filters.push(Filter::eq("section", section));
    }
    let mut rows = store.select("students", &filters, None)?;

    // Same presentation order as the grid roster.
    rows.sort_by_key(|r| {
        format!(
            "{} {}",
            r.get("last_name").and_then(Value::as_str).unwrap_or(""),
            r.get("first_name").and_then(Value::as_str).unwrap_or("")
        )
        .to_lowercase()
    });

    if let Some(search) = get_optional_str(params, "search") {
        let needle = search.to_lowercase();
        rows.retain(|r| {
            let name = format!(
                "{} {}",
                r.get("first_name").and_then(Value::as_str).unwrap_or(""),
                r.get("last_name").and_then(Value::as_str).unwrap_or("")
            )
            .to_lowercase();
            let dni = r.get("dni").and_then(Value::as_str).unwrap_or("");
            name.contains(&needle) || dni.contains(search.as_str())
        });
    }

    let students: Vec<Value> = rows.iter().map(student_json).collect();
    Ok(json!({ "students": students }))
}

fn students_create(store: &dyn RowStore, params: &Value) -> Result<Value, HandlerErr> {
    let mut row = Row::new();
    let id = Uuid::new_v4().to_string();
    row.insert("id".into(), json!(id.clone()));
    for column in ["last_name", "first_name", "grade", "section"] {
        let v = get_required_str(params, param_key(column))?;
        row.insert(column.into(), json!(v));
    }
    for &column in &EDITABLE[4..] {
        row.insert(
            column.into(),
            match get_optional_str(params, param_key(column)) {
                Some(v) => json!(v),
                None => Value::Null,
            },
        );
    }
    row.insert("status".into(), json!("active"));
    row.insert("created_at".into(), json!(chrono::Utc::now().to_rfc3339()));
    store.insert("students", &[row])?;
    Ok(json!({ "id": id }))
}

fn students_update(store: &dyn RowStore, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let mut patch = Row::new();
    for column in EDITABLE {
        if let Some(v) = params.get(param_key(column)) {
            match v {
                Value::String(s) => {
                    patch.insert(column.into(), json!(s.trim()));
                }
                Value::Null => {
                    patch.insert(column.into(), Value::Null);
                }
                _ => return Err(HandlerErr::bad_params(format!("{column} must be text"))),
            }
        }
    }
    if patch.is_empty() {
        return Err(HandlerErr::bad_params("nothing to update"));
    }
    for column in ["last_name", "first_name", "grade", "section"] {
        if patch.get(column).map(|v| v.is_null()).unwrap_or(false) {
            return Err(HandlerErr::bad_params(format!("{column} is required")));
        }
    }
    let updated = store.update("students", &patch, &[Filter::eq("id", id.as_str())])?;
    if updated == 0 {
        return Err(HandlerErr::not_found("student not found"));
    }
    Ok(json!({ "updated": updated }))
}

fn students_delete(store: &dyn RowStore, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    // Status records reference the student; remove them first.
    store.delete("attendance", &[Filter::eq("student_id", id.as_str())])?;
    store.delete("achievements", &[Filter::eq("student_id", id.as_str())])?;
    let deleted = store.delete("students", &[Filter::eq("id", id.as_str())])?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("student not found"));
    }
    Ok(json!({ "deleted": deleted }))
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
        "students.list" => Some(dispatch(state, req, students_list)),
        "students.create" => Some(dispatch(state, req, students_create)),
        "students.update" => Some(dispatch(state, req, students_update)),
        "students.delete" => Some(dispatch(state, req, students_delete)),
        _ => None,
    }
}
