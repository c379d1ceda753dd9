use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::{Filter, Row, RowStore};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| HandlerErr::missing(key))
}

fn password_digest(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

fn unauthorized() -> HandlerErr {
    HandlerErr {
        code: "unauthorized",
        message: "invalid credentials".to_string(),
        details: None,
    }
}

fn sign_up(store: &dyn RowStore, params: &Value) -> Result<Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let password = get_required_str(params, "password")?;

    let existing = store.select(
        "users",
        &[Filter::eq("username", username.as_str())],
        None,
    )?;
    if !existing.is_empty() {
        return Err(HandlerErr {
            code: "conflict",
            message: "username already registered".to_string(),
            details: None,
        });
    }

    let id = Uuid::new_v4().to_string();
    let mut row = Row::new();
    row.insert("id".into(), json!(id));
    row.insert("username".into(), json!(username));
    row.insert("password_digest".into(), json!(password_digest(&password)));
    row.insert("created_at".into(), json!(chrono::Utc::now().to_rfc3339()));
    store.insert("users", &[row])?;
    Ok(json!({ "userId": id }))
}

fn sign_in(store: &dyn RowStore, params: &Value) -> Result<Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let password = get_required_str(params, "password")?;

    let users = store.select(
        "users",
        &[Filter::eq("username", username.as_str())],
        None,
    )?;
    let Some(user) = users.first() else {
        return Err(unauthorized());
    };
    let stored = user
        .get("password_digest")
        .and_then(Value::as_str)
        .unwrap_or("");
    if stored != password_digest(&password) {
        return Err(unauthorized());
    }
    let user_id = user.get("id").and_then(Value::as_str).unwrap_or("");

    let token = Uuid::new_v4().to_string();
    let mut row = Row::new();
    row.insert("token".into(), json!(token));
    row.insert("user_id".into(), json!(user_id));
    row.insert("created_at".into(), json!(chrono::Utc::now().to_rfc3339()));
    store.insert("sessions", &[row])?;
    Ok(json!({ "token": token, "userId": user_id }))
}

fn session(store: &dyn RowStore, params: &Value) -> Result<Value, HandlerErr> {
    let token = get_required_str(params, "token")?;
    let sessions = store.select("sessions", &[Filter::eq("token", token.as_str())], None)?;
    let Some(sess) = sessions.first() else {
        return Err(unauthorized());
    };
    let user_id = sess.get("user_id").and_then(Value::as_str).unwrap_or("");
    let users = store.select("users", &[Filter::eq("id", user_id)], None)?;
    let Some(user) = users.first() else {
        return Err(unauthorized());
    };
    Ok(json!({
        "userId": user_id,
        "username": user.get("username").cloned().unwrap_or(Value::Null),
    }))
}

fn sign_out(store: &dyn RowStore, params: &Value) -> Result<Value, HandlerErr> {
    let token = get_required_str(params, "token")?;
    let deleted = store.delete("sessions", &[Filter::eq("token", token.as_str())])?;
    Ok(json!({ "signedOut": deleted > 0 }))
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
        "auth.signUp" => Some(dispatch(state, req, sign_up)),
        "auth.signIn" => Some(dispatch(state, req, sign_in)),
        "auth.session" => Some(dispatch(state, req, session)),
        "auth.signOut" => Some(dispatch(state, req, sign_out)),
        _ => None,
    }
}
