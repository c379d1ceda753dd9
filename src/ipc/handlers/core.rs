use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::{RowStore, SqliteStore};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            state.workspace = Some(path.clone());
            state.store = Some(SqliteStore::new(conn));
            // Any open grid belonged to the previous workspace.
            state.grid = None;
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

/// Connectivity probe. A missing probe table or an empty result still
/// proves the store answered, so both count as alive.
fn handle_store_ping(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match store.select("_keep_alive_activity", &[], None) {
        Ok(_) => ok(&req.id, json!({ "alive": true })),
        Err(e) if e.is_benign() => {
            tracing::debug!(reason = %e, "ping answered with a benign store code");
            ok(&req.id, json!({ "alive": true }))
        }
        Err(e) => err(&req.id, "store_error", e.message, None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "store.ping" => Some(handle_store_ping(state, req)),
        _ => None,
    }
}
