use std::path::PathBuf;

use crate::grid::GridSession;
use crate::store::SqliteStore;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub store: Option<SqliteStore>,
    /// The one open cohort grid. Owned here, not by any UI layer, so the
    /// grid operations stay plain functions over explicit state.
    pub grid: Option<GridSession>,
}

impl AppState {
    pub fn new() -> Self {
        AppState {
            workspace: None,
            store: None,
            grid: None,
        }
    }
}
