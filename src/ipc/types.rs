use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::scan::ScanCycle;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    // One capture device per daemon process; the cycle lives here rather
    // than in any global.
    pub scan: ScanCycle,
}
