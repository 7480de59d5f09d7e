use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::notify::DEFAULT_SIGNATURE;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SettingsSection {
    Scan,
    Notifications,
}

impl SettingsSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "scan" => Some(Self::Scan),
            "notifications" => Some(Self::Notifications),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Scan => "settings.scan",
            Self::Notifications => "settings.notifications",
        }
    }
}

fn default_section(section: SettingsSection) -> Value {
    match section {
        SettingsSection::Scan => json!({
            // "allow": every scan appends a row.
            // "oncePerDay" makes recording idempotent per student per day.
            "duplicatePolicy": "allow",
            "autoResetSeconds": 0
        }),
        SettingsSection::Notifications => json!({
            "autoNotify": false,
            "logNotifications": true,
            "signature": DEFAULT_SIGNATURE
        }),
    }
}

fn merge_section_patch(
    section: SettingsSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal settings object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SettingsSection::Scan => match k.as_str() {
                "duplicatePolicy" => {
                    let Some(s) = v.as_str() else {
                        return Err("duplicatePolicy must be a string".to_string());
                    };
                    if s != "allow" && s != "oncePerDay" {
                        return Err(format!("unknown duplicatePolicy: {}", s));
                    }
                    obj.insert(k.clone(), v.clone());
                }
                "autoResetSeconds" => {
                    let Some(n) = v.as_u64() else {
                        return Err("autoResetSeconds must be a non-negative integer".to_string());
                    };
                    if n > 3600 {
                        return Err("autoResetSeconds must be at most 3600".to_string());
                    }
                    obj.insert(k.clone(), v.clone());
                }
                _ => return Err(format!("unknown scan field: {}", k)),
            },
            SettingsSection::Notifications => match k.as_str() {
                "autoNotify" | "logNotifications" => {
                    if !v.is_boolean() {
                        return Err(format!("{} must be a boolean", k));
                    }
                    obj.insert(k.clone(), v.clone());
                }
                "signature" => {
                    let Some(s) = v.as_str() else {
                        return Err("signature must be a string".to_string());
                    };
                    if s.trim().is_empty() {
                        return Err("signature must not be empty".to_string());
                    }
                    obj.insert(k.clone(), v.clone());
                }
                _ => return Err(format!("unknown notifications field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SettingsSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values should not block the UI.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

/// Handlers elsewhere read the effective policy through these.
pub fn scan_settings(conn: &rusqlite::Connection) -> anyhow::Result<Value> {
    load_section(conn, SettingsSection::Scan)
}

pub fn notification_settings(conn: &rusqlite::Connection) -> anyhow::Result<Value> {
    load_section(conn, SettingsSection::Notifications)
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let scan = match load_section(conn, SettingsSection::Scan) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let notifications = match load_section(conn, SettingsSection::Notifications) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "scan": scan,
            "notifications": notifications
        }),
    )
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SettingsSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        _ => None,
    }
}
