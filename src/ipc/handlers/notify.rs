use crate::ipc::error::{err, ok};
use crate::ipc::handlers::attendance::{now_check_in, CHECK_IN_FORMAT};
use crate::ipc::handlers::settings;
use crate::ipc::types::{AppState, Request};
use crate::notify;
use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, None)
    }
}

fn notify_compose(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = params
        .get("studentId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing studentId".to_string(),
        })?;

    let row = conn
        .query_row(
            "SELECT name, parent_name, phone FROM students WHERE id = ?",
            [student_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
        })?;
    let Some((name, parent_name, phone)) = row else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
        });
    };

    // Validation gate: nothing is composed or logged for a bad phone.
    let phone = phone.filter(|p| notify::is_valid_phone(p)).ok_or_else(|| HandlerErr {
        code: "invalid_phone",
        message: format!("student has no valid E.164 phone: {}", name),
    })?;

    let check_in_time = match params.get("checkInTime").and_then(|v| v.as_str()) {
        Some(raw) => {
            let t = raw.trim();
            NaiveDateTime::parse_from_str(t, CHECK_IN_FORMAT)
                .or_else(|_| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S"))
                .map_err(|_| HandlerErr {
                    code: "bad_params",
                    message: "checkInTime must be YYYY-MM-DDTHH:MM:SS[.mmm]".to_string(),
                })?
        }
        None => NaiveDateTime::parse_from_str(&now_check_in(), CHECK_IN_FORMAT).map_err(|e| {
            HandlerErr {
                code: "bad_params",
                message: e.to_string(),
            }
        })?,
    };

    let cfg = settings::notification_settings(conn).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
    })?;
    let signature = cfg
        .get("signature")
        .and_then(|v| v.as_str())
        .unwrap_or(notify::DEFAULT_SIGNATURE);
    let message = notify::compose_message(&name, &parent_name, check_in_time, signature);
    let link = notify::deep_link(&phone, &message);

    let log = params
        .get("log")
        .and_then(|v| v.as_bool())
        .or_else(|| cfg.get("logNotifications").and_then(|v| v.as_bool()))
        .unwrap_or(true);
    let mut notification_id = None;
    if log {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO notifications(id, student_id, message, sent_at, status)
             VALUES(?, ?, ?, ?, 'pending')",
            (
                &id,
                &student_id,
                &message,
                check_in_time.format(CHECK_IN_FORMAT).to_string(),
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
        })?;
        notification_id = Some(id);
    }

    // "pending" is as far as this system can see; the external app owns the
    // actual send.
    Ok(json!({
        "message": message,
        "link": link,
        "phone": phone,
        "status": "pending",
        "notificationId": notification_id
    }))
}

fn notify_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let limit = params
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(50)
        .min(500) as i64;
    let student_id = params
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        let id: String = r.get(0)?;
        let student_id: String = r.get(1)?;
        let message: String = r.get(2)?;
        let sent_at: String = r.get(3)?;
        let status: String = r.get(4)?;
        let name: String = r.get(5)?;
        Ok(json!({
            "id": id,
            "studentId": student_id,
            "message": message,
            "sentAt": sent_at,
            "status": status,
            "studentName": name
        }))
    };

    let notifications = if let Some(sid) = student_id {
        let mut stmt = conn
            .prepare(
                "SELECT n.id, n.student_id, n.message, n.sent_at, n.status, s.name
                 FROM notifications n
                 JOIN students s ON s.id = n.student_id
                 WHERE n.student_id = ?
                 ORDER BY n.sent_at DESC
                 LIMIT ?",
            )
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
            })?;
        stmt.query_map((&sid, limit), map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    } else {
        let mut stmt = conn
            .prepare(
                "SELECT n.id, n.student_id, n.message, n.sent_at, n.status, s.name
                 FROM notifications n
                 JOIN students s ON s.id = n.student_id
                 ORDER BY n.sent_at DESC
                 LIMIT ?",
            )
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
            })?;
        stmt.query_map([limit], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    }
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
    })?;

    Ok(json!({ "notifications": notifications }))
}

fn handle_notify_compose(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match notify_compose(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_notify_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match notify_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notify.compose" => Some(handle_notify_compose(state, req)),
        "notify.list" => Some(handle_notify_list(state, req)),
        _ => None,
    }
}
