use crate::ipc::error::{err, ok};
use crate::ipc::handlers::attendance::{now_check_in, record_check_in, CheckInOutcome, CHECK_IN_FORMAT};
use crate::ipc::handlers::settings;
use crate::ipc::types::{AppState, Request};
use crate::notify;
use crate::scan::ScanState;
use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct ResolvedStudent {
    id: String,
    student_code: String,
    name: String,
    grade: Option<String>,
    parent_name: String,
    phone: Option<String>,
}

/// Identity resolver: equality lookup of the scanned token against
/// student_code. The UNIQUE constraint keeps this at most one row.
fn resolve_student(conn: &Connection, code: &str) -> rusqlite::Result<Option<ResolvedStudent>> {
    conn.query_row(
        "SELECT id, student_code, name, grade, parent_name, phone
         FROM students WHERE student_code = ?",
        [code],
        |r| {
            Ok(ResolvedStudent {
                id: r.get(0)?,
                student_code: r.get(1)?,
                name: r.get(2)?,
                grade: r.get(3)?,
                parent_name: r.get(4)?,
                phone: r.get(5)?,
            })
        },
    )
    .optional()
}

fn student_json(s: &ResolvedStudent) -> serde_json::Value {
    json!({
        "id": s.id,
        "studentCode": s.student_code,
        "name": s.name,
        "grade": s.grade,
        "parentName": s.parent_name,
        "phone": s.phone
    })
}

/// Best-effort auto-notification after a recorded scan. A missing or
/// invalid phone (or a failed log insert) never fails the scan itself.
fn auto_notify(
    conn: &Connection,
    student: &ResolvedStudent,
    check_in_time: &str,
) -> Option<serde_json::Value> {
    let cfg = settings::notification_settings(conn).ok()?;
    if cfg.get("autoNotify").and_then(|v| v.as_bool()) != Some(true) {
        return None;
    }
    let phone = student.phone.as_deref()?;
    if !notify::is_valid_phone(phone) {
        return None;
    }
    let ts = NaiveDateTime::parse_from_str(check_in_time, CHECK_IN_FORMAT).ok()?;
    let signature = cfg
        .get("signature")
        .and_then(|v| v.as_str())
        .unwrap_or(notify::DEFAULT_SIGNATURE);
    let message = notify::compose_message(&student.name, &student.parent_name, ts, signature);
    let link = notify::deep_link(phone, &message);

    let mut notification_id = None;
    if cfg.get("logNotifications").and_then(|v| v.as_bool()) == Some(true) {
        let id = Uuid::new_v4().to_string();
        let logged = conn.execute(
            "INSERT INTO notifications(id, student_id, message, sent_at, status)
             VALUES(?, ?, ?, ?, 'pending')",
            (&id, &student.id, &message, check_in_time),
        );
        if logged.is_ok() {
            notification_id = Some(id);
        }
    }

    Some(json!({
        "message": message,
        "link": link,
        "phone": phone,
        "status": "pending",
        "notificationId": notification_id
    }))
}

fn handle_scan_start(state: &mut AppState, req: &Request) -> serde_json::Value {
    if !state.scan.start() {
        return err(
            &req.id,
            "scan_busy",
            "a scan cycle is already in flight",
            None,
        );
    }
    ok(&req.id, json!({ "state": state.scan.state().as_str() }))
}

fn handle_scan_capture(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(code) = req.params.get("code").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing code", None);
    };
    let code = code.trim();
    if code.is_empty() {
        return err(&req.id, "bad_params", "code must not be empty", None);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    // First capture wins; the rest of an active cycle is ignored.
    if !state.scan.capture(code) {
        return ok(
            &req.id,
            json!({
                "accepted": false,
                "state": state.scan.state().as_str()
            }),
        );
    }

    let student = match resolve_student(conn, code) {
        Ok(v) => v,
        Err(e) => {
            state.scan.finish(ScanState::Error);
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    };
    let Some(student) = student else {
        state.scan.finish(ScanState::NotFound);
        return ok(
            &req.id,
            json!({
                "accepted": true,
                "state": ScanState::NotFound.as_str(),
                "code": code
            }),
        );
    };

    let policy = settings::scan_settings(conn)
        .ok()
        .and_then(|s| {
            s.get("duplicatePolicy")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string())
        })
        .unwrap_or_else(|| "allow".to_string());

    let check_in_time = now_check_in();
    let (attendance_id, already_recorded) =
        match record_check_in(conn, &student.id, &check_in_time, &policy) {
            Ok(CheckInOutcome::Inserted { attendance_id }) => (attendance_id, false),
            Ok(CheckInOutcome::AlreadyRecorded { attendance_id }) => (attendance_id, true),
            Err(e) => {
                state.scan.finish(ScanState::Error);
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "attendance" })),
                );
            }
        };

    let notification = auto_notify(conn, &student, &check_in_time);
    state.scan.finish(ScanState::Recorded);

    ok(
        &req.id,
        json!({
            "accepted": true,
            "state": ScanState::Recorded.as_str(),
            "attendanceId": attendance_id,
            "checkInTime": check_in_time,
            "alreadyRecorded": already_recorded,
            "student": student_json(&student),
            "notification": notification
        }),
    )
}

fn handle_scan_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    // The UI owns the auto-reset timer; it reads the delay from here.
    let auto_reset_seconds = state
        .db
        .as_ref()
        .and_then(|conn| settings::scan_settings(conn).ok())
        .and_then(|s| s.get("autoResetSeconds").and_then(|v| v.as_u64()))
        .unwrap_or(0);

    ok(
        &req.id,
        json!({
            "state": state.scan.state().as_str(),
            "autoResetSeconds": auto_reset_seconds
        }),
    )
}

fn handle_scan_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.scan.reset();
    ok(&req.id, json!({ "state": state.scan.state().as_str() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scan.start" => Some(handle_scan_start(state, req)),
        "scan.capture" => Some(handle_scan_capture(state, req)),
        "scan.status" => Some(handle_scan_status(state, req)),
        "scan.reset" => Some(handle_scan_reset(state, req)),
        _ => None,
    }
}
