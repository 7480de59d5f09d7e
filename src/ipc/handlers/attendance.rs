use crate::ipc::error::{err, ok};
use crate::ipc::handlers::settings;
use crate::ipc::types::{AppState, Request};
use crate::stats;
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const CHECK_IN_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn parse_date(raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "bad_params",
        message: "date must be YYYY-MM-DD".to_string(),
        details: None,
    })
}

pub fn now_check_in() -> String {
    chrono::Local::now()
        .naive_local()
        .format(CHECK_IN_FORMAT)
        .to_string()
}

fn parse_check_in(raw: &str) -> Result<String, HandlerErr> {
    let t = raw.trim();
    let parsed = NaiveDateTime::parse_from_str(t, CHECK_IN_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S"));
    match parsed {
        Ok(ts) => Ok(ts.format(CHECK_IN_FORMAT).to_string()),
        Err(_) => Err(HandlerErr {
            code: "bad_params",
            message: "checkInTime must be YYYY-MM-DDTHH:MM:SS[.mmm]".to_string(),
            details: None,
        }),
    }
}

pub enum CheckInOutcome {
    Inserted { attendance_id: String },
    AlreadyRecorded { attendance_id: String },
}

/// Append one attendance row, honoring the workspace duplicate policy.
/// Under "oncePerDay" an existing row within the check-in's local day wins
/// and no new row is written. Resolve and insert stay separate statements;
/// a cross-device race on the same student is an accepted gap.
pub fn record_check_in(
    conn: &Connection,
    student_id: &str,
    check_in_time: &str,
    duplicate_policy: &str,
) -> Result<CheckInOutcome, rusqlite::Error> {
    if duplicate_policy == "oncePerDay" {
        let day = &check_in_time[..10.min(check_in_time.len())];
        let (start, end) = stats::day_bounds(
            NaiveDate::parse_from_str(day, "%Y-%m-%d").unwrap_or_else(|_| {
                chrono::Local::now().date_naive()
            }),
        );
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM attendance
                 WHERE student_id = ? AND check_in_time >= ? AND check_in_time < ?
                 ORDER BY check_in_time LIMIT 1",
                (student_id, &start, &end),
                |r| r.get(0),
            )
            .optional()?;
        if let Some(attendance_id) = existing {
            return Ok(CheckInOutcome::AlreadyRecorded { attendance_id });
        }
    }

    let attendance_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attendance(id, student_id, check_in_time) VALUES(?, ?, ?)",
        (&attendance_id, student_id, check_in_time),
    )?;
    Ok(CheckInOutcome::Inserted { attendance_id })
}

fn attendance_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let check_in_time = match params.get("checkInTime").and_then(|v| v.as_str()) {
        Some(raw) => parse_check_in(raw)?,
        None => now_check_in(),
    };

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let policy = settings::scan_settings(conn)
        .ok()
        .and_then(|s| {
            s.get("duplicatePolicy")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string())
        })
        .unwrap_or_else(|| "allow".to_string());

    match record_check_in(conn, &student_id, &check_in_time, &policy) {
        Ok(CheckInOutcome::Inserted { attendance_id }) => Ok(json!({
            "attendanceId": attendance_id,
            "checkInTime": check_in_time,
            "alreadyRecorded": false
        })),
        Ok(CheckInOutcome::AlreadyRecorded { attendance_id }) => Ok(json!({
            "attendanceId": attendance_id,
            "checkInTime": check_in_time,
            "alreadyRecorded": true
        })),
        Err(e) => Err(HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance" })),
        }),
    }
}

fn attendance_day_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date_raw = get_required_str(params, "date")?;
    let date = parse_date(&date_raw)?;
    let (start, end) = stats::day_bounds(date);

    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.student_id, a.check_in_time,
                    s.student_code, s.name, s.grade
             FROM attendance a
             JOIN students s ON s.id = a.student_id
             WHERE a.check_in_time >= ? AND a.check_in_time < ?
             ORDER BY a.check_in_time",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let records = stmt
        .query_map((&start, &end), |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let check_in_time: String = r.get(2)?;
            let student_code: String = r.get(3)?;
            let name: String = r.get(4)?;
            let grade: Option<String> = r.get(5)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "checkInTime": check_in_time,
                "studentCode": student_code,
                "name": name,
                "grade": grade
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let total: i64 = conn
        .query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let attendee_ids: Vec<String> = records
        .iter()
        .filter_map(|r| r.get("studentId").and_then(|v| v.as_str()).map(String::from))
        .collect();
    let summary = stats::presence_summary(
        total.max(0) as usize,
        attendee_ids.iter().map(String::as_str),
    );

    Ok(json!({
        "date": date_raw.trim(),
        "records": records,
        "summary": {
            "present": summary.present,
            "absent": summary.absent,
            "total": summary.total
        }
    }))
}

fn attendance_recent(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let limit = params
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(10)
        .min(200) as i64;

    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.student_id, a.check_in_time,
                    s.student_code, s.name, s.grade
             FROM attendance a
             JOIN students s ON s.id = a.student_id
             ORDER BY a.check_in_time DESC
             LIMIT ?",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let records = stmt
        .query_map([limit], |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let check_in_time: String = r.get(2)?;
            let student_code: String = r.get(3)?;
            let name: String = r.get(4)?;
            let grade: Option<String> = r.get(5)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "checkInTime": check_in_time,
                "studentCode": student_code,
                "name": name,
                "grade": grade
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "records": records }))
}

fn handle_attendance_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_record(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_day_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_day_open(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_recent(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_recent(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.record" => Some(handle_attendance_record(state, req)),
        "attendance.dayOpen" => Some(handle_attendance_day_open(state, req)),
        "attendance.recent" => Some(handle_attendance_recent(state, req)),
        _ => None,
    }
}
