use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::stats;
use chrono::{Datelike, NaiveDate};
use rusqlite::Connection;
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, None)
    }
}

fn parse_date(params: &serde_json::Value) -> Result<NaiveDate, HandlerErr> {
    let raw = params
        .get("date")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing date".to_string(),
        })?;
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "bad_params",
        message: "date must be YYYY-MM-DD".to_string(),
    })
}

fn total_students(conn: &Connection) -> Result<usize, HandlerErr> {
    conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get::<_, i64>(0))
        .map(|n| n.max(0) as usize)
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
        })
}

fn attendee_ids_for_day(conn: &Connection, date: NaiveDate) -> Result<Vec<String>, HandlerErr> {
    let (start, end) = stats::day_bounds(date);
    let mut stmt = conn
        .prepare(
            "SELECT student_id FROM attendance
             WHERE check_in_time >= ? AND check_in_time < ?",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
        })?;
    stmt.query_map((&start, &end), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
        })
}

fn stats_daily(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let date = parse_date(params)?;
    let total = total_students(conn)?;
    let ids = attendee_ids_for_day(conn, date)?;
    let summary = stats::presence_summary(total, ids.iter().map(String::as_str));
    Ok(json!({
        "date": date.format("%Y-%m-%d").to_string(),
        "present": summary.present,
        "absent": summary.absent,
        "total": summary.total
    }))
}

fn stats_weekly(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let date = parse_date(params)?;
    let total = total_students(conn)?;

    let mut days = Vec::with_capacity(5);
    for day in stats::school_week(date) {
        let ids = attendee_ids_for_day(conn, day)?;
        let summary = stats::presence_summary(total, ids.iter().map(String::as_str));
        days.push(json!({
            "date": day.format("%Y-%m-%d").to_string(),
            "day": stats::day_label(day.weekday()),
            "present": summary.present,
            "absent": summary.absent
        }));
    }

    Ok(json!({ "days": days, "total": total }))
}

fn stats_grade_distribution(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT grade FROM students")
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
        })?;
    let grades = stmt
        .query_map([], |r| r.get::<_, Option<String>>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
        })?;

    let dist = stats::grade_distribution(grades.iter().map(Option::as_deref));
    let buckets: Vec<serde_json::Value> = dist
        .into_iter()
        .map(|(grade, count)| json!({ "grade": grade, "count": count }))
        .collect();
    Ok(json!({ "grades": buckets }))
}

fn handle_stats_daily(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match stats_daily(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_stats_weekly(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match stats_weekly(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_stats_grade_distribution(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match stats_grade_distribution(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "stats.daily" => Some(handle_stats_daily(state, req)),
        "stats.weekly" => Some(handle_stats_weekly(state, req)),
        "stats.gradeDistribution" => Some(handle_stats_grade_distribution(state, req)),
        _ => None,
    }
}
