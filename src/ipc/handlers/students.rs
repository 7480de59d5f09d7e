use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::notify::is_valid_phone;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn now_stamp() -> String {
    chrono::Local::now()
        .naive_local()
        .format("%Y-%m-%dT%H:%M:%S%.3f")
        .to_string()
}

fn new_student_code() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("STUDENT-{}", id[..8].to_ascii_uppercase())
}

fn student_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let student_code: String = row.get(1)?;
    let name: String = row.get(2)?;
    let grade: Option<String> = row.get(3)?;
    let parent_name: String = row.get(4)?;
    let phone: Option<String> = row.get(5)?;
    let photo_url: Option<String> = row.get(6)?;
    Ok(json!({
        "id": id,
        "studentCode": student_code,
        "name": name,
        "grade": grade,
        "parentName": parent_name,
        "phone": phone,
        "photoUrl": photo_url
    }))
}

const STUDENT_COLS: &str = "id, student_code, name, grade, parent_name, phone, photo_url";

fn code_taken(conn: &Connection, code: &str, exclude_id: Option<&str>) -> rusqlite::Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE student_code = ?",
            [code],
            |r| r.get(0),
        )
        .optional()?;
    Ok(match (found, exclude_id) {
        (Some(id), Some(ex)) => id != ex,
        (Some(_), None) => true,
        (None, _) => false,
    })
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    let search = req
        .params
        .get("search")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());
    let grade = req
        .params
        .get("grade")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty());

    let sql = format!(
        "SELECT {} FROM students ORDER BY name COLLATE NOCASE",
        STUDENT_COLS
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], student_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let mut students = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Rosters are small; search and grade filters run in memory over the fetched set.
    if let Some(needle) = search {
        students.retain(|s| {
            ["name", "parentName", "studentCode"].iter().any(|k| {
                s.get(k)
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
        });
    }
    if let Some(g) = grade {
        students.retain(|s| s.get("grade").and_then(|v| v.as_str()) == Some(g.as_str()));
    }

    ok(&req.id, json!({ "students": students }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let parent_name = match req.params.get("parentName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing parentName", None),
    };
    if parent_name.is_empty() {
        return err(&req.id, "bad_params", "parentName must not be empty", None);
    }
    let grade = req
        .params
        .get("grade")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let phone = req
        .params
        .get("phone")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(p) = &phone {
        if !is_valid_phone(p) {
            return err(
                &req.id,
                "invalid_phone",
                format!("phone is not a valid E.164 number: {}", p),
                None,
            );
        }
    }
    let photo_url = req
        .params
        .get("photoUrl")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty());

    let student_code = match req.params.get("studentCode").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => new_student_code(),
    };
    match code_taken(conn, &student_code, None) {
        Ok(true) => {
            return err(
                &req.id,
                "duplicate_code",
                format!("student code already in use: {}", student_code),
                None,
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let student_id = Uuid::new_v4().to_string();
    let stamp = now_stamp();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, student_code, name, grade, parent_name, phone, photo_url, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &student_code,
            &name,
            &grade,
            &parent_name,
            &phone,
            &photo_url,
            &stamp,
            &stamp,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "studentCode": student_code }),
    )
}

fn handle_students_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLS);
    let row = conn
        .query_row(&sql, [&student_id], student_json)
        .optional();
    match row {
        Ok(Some(student)) => ok(&req.id, json!({ "student": student })),
        Ok(None) => err(&req.id, "not_found", "student not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    for (key, value) in patch {
        match key.as_str() {
            "name" => {
                let Some(v) = value.as_str().map(str::trim).filter(|v| !v.is_empty()) else {
                    return err(&req.id, "bad_params", "name must not be empty", None);
                };
                sets.push("name = ?");
                values.push(v.to_string().into());
            }
            "parentName" => {
                let Some(v) = value.as_str().map(str::trim).filter(|v| !v.is_empty()) else {
                    return err(&req.id, "bad_params", "parentName must not be empty", None);
                };
                sets.push("parent_name = ?");
                values.push(v.to_string().into());
            }
            "grade" => {
                sets.push("grade = ?");
                match value.as_str().map(str::trim).filter(|v| !v.is_empty()) {
                    Some(v) => values.push(v.to_string().into()),
                    None => values.push(rusqlite::types::Value::Null),
                }
            }
            "phone" => {
                sets.push("phone = ?");
                match value.as_str().map(str::trim).filter(|v| !v.is_empty()) {
                    Some(v) => {
                        if !is_valid_phone(v) {
                            return err(
                                &req.id,
                                "invalid_phone",
                                format!("phone is not a valid E.164 number: {}", v),
                                None,
                            );
                        }
                        values.push(v.to_string().into());
                    }
                    None => values.push(rusqlite::types::Value::Null),
                }
            }
            "photoUrl" => {
                sets.push("photo_url = ?");
                match value.as_str().filter(|v| !v.is_empty()) {
                    Some(v) => values.push(v.to_string().into()),
                    None => values.push(rusqlite::types::Value::Null),
                }
            }
            "studentCode" => {
                let Some(v) = value.as_str().map(str::trim).filter(|v| !v.is_empty()) else {
                    return err(&req.id, "bad_params", "studentCode must not be empty", None);
                };
                match code_taken(conn, v, Some(&student_id)) {
                    Ok(true) => {
                        return err(
                            &req.id,
                            "duplicate_code",
                            format!("student code already in use: {}", v),
                            None,
                        )
                    }
                    Ok(false) => {}
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                }
                sets.push("student_code = ?");
                values.push(v.to_string().into());
            }
            other => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown patch field: {}", other),
                    None,
                )
            }
        }
    }
    if sets.is_empty() {
        return err(&req.id, "bad_params", "patch must not be empty", None);
    }

    sets.push("updated_at = ?");
    values.push(now_stamp().into());
    values.push(student_id.clone().into());
    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(values)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

// Whatever the printable QR should carry: the scan token plus the fields the
// card shows next to it.
fn handle_students_qr_payload(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let row = conn
        .query_row(
            "SELECT student_code, name, grade, photo_url FROM students WHERE id = ?",
            [&student_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional();
    match row {
        Ok(Some((code, name, grade, photo_url))) => ok(
            &req.id,
            json!({
                "payload": code,
                "name": name,
                "grade": grade,
                "photoUrl": photo_url
            }),
        ),
        Ok(None) => err(&req.id, "not_found", "student not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.qrPayload" => Some(handle_students_qr_payload(state, req)),
        _ => None,
    }
}
