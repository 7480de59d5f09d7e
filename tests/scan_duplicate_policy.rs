use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_qrassistd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn qrassistd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn allow_policy_appends_a_row_per_check_in() {
    let workspace = temp_dir("qrassist-policy-allow");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "name": "Luis Rodríguez", "parentName": "Pedro Rodríguez" }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    // Entry and exit scans on the same day.
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.record",
        json!({ "studentId": student_id, "checkInTime": "2024-05-03T07:55:00" }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.record",
        json!({ "studentId": student_id, "checkInTime": "2024-05-03T13:05:00" }),
    );
    assert_eq!(
        first.get("alreadyRecorded").and_then(|v| v.as_bool()),
        Some(false)
    );
    assert_eq!(
        second.get("alreadyRecorded").and_then(|v| v.as_bool()),
        Some(false)
    );
    assert_ne!(
        first.get("attendanceId").and_then(|v| v.as_str()),
        second.get("attendanceId").and_then(|v| v.as_str())
    );

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.dayOpen",
        json!({ "date": "2024-05-03" }),
    );
    let records = opened.get("records").and_then(|v| v.as_array()).expect("records");
    assert_eq!(records.len(), 2);
    // The summary still counts the student once.
    assert_eq!(
        opened
            .get("summary")
            .and_then(|s| s.get("present"))
            .and_then(|v| v.as_u64()),
        Some(1)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn once_per_day_policy_short_circuits_repeat_check_ins() {
    let workspace = temp_dir("qrassist-policy-once");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "settings.update",
        json!({ "section": "scan", "patch": { "duplicatePolicy": "oncePerDay" } }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "name": "Ana Martínez", "parentName": "Laura Martínez" }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.record",
        json!({ "studentId": student_id, "checkInTime": "2024-05-03T07:55:00" }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.record",
        json!({ "studentId": student_id, "checkInTime": "2024-05-03T13:05:00" }),
    );
    assert_eq!(
        first.get("alreadyRecorded").and_then(|v| v.as_bool()),
        Some(false)
    );
    assert_eq!(
        second.get("alreadyRecorded").and_then(|v| v.as_bool()),
        Some(true)
    );
    // The repeat answers with the existing row's id.
    assert_eq!(
        first.get("attendanceId").and_then(|v| v.as_str()),
        second.get("attendanceId").and_then(|v| v.as_str())
    );

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.dayOpen",
        json!({ "date": "2024-05-03" }),
    );
    let records = opened.get("records").and_then(|v| v.as_array()).expect("records");
    assert_eq!(records.len(), 1, "oncePerDay keeps a single row");

    // A different day still records.
    let next_day = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.record",
        json!({ "studentId": student_id, "checkInTime": "2024-05-06T08:02:00" }),
    );
    assert_eq!(
        next_day.get("alreadyRecorded").and_then(|v| v.as_bool()),
        Some(false)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn settings_update_rejects_unknown_policy() {
    let workspace = temp_dir("qrassist-policy-bad");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let payload = json!({
        "id": "2",
        "method": "settings.update",
        "params": { "section": "scan", "patch": { "duplicatePolicy": "sometimes" } },
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bad_params")
    );

    // The stored policy is untouched.
    let settings = request_ok(&mut stdin, &mut reader, "3", "settings.get", json!({}));
    assert_eq!(
        settings
            .get("scan")
            .and_then(|s| s.get("duplicatePolicy"))
            .and_then(|v| v.as_str()),
        Some("allow")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
