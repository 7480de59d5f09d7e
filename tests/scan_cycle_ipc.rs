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

fn day_records(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    date: &str,
) -> Vec<serde_json::Value> {
    let opened = request_ok(
        stdin,
        reader,
        id,
        "attendance.dayOpen",
        json!({ "date": date }),
    );
    opened
        .get("records")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("records array")
}

#[test]
fn valid_code_records_exactly_one_row() {
    let workspace = temp_dir("qrassist-scan-valid");
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
        json!({
            "name": "Carlos Pérez",
            "parentName": "Juan Pérez",
            "grade": "9no A",
            "phone": "+584141234567",
            "studentCode": "STUDENT-123"
        }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let scan_start = chrono::Local::now()
        .naive_local()
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string();

    request_ok(&mut stdin, &mut reader, "3", "scan.start", json!({}));
    let captured = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "scan.capture",
        json!({ "code": "STUDENT-123" }),
    );
    assert_eq!(captured.get("accepted").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        captured.get("state").and_then(|v| v.as_str()),
        Some("recorded")
    );
    assert_eq!(
        captured
            .get("student")
            .and_then(|s| s.get("id"))
            .and_then(|v| v.as_str()),
        Some(student_id.as_str())
    );
    let check_in = captured
        .get("checkInTime")
        .and_then(|v| v.as_str())
        .expect("checkInTime")
        .to_string();
    // Both sides are local-naive ISO strings of the same clock.
    assert!(
        check_in.as_str() >= scan_start.as_str(),
        "check-in {} predates scan start {}",
        check_in,
        scan_start
    );

    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    let records = day_records(&mut stdin, &mut reader, "5", &today);
    assert_eq!(records.len(), 1, "exactly one attendance row expected");
    assert_eq!(
        records[0].get("studentId").and_then(|v| v.as_str()),
        Some(student_id.as_str())
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_code_is_not_found_and_writes_nothing() {
    let workspace = temp_dir("qrassist-scan-unknown");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(&mut stdin, &mut reader, "2", "scan.start", json!({}));
    let captured = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "scan.capture",
        json!({ "code": "STUDENT-NOPE" }),
    );
    assert_eq!(captured.get("accepted").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        captured.get("state").and_then(|v| v.as_str()),
        Some("notFound")
    );
    assert!(captured.get("attendanceId").is_none());

    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    let records = day_records(&mut stdin, &mut reader, "4", &today);
    assert!(records.is_empty(), "no attendance row for unknown code");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn second_capture_in_one_cycle_is_ignored() {
    let workspace = temp_dir("qrassist-scan-rapid");
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
        "students.create",
        json!({
            "name": "María Gómez",
            "parentName": "Ana Gómez",
            "studentCode": "STUDENT-456"
        }),
    );

    request_ok(&mut stdin, &mut reader, "3", "scan.start", json!({}));
    // Continuous capture fires twice for the same physical code.
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "scan.capture",
        json!({ "code": "STUDENT-456" }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "scan.capture",
        json!({ "code": "STUDENT-456" }),
    );
    assert_eq!(first.get("accepted").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(first.get("state").and_then(|v| v.as_str()), Some("recorded"));
    assert_eq!(second.get("accepted").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        second.get("state").and_then(|v| v.as_str()),
        Some("recorded")
    );

    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    let records = day_records(&mut stdin, &mut reader, "6", &today);
    assert_eq!(records.len(), 1, "one Recorded transition per cycle");

    // A fresh cycle accepts again.
    request_ok(&mut stdin, &mut reader, "7", "scan.start", json!({}));
    let third = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "scan.capture",
        json!({ "code": "STUDENT-456" }),
    );
    assert_eq!(third.get("accepted").and_then(|v| v.as_bool()), Some(true));
    let records = day_records(&mut stdin, &mut reader, "9", &today);
    assert_eq!(records.len(), 2, "default policy keeps duplicate rows");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn scan_status_reports_cycle_state() {
    let workspace = temp_dir("qrassist-scan-status");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let idle = request_ok(&mut stdin, &mut reader, "2", "scan.status", json!({}));
    assert_eq!(idle.get("state").and_then(|v| v.as_str()), Some("idle"));

    request_ok(&mut stdin, &mut reader, "3", "scan.start", json!({}));
    let scanning = request_ok(&mut stdin, &mut reader, "4", "scan.status", json!({}));
    assert_eq!(
        scanning.get("state").and_then(|v| v.as_str()),
        Some("scanning")
    );

    request_ok(&mut stdin, &mut reader, "5", "scan.reset", json!({}));
    let reset = request_ok(&mut stdin, &mut reader, "6", "scan.status", json!({}));
    assert_eq!(reset.get("state").and_then(|v| v.as_str()), Some("idle"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
