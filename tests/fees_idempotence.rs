use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

const FIXED_NOW: &str = "2025-03-14T09:30:00";

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

fn spawn_sidecar_at(now: &str) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_coachd");
    let mut child = Command::new(exe)
        .env("COACHD_FIXED_NOW", now)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn coachd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn str_list(value: &serde_json::Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

struct Center {
    admin_id: String,
    batch_id: String,
}

fn setup_center(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, ws: &PathBuf) -> Center {
    let _ = request_ok(
        stdin,
        reader,
        "setup-ws",
        "workspace.select",
        json!({ "path": ws.to_string_lossy() }),
    );
    let registered = request_ok(
        stdin,
        reader,
        "setup-admin",
        "admins.register",
        json!({ "email": "owner@center.test", "passwordHash": "hash", "name": "Owner" }),
    );
    let admin_id = registered
        .get("adminId")
        .and_then(|v| v.as_str())
        .expect("adminId")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        "setup-verify",
        "admins.verify",
        json!({ "adminId": admin_id }),
    );
    let batch = request_ok(
        stdin,
        reader,
        "setup-batch",
        "batches.create",
        json!({ "adminId": admin_id, "batchName": "Morning", "timing": "9am", "fee": 500 }),
    );
    let batch_id = batch
        .get("batchId")
        .and_then(|v| v.as_str())
        .expect("batchId")
        .to_string();
    Center { admin_id, batch_id }
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    center: &Center,
    name: &str,
) -> String {
    request_ok(
        stdin,
        reader,
        &format!("student-{}", name),
        "students.create",
        json!({
            "adminId": center.admin_id,
            "batchId": center.batch_id,
            "name": name,
            "fatherName": "Father",
            "phone": "9123456780",
            "aadharNumber": "1234-5678-9012"
        }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string()
}

fn fee_records(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    center: &Center,
    student_id: &str,
) -> Vec<serde_json::Value> {
    request_ok(
        stdin,
        reader,
        "student-get",
        "students.get",
        json!({ "adminId": center.admin_id, "studentId": student_id }),
    )
    .get("fee")
    .and_then(|v| v.as_array())
    .cloned()
    .unwrap_or_default()
}

#[test]
fn duplicate_month_payment_is_a_conflict() {
    let workspace = temp_dir("coachd-fees-single");
    let (mut child, mut stdin, mut reader) = spawn_sidecar_at(FIXED_NOW);
    let center = setup_center(&mut stdin, &mut reader, &workspace);
    let s = create_student(&mut stdin, &mut reader, &center, "ravi");

    let paid = request_ok(
        &mut stdin,
        &mut reader,
        "pay-1",
        "fees.pay",
        json!({
            "adminId": center.admin_id,
            "studentId": s,
            "batchId": center.batch_id,
            "month": "March 2025"
        }),
    );
    let record = paid.get("feeRecord").expect("feeRecord");
    assert_eq!(record.get("amount").and_then(|v| v.as_f64()), Some(500.0));
    assert_eq!(
        record.get("month").and_then(|v| v.as_str()),
        Some("March 2025")
    );

    let repeat = request(
        &mut stdin,
        &mut reader,
        "pay-2",
        "fees.pay",
        json!({
            "adminId": center.admin_id,
            "studentId": s,
            "batchId": center.batch_id,
            "month": "March 2025"
        }),
    );
    assert_eq!(error_code(&repeat), "conflict");
    assert_eq!(fee_records(&mut stdin, &mut reader, &center, &s).len(), 1);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn payment_amount_is_resolved_at_payment_time() {
    let workspace = temp_dir("coachd-fees-amount");
    let (mut child, mut stdin, mut reader) = spawn_sidecar_at(FIXED_NOW);
    let center = setup_center(&mut stdin, &mut reader, &workspace);
    let s = create_student(&mut stdin, &mut reader, &center, "ravi");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "pay-feb",
        "fees.pay",
        json!({
            "adminId": center.admin_id,
            "studentId": s,
            "batchId": center.batch_id,
            "month": "February 2025"
        }),
    );

    // Raising the batch fee must not rewrite history.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "raise-fee",
        "batches.update",
        json!({ "adminId": center.admin_id, "batchId": center.batch_id, "fee": 800 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "pay-mar",
        "fees.pay",
        json!({
            "adminId": center.admin_id,
            "studentId": s,
            "batchId": center.batch_id,
            "month": "March 2025"
        }),
    );

    let records = fee_records(&mut stdin, &mut reader, &center, &s);
    let amount_for = |month: &str| {
        records
            .iter()
            .find(|r| r.get("month").and_then(|v| v.as_str()) == Some(month))
            .and_then(|r| r.get("amount"))
            .and_then(|v| v.as_f64())
    };
    assert_eq!(amount_for("February 2025"), Some(500.0));
    assert_eq!(amount_for("March 2025"), Some(800.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unpay_removes_exactly_the_named_month() {
    let workspace = temp_dir("coachd-fees-unpay");
    let (mut child, mut stdin, mut reader) = spawn_sidecar_at(FIXED_NOW);
    let center = setup_center(&mut stdin, &mut reader, &workspace);
    let s = create_student(&mut stdin, &mut reader, &center, "ravi");

    for (id, month) in [("pay-feb", "February 2025"), ("pay-mar", "March 2025")] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "fees.pay",
            json!({
                "adminId": center.admin_id,
                "studentId": s,
                "batchId": center.batch_id,
                "month": month
            }),
        );
    }

    let removed = request_ok(
        &mut stdin,
        &mut reader,
        "unpay-feb",
        "fees.unpay",
        json!({
            "adminId": center.admin_id,
            "studentId": s,
            "batchId": center.batch_id,
            "month": "February 2025"
        }),
    );
    assert_eq!(
        removed
            .get("removedFee")
            .and_then(|r| r.get("month"))
            .and_then(|v| v.as_str()),
        Some("February 2025")
    );

    let records = fee_records(&mut stdin, &mut reader, &center, &s);
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].get("month").and_then(|v| v.as_str()),
        Some("March 2025")
    );

    // Unpaying a month with no record is a request error, not a conflict.
    let missing = request(
        &mut stdin,
        &mut reader,
        "unpay-missing",
        "fees.unpay",
        json!({
            "adminId": center.admin_id,
            "studentId": s,
            "batchId": center.batch_id,
            "month": "February 2025"
        }),
    );
    assert_eq!(error_code(&missing), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bulk_current_month_skips_already_paid() {
    let workspace = temp_dir("coachd-fees-bulk");
    let (mut child, mut stdin, mut reader) = spawn_sidecar_at(FIXED_NOW);
    let center = setup_center(&mut stdin, &mut reader, &workspace);
    let s1 = create_student(&mut stdin, &mut reader, &center, "ravi");
    let s2 = create_student(&mut stdin, &mut reader, &center, "priya");

    // The fixed clock pins the current month key.
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "bulk-1",
        "fees.payBulkCurrentMonth",
        json!({ "adminId": center.admin_id, "studentIds": [s1], "batchId": center.batch_id }),
    );
    assert_eq!(first.get("month").and_then(|v| v.as_str()), Some("March 2025"));
    assert_eq!(str_list(&first, "paidStudents"), vec![s1.clone()]);

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "bulk-2",
        "fees.payBulkCurrentMonth",
        json!({ "adminId": center.admin_id, "studentIds": [s1, s2], "batchId": center.batch_id }),
    );
    assert_eq!(str_list(&second, "paidStudents"), vec![s2.clone()]);
    assert_eq!(str_list(&second, "alreadyPaid"), vec![s1.clone()]);

    // Re-running changes nothing and fails nothing.
    let third = request_ok(
        &mut stdin,
        &mut reader,
        "bulk-3",
        "fees.payBulkCurrentMonth",
        json!({ "adminId": center.admin_id, "studentIds": [s1, s2], "batchId": center.batch_id }),
    );
    assert!(str_list(&third, "paidStudents").is_empty());
    assert_eq!(str_list(&third, "alreadyPaid").len(), 2);

    assert_eq!(fee_records(&mut stdin, &mut reader, &center, &s1).len(), 1);
    assert_eq!(fee_records(&mut stdin, &mut reader, &center, &s2).len(), 1);

    // An empty selection is the caller's mistake.
    let empty = request(
        &mut stdin,
        &mut reader,
        "bulk-empty",
        "fees.payBulkCurrentMonth",
        json!({ "adminId": center.admin_id, "studentIds": [], "batchId": center.batch_id }),
    );
    assert_eq!(error_code(&empty), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
