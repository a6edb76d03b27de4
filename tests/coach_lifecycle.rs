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
    let exe = env!("CARGO_BIN_EXE_coachd");
    let mut child = Command::new(exe)
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

fn setup_admin(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, ws: &PathBuf) -> String {
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
    admin_id
}

fn create_batch(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    admin_id: &str,
    name: &str,
    timing: &str,
) -> String {
    request_ok(
        stdin,
        reader,
        &format!("batch-{}", name),
        "batches.create",
        json!({ "adminId": admin_id, "batchName": name, "timing": timing, "fee": 500 }),
    )
    .get("batchId")
    .and_then(|v| v.as_str())
    .expect("batchId")
    .to_string()
}

fn create_coach(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    admin_id: &str,
    name: &str,
) -> String {
    request_ok(
        stdin,
        reader,
        &format!("coach-{}", name),
        "coaches.create",
        json!({
            "adminId": admin_id,
            "name": name,
            "email": format!("{}@center.test", name),
            "phone": "9876543210"
        }),
    )
    .get("coachId")
    .and_then(|v| v.as_str())
    .expect("coachId")
    .to_string()
}

fn batch_coach_id(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    admin_id: &str,
    batch_id: &str,
) -> Option<String> {
    request_ok(
        stdin,
        reader,
        "batch-ref",
        "batches.get",
        json!({ "adminId": admin_id, "batchId": batch_id }),
    )
    .get("coachId")
    .and_then(|v| v.as_str())
    .map(|s| s.to_string())
}

#[test]
fn deactivation_cascade_clears_both_sides() {
    let workspace = temp_dir("coachd-deactivate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let admin_id = setup_admin(&mut stdin, &mut reader, &workspace);

    let a = create_batch(&mut stdin, &mut reader, &admin_id, "A", "9am");
    let c = create_batch(&mut stdin, &mut reader, &admin_id, "C", "5pm");
    let coach = create_coach(&mut stdin, &mut reader, &admin_id, "amit");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "assign",
        "coaches.assignBatches",
        json!({ "adminId": admin_id, "coachId": coach, "batchIds": [a, c] }),
    );

    let deactivated = request_ok(
        &mut stdin,
        &mut reader,
        "deactivate",
        "coaches.setStatus",
        json!({ "adminId": admin_id, "coachId": coach, "status": "inactive" }),
    );
    assert_eq!(
        deactivated.get("status").and_then(|v| v.as_str()),
        Some("inactive")
    );
    assert_eq!(
        deactivated
            .get("assignedBatches")
            .and_then(|v| v.as_array())
            .map(|x| x.len()),
        Some(0)
    );
    assert_eq!(batch_coach_id(&mut stdin, &mut reader, &admin_id, &a), None);
    assert_eq!(batch_coach_id(&mut stdin, &mut reader, &admin_id, &c), None);

    // An inactive coach cannot pick assignments back up.
    let rejected = request(
        &mut stdin,
        &mut reader,
        "assign-inactive",
        "coaches.assignBatches",
        json!({ "adminId": admin_id, "coachId": coach, "batchIds": [a] }),
    );
    assert_eq!(error_code(&rejected), "forbidden_state");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn suspension_blocks_new_assignments_but_keeps_existing() {
    let workspace = temp_dir("coachd-suspend");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let admin_id = setup_admin(&mut stdin, &mut reader, &workspace);

    let a = create_batch(&mut stdin, &mut reader, &admin_id, "A", "9am");
    let b = create_batch(&mut stdin, &mut reader, &admin_id, "B", "5pm");
    let coach = create_coach(&mut stdin, &mut reader, &admin_id, "amit");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "assign",
        "coaches.assignBatches",
        json!({ "adminId": admin_id, "coachId": coach, "batchIds": [a] }),
    );
    let suspended = request_ok(
        &mut stdin,
        &mut reader,
        "suspend",
        "coaches.setStatus",
        json!({ "adminId": admin_id, "coachId": coach, "status": "suspended" }),
    );
    assert_eq!(
        suspended
            .get("assignedBatches")
            .and_then(|v| v.as_array())
            .map(|x| x.len()),
        Some(1),
        "suspension must not strip assignments"
    );

    let rejected = request(
        &mut stdin,
        &mut reader,
        "assign-suspended",
        "coaches.assignBatches",
        json!({ "adminId": admin_id, "coachId": coach, "batchIds": [a, b] }),
    );
    assert_eq!(error_code(&rejected), "forbidden_state");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unassign_is_all_or_nothing_and_targeted() {
    let workspace = temp_dir("coachd-unassign");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let admin_id = setup_admin(&mut stdin, &mut reader, &workspace);

    let a = create_batch(&mut stdin, &mut reader, &admin_id, "A", "9am");
    let b = create_batch(&mut stdin, &mut reader, &admin_id, "B", "5pm");
    let c = create_batch(&mut stdin, &mut reader, &admin_id, "C", "7pm");
    let coach = create_coach(&mut stdin, &mut reader, &admin_id, "amit");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "assign",
        "coaches.assignBatches",
        json!({ "adminId": admin_id, "coachId": coach, "batchIds": [a, b] }),
    );

    // c is not assigned to this coach: the whole call must fail and leave
    // a and b untouched.
    let rejected = request(
        &mut stdin,
        &mut reader,
        "unassign-mixed",
        "coaches.unassignBatches",
        json!({ "adminId": admin_id, "coachId": coach, "batchIds": [a, c] }),
    );
    assert_eq!(error_code(&rejected), "conflict");
    let not_assigned = rejected
        .get("error")
        .and_then(|e| e.get("details"))
        .and_then(|d| d.get("notAssigned"))
        .and_then(|v| v.as_array())
        .expect("notAssigned detail");
    assert_eq!(not_assigned.len(), 1);
    assert_eq!(
        batch_coach_id(&mut stdin, &mut reader, &admin_id, &a).as_deref(),
        Some(coach.as_str())
    );

    let unassigned = request_ok(
        &mut stdin,
        &mut reader,
        "unassign-a",
        "coaches.unassignBatches",
        json!({ "adminId": admin_id, "coachId": coach, "batchIds": [a] }),
    );
    assert_eq!(
        unassigned.get("unassignedCount").and_then(|v| v.as_i64()),
        Some(1)
    );
    assert_eq!(batch_coach_id(&mut stdin, &mut reader, &admin_id, &a), None);
    assert_eq!(
        batch_coach_id(&mut stdin, &mut reader, &admin_id, &b).as_deref(),
        Some(coach.as_str()),
        "unassign must only touch the named batches"
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn delete_guard_requires_unassignment_first() {
    let workspace = temp_dir("coachd-delete-guard");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let admin_id = setup_admin(&mut stdin, &mut reader, &workspace);

    let a = create_batch(&mut stdin, &mut reader, &admin_id, "A", "9am");
    let coach = create_coach(&mut stdin, &mut reader, &admin_id, "amit");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "assign",
        "coaches.assignBatches",
        json!({ "adminId": admin_id, "coachId": coach, "batchIds": [a] }),
    );

    let rejected = request(
        &mut stdin,
        &mut reader,
        "delete-assigned",
        "coaches.delete",
        json!({ "adminId": admin_id, "coachId": coach }),
    );
    assert_eq!(error_code(&rejected), "conflict");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "unassign",
        "coaches.unassignBatches",
        json!({ "adminId": admin_id, "coachId": coach, "batchIds": [a] }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "delete",
        "coaches.delete",
        json!({ "adminId": admin_id, "coachId": coach }),
    );

    let gone = request(
        &mut stdin,
        &mut reader,
        "get-deleted",
        "coaches.get",
        json!({ "adminId": admin_id, "coachId": coach }),
    );
    assert_eq!(error_code(&gone), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn coach_rename_updates_denormalized_batch_names() {
    let workspace = temp_dir("coachd-rename");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let admin_id = setup_admin(&mut stdin, &mut reader, &workspace);

    let a = create_batch(&mut stdin, &mut reader, &admin_id, "A", "9am");
    let coach = create_coach(&mut stdin, &mut reader, &admin_id, "amit");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "assign",
        "coaches.assignBatches",
        json!({ "adminId": admin_id, "coachId": coach, "batchIds": [a] }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "rename",
        "coaches.update",
        json!({ "adminId": admin_id, "coachId": coach, "name": "Amit Kumar" }),
    );

    let batch = request_ok(
        &mut stdin,
        &mut reader,
        "batch-after-rename",
        "batches.get",
        json!({ "adminId": admin_id, "batchId": a }),
    );
    assert_eq!(
        batch.get("coachName").and_then(|v| v.as_str()),
        Some("Amit Kumar")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
