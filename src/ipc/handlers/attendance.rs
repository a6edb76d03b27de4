use crate::clock::Clock;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    dedupe_preserving_order, get_required_str, get_string_array, require_admin, student_exists,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn has_record_for_day(
    conn: &Connection,
    student_id: &str,
    day: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM attendance_records WHERE student_id = ? AND day = ? LIMIT 1",
        (student_id, day),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

/// Bulk present-marking. Students already holding a record for today are
/// skipped, never an error: the operation is safe to re-invoke after a
/// partial failure without creating duplicate records for the same day.
fn mark_present(
    conn: &Connection,
    clock: &Clock,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let student_ids = dedupe_preserving_order(get_string_array(params, "studentIds")?);

    let day = clock.day_key();
    let now = clock.timestamp();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let mut marked: Vec<String> = Vec::new();
    let mut skipped: Vec<String> = Vec::new();
    for student_id in student_ids {
        if !student_exists(&tx, &admin_id, &student_id)? {
            continue;
        }
        if has_record_for_day(&tx, &student_id, &day)? {
            skipped.push(student_id);
            continue;
        }
        tx.execute(
            "INSERT INTO attendance_records(id, student_id, day, date, status)
             VALUES(?, ?, ?, ?, 'present')",
            (Uuid::new_v4().to_string(), &student_id, &day, &now),
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
        marked.push(student_id);
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "day": day, "marked": marked, "skipped": skipped }))
}

/// Symmetric to mark_present: removes exactly today's records and leaves
/// history from other days untouched.
fn unmark_present(
    conn: &Connection,
    clock: &Clock,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let student_ids = dedupe_preserving_order(get_string_array(params, "studentIds")?);

    let day = clock.day_key();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let mut unmarked: Vec<String> = Vec::new();
    let mut skipped: Vec<String> = Vec::new();
    for student_id in student_ids {
        if !student_exists(&tx, &admin_id, &student_id)? {
            continue;
        }
        if !has_record_for_day(&tx, &student_id, &day)? {
            skipped.push(student_id);
            continue;
        }
        tx.execute(
            "DELETE FROM attendance_records WHERE student_id = ? AND day = ?",
            (&student_id, &day),
        )
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
        unmarked.push(student_id);
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "day": day, "unmarked": unmarked, "skipped": skipped }))
}

fn handle_mark_present(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match mark_present(conn, &state.clock, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_unmark_present(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match unmark_present(conn, &state.clock, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.markPresent" => Some(handle_mark_present(state, req)),
        "attendance.unmarkPresent" => Some(handle_unmark_present(state, req)),
        _ => None,
    }
}
