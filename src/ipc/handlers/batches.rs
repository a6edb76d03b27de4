use crate::assignment::{self, TIMING_UNASSIGNED};
use crate::clock::Clock;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, require_admin, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const WEEK_DAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

const BATCH_STATUSES: [&str; 3] = ["active", "inactive", "archived"];

fn parse_week_days(params: &serde_json::Value) -> Result<Option<Vec<String>>, HandlerErr> {
    let Some(v) = params.get("weekDays") else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let Some(items) = v.as_array() else {
        return Err(HandlerErr::bad_params("weekDays must be an array"));
    };
    let mut days = Vec::with_capacity(items.len());
    for item in items {
        let Some(day) = item.as_str() else {
            return Err(HandlerErr::bad_params("weekDays entries must be strings"));
        };
        let day = day.trim().to_lowercase();
        if !WEEK_DAYS.contains(&day.as_str()) {
            return Err(HandlerErr::bad_params(format!("invalid week day: {}", day)));
        }
        if !days.contains(&day) {
            days.push(day);
        }
    }
    Ok(Some(days))
}

fn parse_fee(params: &serde_json::Value) -> Result<Option<f64>, HandlerErr> {
    let Some(v) = params.get("fee") else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let Some(fee) = v.as_f64() else {
        return Err(HandlerErr::bad_params("fee must be a number"));
    };
    if fee < 0.0 {
        return Err(HandlerErr::bad_params("fee must be non-negative"));
    }
    Ok(Some(fee))
}

fn batch_json(conn: &Connection, admin_id: &str, batch_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT b.id, b.name, b.timing, b.week_days, b.fee, b.status,
                    b.coach_id, b.coach_name, b.created_by, b.created_at,
                    (SELECT COUNT(*) FROM students s WHERE s.batch_id = b.id) AS student_count
             FROM batches b
             WHERE b.id = ? AND b.admin_id = ?",
            (batch_id, admin_id),
            |r| {
                let week_days_raw: String = r.get(3)?;
                Ok(json!({
                    "batchId": r.get::<_, String>(0)?,
                    "batchName": r.get::<_, String>(1)?,
                    "timing": r.get::<_, String>(2)?,
                    "weekDays": serde_json::from_str::<serde_json::Value>(&week_days_raw)
                        .unwrap_or_else(|_| json!([])),
                    "fee": r.get::<_, f64>(4)?,
                    "status": r.get::<_, String>(5)?,
                    "coachId": r.get::<_, Option<String>>(6)?,
                    "coachName": r.get::<_, Option<String>>(7)?,
                    "createdBy": r.get::<_, Option<String>>(8)?,
                    "createdAt": r.get::<_, Option<String>>(9)?,
                    "studentCount": r.get::<_, i64>(10)?,
                }))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    row.ok_or_else(|| HandlerErr::not_found("batch not found"))
}

fn create(
    conn: &Connection,
    clock: &Clock,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    let admin = require_admin(conn, &admin_id)?;

    let name = get_required_str(params, "batchName")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("batchName must not be empty"));
    }
    let timing = get_optional_str(params, "timing")?
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| TIMING_UNASSIGNED.to_string());
    let fee = parse_fee(params)?.unwrap_or(0.0);
    let week_days = parse_week_days(params)?.unwrap_or_default();

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM batches WHERE admin_id = ? AND name = ?",
            (&admin_id, &name),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if existing.is_some() {
        return Err(HandlerErr::conflict("batch name already exists", None));
    }

    let batch_id = Uuid::new_v4().to_string();
    let week_days_json =
        serde_json::to_string(&week_days).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        "INSERT INTO batches(id, admin_id, name, timing, week_days, fee, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &batch_id,
            &admin.id,
            &name,
            &timing,
            &week_days_json,
            fee,
            &admin.name,
            clock.timestamp(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    batch_json(conn, &admin_id, &batch_id)
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;

    // Correlated subquery for the count to avoid double-counting from joins.
    let mut stmt = conn
        .prepare(
            "SELECT b.id, b.name, b.timing, b.fee, b.status, b.coach_id, b.coach_name,
                    (SELECT COUNT(*) FROM students s WHERE s.batch_id = b.id) AS student_count
             FROM batches b
             WHERE b.admin_id = ?
             ORDER BY b.created_at DESC, b.name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let batches = stmt
        .query_map([&admin_id], |r| {
            Ok(json!({
                "batchId": r.get::<_, String>(0)?,
                "batchName": r.get::<_, String>(1)?,
                "timing": r.get::<_, String>(2)?,
                "fee": r.get::<_, f64>(3)?,
                "status": r.get::<_, String>(4)?,
                "coachId": r.get::<_, Option<String>>(5)?,
                "coachName": r.get::<_, Option<String>>(6)?,
                "studentCount": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "count": batches.len(), "batches": batches }))
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let batch_id = get_required_str(params, "batchId")?;
    batch_json(conn, &admin_id, &batch_id)
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let batch_id = get_required_str(params, "batchId")?;
    // Existence check up front so a bad id is not_found, not a no-op.
    batch_json(conn, &admin_id, &batch_id)?;

    if let Some(timing) = get_optional_str(params, "timing")? {
        let timing = timing.trim().to_string();
        if timing.is_empty() {
            return Err(HandlerErr::bad_params("timing must not be empty"));
        }
        conn.execute(
            "UPDATE batches SET timing = ? WHERE id = ?",
            (&timing, &batch_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(fee) = parse_fee(params)? {
        conn.execute("UPDATE batches SET fee = ? WHERE id = ?", (fee, &batch_id))
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(days) = parse_week_days(params)? {
        let days_json = serde_json::to_string(&days).unwrap_or_else(|_| "[]".to_string());
        conn.execute(
            "UPDATE batches SET week_days = ? WHERE id = ?",
            (&days_json, &batch_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(status) = get_optional_str(params, "status")? {
        if !BATCH_STATUSES.contains(&status.as_str()) {
            return Err(HandlerErr::bad_params(
                "status must be active, inactive or archived",
            ));
        }
        conn.execute(
            "UPDATE batches SET status = ? WHERE id = ?",
            (&status, &batch_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }

    batch_json(conn, &admin_id, &batch_id)
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let batch_id = get_required_str(params, "batchId")?;
    batch_json(conn, &admin_id, &batch_id)?;

    let student_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE batch_id = ?",
            [&batch_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if student_count > 0 {
        return Err(HandlerErr::conflict(
            "cannot delete batch with enrolled students",
            Some(json!({ "studentCount": student_count })),
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    assignment::release_batch(&tx, &batch_id)
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    tx.execute("DELETE FROM batches WHERE id = ?", [&batch_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "ok": true }))
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match create(conn, &state.clock, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match get(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match update(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match delete(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "batches.create" => Some(handle_create(state, req)),
        "batches.list" => Some(handle_list(state, req)),
        "batches.get" => Some(handle_get(state, req)),
        "batches.update" => Some(handle_update(state, req)),
        "batches.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
