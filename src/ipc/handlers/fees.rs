use crate::clock::{self, Clock};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    dedupe_preserving_order, get_required_str, get_string_array, require_admin, student_exists,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn batch_fee(conn: &Connection, admin_id: &str, batch_id: &str) -> Result<f64, HandlerErr> {
    conn.query_row(
        "SELECT fee FROM batches WHERE id = ? AND admin_id = ?",
        (batch_id, admin_id),
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("batch not found"))
}

fn require_student(conn: &Connection, admin_id: &str, student_id: &str) -> Result<(), HandlerErr> {
    if student_exists(conn, admin_id, student_id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("student not found"))
    }
}

struct FeeRecord {
    id: String,
    month: String,
    amount: f64,
    status: String,
    paid_at: String,
}

impl FeeRecord {
    fn json(&self) -> serde_json::Value {
        json!({
            "recordId": self.id,
            "month": self.month,
            "amount": self.amount,
            "status": self.status,
            "date": self.paid_at,
        })
    }
}

fn record_for_month(
    conn: &Connection,
    student_id: &str,
    month: &str,
) -> Result<Option<FeeRecord>, HandlerErr> {
    conn.query_row(
        "SELECT id, month, amount, status, paid_at FROM fee_records
         WHERE student_id = ? AND month = ? LIMIT 1",
        (student_id, month),
        |r| {
            Ok(FeeRecord {
                id: r.get(0)?,
                month: r.get(1)?,
                amount: r.get(2)?,
                status: r.get(3)?,
                paid_at: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

/// Single-student payment for a named month. Unlike the bulk path, a
/// duplicate month here is a hard conflict.
fn pay(
    conn: &Connection,
    clock: &Clock,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let student_id = get_required_str(params, "studentId")?;
    let batch_id = get_required_str(params, "batchId")?;
    let month_raw = get_required_str(params, "month")?;
    let Some(month) = clock::parse_month_key(&month_raw) else {
        return Err(HandlerErr::bad_params(
            "month must look like 'March 2025'",
        ));
    };

    require_student(conn, &admin_id, &student_id)?;
    if record_for_month(conn, &student_id, &month)?.is_some() {
        return Err(HandlerErr::conflict(
            format!("fee for {} is already paid", month),
            Some(json!({ "month": month })),
        ));
    }

    // Amount comes from the batch at payment time; later fee changes do not
    // rewrite history.
    let amount = batch_fee(conn, &admin_id, &batch_id)?;
    let record = FeeRecord {
        id: Uuid::new_v4().to_string(),
        month,
        amount,
        status: "paid".to_string(),
        paid_at: clock.timestamp(),
    };
    conn.execute(
        "INSERT INTO fee_records(id, student_id, month, amount, status, paid_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &record.id,
            &student_id,
            &record.month,
            record.amount,
            &record.status,
            &record.paid_at,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    Ok(json!({ "feeRecord": record.json() }))
}

fn unpay(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let student_id = get_required_str(params, "studentId")?;
    let _batch_id = get_required_str(params, "batchId")?;
    let month_raw = get_required_str(params, "month")?;
    let Some(month) = clock::parse_month_key(&month_raw) else {
        return Err(HandlerErr::bad_params(
            "month must look like 'March 2025'",
        ));
    };

    require_student(conn, &admin_id, &student_id)?;
    let Some(record) = record_for_month(conn, &student_id, &month)? else {
        return Err(HandlerErr::bad_params(format!(
            "fee for {} is not paid",
            month
        )));
    };

    // Delete by record id, not by month key, so a duplicated entry can never
    // take an unrelated record with it.
    conn.execute("DELETE FROM fee_records WHERE id = ?", [&record.id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;

    Ok(json!({ "removedFee": record.json() }))
}

/// Bulk "collect this month's fee". Already-paid students are reported, not
/// failed, so the call can be retried after a timeout without double-charging.
fn pay_bulk_current_month(
    conn: &Connection,
    clock: &Clock,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let student_ids = dedupe_preserving_order(get_string_array(params, "studentIds")?);
    if student_ids.is_empty() {
        return Err(HandlerErr::bad_params("no students selected"));
    }
    let batch_id = get_required_str(params, "batchId")?;
    let amount = batch_fee(conn, &admin_id, &batch_id)?;

    let month = clock.month_key();
    let now = clock.timestamp();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let mut paid_students: Vec<String> = Vec::new();
    let mut already_paid: Vec<String> = Vec::new();
    for student_id in student_ids {
        if !student_exists(&tx, &admin_id, &student_id)? {
            continue;
        }
        if record_for_month(&tx, &student_id, &month)?.is_some() {
            already_paid.push(student_id);
            continue;
        }
        tx.execute(
            "INSERT INTO fee_records(id, student_id, month, amount, status, paid_at)
             VALUES(?, ?, ?, ?, 'paid', ?)",
            (
                Uuid::new_v4().to_string(),
                &student_id,
                &month,
                amount,
                &now,
            ),
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
        paid_students.push(student_id);
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({
        "month": month,
        "paidStudents": paid_students,
        "alreadyPaid": already_paid,
    }))
}

fn handle_pay(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match pay(conn, &state.clock, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_unpay(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match unpay(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_pay_bulk(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match pay_bulk_current_month(conn, &state.clock, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "fees.pay" => Some(handle_pay(state, req)),
        "fees.unpay" => Some(handle_unpay(state, req)),
        "fees.payBulkCurrentMonth" => Some(handle_pay_bulk(state, req)),
        _ => None,
    }
}
