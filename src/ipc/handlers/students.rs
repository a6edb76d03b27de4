use crate::clock::Clock;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, require_admin, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct BatchRef {
    id: String,
    name: String,
}

fn load_batch(conn: &Connection, admin_id: &str, batch_id: &str) -> Result<BatchRef, HandlerErr> {
    conn.query_row(
        "SELECT id, name FROM batches WHERE id = ? AND admin_id = ?",
        (batch_id, admin_id),
        |r| {
            Ok(BatchRef {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        },
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("batch not found"))
}

fn student_json(
    conn: &Connection,
    admin_id: &str,
    student_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    // The student's coach is whoever currently holds their batch.
    let row = conn
        .query_row(
            "SELECT s.id, s.name, s.father_name, s.mother_name, s.phone, s.aadhar_number,
                    s.school_name, s.address, s.batch_id, s.batch_name, s.created_by,
                    s.created_at, b.coach_id, b.coach_name
             FROM students s
             LEFT JOIN batches b ON b.id = s.batch_id
             WHERE s.id = ? AND s.admin_id = ?",
            (student_id, admin_id),
            |r| {
                Ok(json!({
                    "studentId": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "fatherName": r.get::<_, String>(2)?,
                    "motherName": r.get::<_, Option<String>>(3)?,
                    "phone": r.get::<_, String>(4)?,
                    "aadharNumber": r.get::<_, String>(5)?,
                    "schoolName": r.get::<_, Option<String>>(6)?,
                    "address": r.get::<_, Option<String>>(7)?,
                    "batchId": r.get::<_, String>(8)?,
                    "batchName": r.get::<_, String>(9)?,
                    "createdBy": r.get::<_, Option<String>>(10)?,
                    "createdAt": r.get::<_, Option<String>>(11)?,
                    "coachId": r.get::<_, Option<String>>(12)?,
                    "coachName": r.get::<_, Option<String>>(13)?,
                }))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    row.ok_or_else(|| HandlerErr::not_found("student not found"))
}

fn attendance_json(
    conn: &Connection,
    student_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, day, date, status, remark FROM attendance_records
             WHERE student_id = ? ORDER BY day",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    stmt.query_map([student_id], |r| {
        Ok(json!({
            "recordId": r.get::<_, String>(0)?,
            "day": r.get::<_, String>(1)?,
            "date": r.get::<_, String>(2)?,
            "status": r.get::<_, String>(3)?,
            "remark": r.get::<_, Option<String>>(4)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn fees_json(conn: &Connection, student_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, month, amount, status, paid_at FROM fee_records
             WHERE student_id = ? ORDER BY paid_at",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    stmt.query_map([student_id], |r| {
        Ok(json!({
            "recordId": r.get::<_, String>(0)?,
            "month": r.get::<_, String>(1)?,
            "amount": r.get::<_, f64>(2)?,
            "status": r.get::<_, String>(3)?,
            "date": r.get::<_, String>(4)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn create(
    conn: &Connection,
    clock: &Clock,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    let admin = require_admin(conn, &admin_id)?;

    let name = get_required_str(params, "name")?.trim().to_string();
    let father_name = get_required_str(params, "fatherName")?.trim().to_string();
    let phone = get_required_str(params, "phone")?.trim().to_string();
    let aadhar = get_required_str(params, "aadharNumber")?.trim().to_string();
    if name.is_empty() || father_name.is_empty() || phone.is_empty() || aadhar.is_empty() {
        return Err(HandlerErr::bad_params(
            "name, fatherName, phone and aadharNumber are required",
        ));
    }
    let batch_id = get_required_str(params, "batchId")?;
    let batch = load_batch(conn, &admin_id, &batch_id)?;

    let mother_name = get_optional_str(params, "motherName")?;
    let school_name = get_optional_str(params, "schoolName")?;
    let address = get_optional_str(params, "address")?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, admin_id, batch_id, batch_name, name, father_name,
                              mother_name, phone, aadhar_number, school_name, address,
                              created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &admin.id,
            &batch.id,
            &batch.name,
            &name,
            &father_name,
            &mother_name,
            &phone,
            &aadhar,
            &school_name,
            &address,
            &admin.name,
            clock.timestamp(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    student_json(conn, &admin_id, &student_id)
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let batch_id = get_optional_str(params, "batchId")?;

    let sql = "SELECT id, name, father_name, phone, batch_id, batch_name
               FROM students
               WHERE admin_id = ?1 AND (?2 IS NULL OR batch_id = ?2)
               ORDER BY created_at DESC, name";
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let students = stmt
        .query_map((&admin_id, &batch_id), |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "fatherName": r.get::<_, String>(2)?,
                "phone": r.get::<_, String>(3)?,
                "batchId": r.get::<_, String>(4)?,
                "batchName": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "count": students.len(), "students": students }))
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let student_id = get_required_str(params, "studentId")?;

    let mut student = student_json(conn, &admin_id, &student_id)?;
    student["attendance"] = json!(attendance_json(conn, &student_id)?);
    student["fee"] = json!(fees_json(conn, &student_id)?);
    Ok(student)
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let student_id = get_required_str(params, "studentId")?;
    student_json(conn, &admin_id, &student_id)?;

    for (key, column) in [
        ("name", "name"),
        ("fatherName", "father_name"),
        ("motherName", "mother_name"),
        ("phone", "phone"),
        ("schoolName", "school_name"),
        ("address", "address"),
    ] {
        if let Some(value) = get_optional_str(params, key)? {
            let sql = format!("UPDATE students SET {} = ? WHERE id = ?", column);
            conn.execute(&sql, (value.trim(), &student_id))
                .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        }
    }

    // Moving a student re-denormalizes the batch name.
    if let Some(batch_id) = get_optional_str(params, "batchId")? {
        let batch = load_batch(conn, &admin_id, &batch_id)?;
        conn.execute(
            "UPDATE students SET batch_id = ?, batch_name = ? WHERE id = ?",
            (&batch.id, &batch.name, &student_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }

    student_json(conn, &admin_id, &student_id)
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let student_id = get_required_str(params, "studentId")?;
    student_json(conn, &admin_id, &student_id)?;

    // Explicitly delete ledgers first (no ON DELETE CASCADE).
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "DELETE FROM attendance_records WHERE student_id = ?",
        [&student_id],
    )
    .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    tx.execute("DELETE FROM fee_records WHERE student_id = ?", [&student_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    tx.execute("DELETE FROM students WHERE id = ?", [&student_id])
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
        "students.create" => Some(handle_create(state, req)),
        "students.list" => Some(handle_list(state, req)),
        "students.get" => Some(handle_get(state, req)),
        "students.update" => Some(handle_update(state, req)),
        "students.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
