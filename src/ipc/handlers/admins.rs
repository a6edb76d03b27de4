use crate::clock::Clock;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn admin_json(conn: &Connection, admin_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, name, email, verified, role, created_at FROM admins WHERE id = ?",
        [admin_id],
        |r| {
            Ok(json!({
                "adminId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "verified": r.get::<_, i64>(3)? != 0,
                "role": r.get::<_, String>(4)?,
                "createdAt": r.get::<_, Option<String>>(5)?,
            }))
        },
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("admin not found"))
}

fn register(
    conn: &Connection,
    clock: &Clock,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(params, "email")?.trim().to_lowercase();
    let password_hash = get_required_str(params, "passwordHash")?;
    let name = get_optional_str(params, "name")?.unwrap_or_default();
    if email.is_empty() || !email.contains('@') {
        return Err(HandlerErr::bad_params("email must be a valid address"));
    }
    if password_hash.is_empty() {
        return Err(HandlerErr::bad_params("passwordHash must not be empty"));
    }

    let existing: Option<String> = conn
        .query_row("SELECT id FROM admins WHERE email = ?", [&email], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if existing.is_some() {
        return Err(HandlerErr::conflict(
            "admin with this email already exists",
            None,
        ));
    }

    let admin_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO admins(id, name, email, password_hash, verified, created_at)
         VALUES(?, ?, ?, ?, 0, ?)",
        (
            &admin_id,
            name.trim(),
            &email,
            &password_hash,
            clock.timestamp(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    Ok(json!({ "adminId": admin_id, "email": email, "verified": false }))
}

// Registration leaves the admin pending; the OTP round-trip happens outside
// this daemon and lands here as a verify call.
fn verify(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    let updated = conn
        .execute("UPDATE admins SET verified = 1 WHERE id = ?", [&admin_id])
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if updated == 0 {
        return Err(HandlerErr::not_found("admin not found"));
    }
    admin_json(conn, &admin_id)
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    admin_json(conn, &admin_id)
}

fn handle_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match register(conn, &state.clock, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_verify(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match verify(conn, &req.params) {
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

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admins.register" => Some(handle_register(state, req)),
        "admins.verify" => Some(handle_verify(state, req)),
        "admins.get" => Some(handle_get(state, req)),
        _ => None,
    }
}
