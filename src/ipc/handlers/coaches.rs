use crate::assignment;
use crate::clock::Clock;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    dedupe_preserving_order, get_optional_str, get_required_str, get_string_array, require_admin,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn coach_json(conn: &Connection, admin_id: &str, coach_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, name, email, phone, status, created_at
             FROM coaches WHERE id = ? AND admin_id = ?",
            (coach_id, admin_id),
            |r| {
                Ok(json!({
                    "coachId": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "email": r.get::<_, String>(2)?,
                    "phone": r.get::<_, String>(3)?,
                    "status": r.get::<_, String>(4)?,
                    "createdAt": r.get::<_, Option<String>>(5)?,
                }))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some(mut coach) = row else {
        return Err(HandlerErr::not_found("coach not found"));
    };
    coach["assignedBatches"] = json!(assignment::assigned_batches_json(conn, coach_id)?);
    Ok(coach)
}

fn create(
    conn: &Connection,
    clock: &Clock,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;

    let name = get_required_str(params, "name")?.trim().to_string();
    let email = get_required_str(params, "email")?.trim().to_lowercase();
    let phone = get_required_str(params, "phone")?.trim().to_string();
    if name.is_empty() || email.is_empty() || phone.is_empty() {
        return Err(HandlerErr::bad_params("name, email and phone are required"));
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM coaches WHERE admin_id = ? AND email = ?",
            (&admin_id, &email),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if existing.is_some() {
        return Err(HandlerErr::conflict(
            "coach with this email already exists",
            None,
        ));
    }

    let coach_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO coaches(id, admin_id, name, email, phone, status, created_at)
         VALUES(?, ?, ?, ?, ?, 'active', ?)",
        (&coach_id, &admin_id, &name, &email, &phone, clock.timestamp()),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    coach_json(conn, &admin_id, &coach_id)
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT id FROM coaches WHERE admin_id = ? ORDER BY created_at DESC, name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let ids: Vec<String> = stmt
        .query_map([&admin_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut coaches = Vec::with_capacity(ids.len());
    for id in &ids {
        coaches.push(coach_json(conn, &admin_id, id)?);
    }
    Ok(json!({ "count": coaches.len(), "coaches": coaches }))
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let coach_id = get_required_str(params, "coachId")?;
    coach_json(conn, &admin_id, &coach_id)
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let coach_id = get_required_str(params, "coachId")?;
    assignment::load_coach(conn, &admin_id, &coach_id)?;

    if let Some(name) = get_optional_str(params, "name")? {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(HandlerErr::bad_params("name must not be empty"));
        }
        // The denormalized coach_name on assigned batches must follow renames.
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
        tx.execute(
            "UPDATE coaches SET name = ? WHERE id = ?",
            (&name, &coach_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        tx.execute(
            "UPDATE batches SET coach_name = ? WHERE coach_id = ?",
            (&name, &coach_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        tx.commit()
            .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    }
    if let Some(phone) = get_optional_str(params, "phone")? {
        conn.execute(
            "UPDATE coaches SET phone = ? WHERE id = ?",
            (phone.trim(), &coach_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }

    coach_json(conn, &admin_id, &coach_id)
}

fn set_status(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let coach_id = get_required_str(params, "coachId")?;
    let status = get_required_str(params, "status")?;

    assignment::set_status(conn, &admin_id, &coach_id, &status)?;
    coach_json(conn, &admin_id, &coach_id)
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let coach_id = get_required_str(params, "coachId")?;

    assignment::delete_coach(conn, &admin_id, &coach_id)?;
    Ok(json!({ "ok": true }))
}

fn assign_batches(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let coach_id = get_required_str(params, "coachId")?;
    let batch_ids = dedupe_preserving_order(get_string_array(params, "batchIds")?);

    assignment::assign_batches(conn, &admin_id, &coach_id, &batch_ids)?;
    coach_json(conn, &admin_id, &coach_id)
}

fn unassign_batches(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    require_admin(conn, &admin_id)?;
    let coach_id = get_required_str(params, "coachId")?;
    let batch_ids = dedupe_preserving_order(get_string_array(params, "batchIds")?);

    let unassigned = assignment::unassign_batches(conn, &admin_id, &coach_id, &batch_ids)?;
    let mut coach = coach_json(conn, &admin_id, &coach_id)?;
    coach["unassignedCount"] = json!(unassigned);
    Ok(coach)
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

fn handle_set_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match set_status(conn, &req.params) {
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

fn handle_assign_batches(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match assign_batches(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_unassign_batches(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match unassign_batches(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "coaches.create" => Some(handle_create(state, req)),
        "coaches.list" => Some(handle_list(state, req)),
        "coaches.get" => Some(handle_get(state, req)),
        "coaches.update" => Some(handle_update(state, req)),
        "coaches.setStatus" => Some(handle_set_status(state, req)),
        "coaches.delete" => Some(handle_delete(state, req)),
        "coaches.assignBatches" => Some(handle_assign_batches(state, req)),
        "coaches.unassignBatches" => Some(handle_unassign_batches(state, req)),
        _ => None,
    }
}
