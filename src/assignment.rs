//! Coach–batch assignment engine.
//!
//! Every write to the coach↔batch relationship goes through this module so
//! the two sides can never disagree: `batches.coach_id`/`coach_name` (the
//! batch-side back-reference) and `coach_batches` (the coach-side ordered
//! set) are only ever updated together, inside one transaction.

use rusqlite::{Connection, OptionalExtension, Transaction};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};

use crate::ipc::helpers::HandlerErr;

/// Timing label of batches that have no scheduled slot yet. Excluded from
/// timing-collision checks: two unscheduled batches do not clash.
pub const TIMING_UNASSIGNED: &str = "Not Assigned";

#[derive(Debug, Clone)]
pub struct CoachRow {
    pub id: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone)]
struct BatchRow {
    id: String,
    name: String,
    timing: String,
    coach_id: Option<String>,
}

pub fn load_coach(
    conn: &Connection,
    admin_id: &str,
    coach_id: &str,
) -> Result<CoachRow, HandlerErr> {
    conn.query_row(
        "SELECT id, name, status FROM coaches WHERE id = ? AND admin_id = ?",
        (coach_id, admin_id),
        |r| {
            Ok(CoachRow {
                id: r.get(0)?,
                name: r.get(1)?,
                status: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("coach not found"))
}

/// Populated summaries of a coach's assigned batches, in assignment order.
pub fn assigned_batches_json(
    conn: &Connection,
    coach_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT b.id, b.name, b.timing, b.fee, b.status
             FROM coach_batches cb
             JOIN batches b ON b.id = cb.batch_id
             WHERE cb.coach_id = ?
             ORDER BY cb.sort_order",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    stmt.query_map([coach_id], |r| {
        Ok(json!({
            "batchId": r.get::<_, String>(0)?,
            "batchName": r.get::<_, String>(1)?,
            "timing": r.get::<_, String>(2)?,
            "fee": r.get::<_, f64>(3)?,
            "status": r.get::<_, String>(4)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

/// Replace a coach's assignment set with exactly `batch_ids`.
///
/// Rejects before touching anything: unknown batches, batches held by a
/// different coach, and timing collisions within the requested set. The
/// commit clears back-references on batches being dropped, sets them on the
/// requested set, and rewrites the coach-side rows, all in one transaction.
pub fn assign_batches(
    conn: &Connection,
    admin_id: &str,
    coach_id: &str,
    batch_ids: &[String],
) -> Result<CoachRow, HandlerErr> {
    let coach = load_coach(conn, admin_id, coach_id)?;
    if coach.status != "active" {
        return Err(HandlerErr::forbidden(format!(
            "coach is {}, only active coaches can receive batches",
            coach.status
        )));
    }

    let mut batches: Vec<BatchRow> = Vec::with_capacity(batch_ids.len());
    for id in batch_ids {
        let row = conn
            .query_row(
                "SELECT id, name, timing, coach_id FROM batches WHERE id = ? AND admin_id = ?",
                (id, admin_id),
                |r| {
                    Ok(BatchRow {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        timing: r.get(2)?,
                        coach_id: r.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        match row {
            Some(b) => batches.push(b),
            None => return Err(HandlerErr::not_found("some batches not found")),
        }
    }

    // Exclusivity: a batch held by a different coach must be unassigned
    // explicitly first. Re-assigning a batch this coach already holds is fine.
    let mut held_elsewhere: Vec<serde_json::Value> = Vec::new();
    for b in &batches {
        let Some(holder) = &b.coach_id else { continue };
        if holder == coach_id {
            continue;
        }
        let holder_name: Option<String> = conn
            .query_row("SELECT name FROM coaches WHERE id = ?", [holder], |r| {
                r.get(0)
            })
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        held_elsewhere.push(json!({
            "batchId": b.id,
            "batchName": b.name,
            "coachId": holder,
            "coachName": holder_name,
        }));
    }
    if !held_elsewhere.is_empty() {
        return Err(HandlerErr::conflict(
            "some batches are already assigned to another coach",
            Some(json!({ "assignedElsewhere": held_elsewhere })),
        ));
    }

    // A coach cannot teach two batches in the same timing slot. Only the
    // requested set matters: it replaces the previous assignment wholesale.
    let mut by_timing: BTreeMap<&str, Vec<&BatchRow>> = BTreeMap::new();
    for b in &batches {
        if b.timing != TIMING_UNASSIGNED {
            by_timing.entry(b.timing.as_str()).or_default().push(b);
        }
    }
    let mut collisions: Vec<serde_json::Value> = Vec::new();
    for (timing, group) in &by_timing {
        if group.len() < 2 {
            continue;
        }
        for b in group {
            collisions.push(json!({
                "batchId": b.id,
                "batchName": b.name,
                "timing": timing,
            }));
        }
    }
    if !collisions.is_empty() {
        return Err(HandlerErr::conflict(
            "some batches share the same timing slot",
            Some(json!({ "timingCollisions": collisions })),
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    let requested: HashSet<&str> = batches.iter().map(|b| b.id.as_str()).collect();
    let previous = current_batch_ids(&tx, coach_id)?;
    for dropped in previous.iter().filter(|id| !requested.contains(id.as_str())) {
        tx.execute(
            "UPDATE batches SET coach_id = NULL, coach_name = NULL WHERE id = ?",
            [dropped],
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    tx.execute("DELETE FROM coach_batches WHERE coach_id = ?", [coach_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    for (i, b) in batches.iter().enumerate() {
        tx.execute(
            "UPDATE batches SET coach_id = ?, coach_name = ? WHERE id = ?",
            (coach_id, &coach.name, &b.id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        tx.execute(
            "INSERT INTO coach_batches(coach_id, batch_id, sort_order) VALUES(?, ?, ?)",
            (coach_id, &b.id, i as i64),
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(coach)
}

/// Remove exactly the named batches from a coach's assignment set.
///
/// All-or-nothing: if any named batch is not currently assigned to this
/// coach the whole call is rejected, naming the offenders. Intentionally
/// stricter than the ledger bulk operations' skip semantics.
pub fn unassign_batches(
    conn: &Connection,
    admin_id: &str,
    coach_id: &str,
    batch_ids: &[String],
) -> Result<usize, HandlerErr> {
    let coach = load_coach(conn, admin_id, coach_id)?;
    if batch_ids.is_empty() {
        return Err(HandlerErr::bad_params("batchIds must not be empty"));
    }

    let current: HashSet<String> = current_batch_ids(conn, &coach.id)?.into_iter().collect();
    let not_assigned: Vec<&String> = batch_ids
        .iter()
        .filter(|id| !current.contains(id.as_str()))
        .collect();
    if !not_assigned.is_empty() {
        return Err(HandlerErr::conflict(
            "some batches are not assigned to this coach",
            Some(json!({ "notAssigned": not_assigned })),
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    for id in batch_ids {
        tx.execute(
            "DELETE FROM coach_batches WHERE coach_id = ? AND batch_id = ?",
            (&coach.id, id),
        )
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
        // Targeted: only the named batches lose their back-reference, and
        // only if it still points at this coach.
        tx.execute(
            "UPDATE batches SET coach_id = NULL, coach_name = NULL
             WHERE id = ? AND coach_id = ?",
            (id, &coach.id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(batch_ids.len())
}

/// Status transition with the deactivation cascade: moving to `inactive`
/// strips every assignment and clears the batch back-references atomically
/// with the status write. `suspended` blocks new assignments but keeps
/// existing ones.
pub fn set_status(
    conn: &Connection,
    admin_id: &str,
    coach_id: &str,
    status: &str,
) -> Result<CoachRow, HandlerErr> {
    if !matches!(status, "active" | "inactive" | "suspended") {
        return Err(HandlerErr::bad_params(
            "status must be active, inactive or suspended",
        ));
    }
    let coach = load_coach(conn, admin_id, coach_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    if status == "inactive" {
        strip_assignments(&tx, &coach.id).map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    tx.execute(
        "UPDATE coaches SET status = ? WHERE id = ?",
        (status, &coach.id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(CoachRow {
        status: status.to_string(),
        ..coach
    })
}

/// Delete guard: a coach still holding batches cannot be deleted; the caller
/// must unassign first. The delete itself sweeps any stray back-references
/// so a half-cleared workspace cannot leave dangling pointers behind.
pub fn delete_coach(conn: &Connection, admin_id: &str, coach_id: &str) -> Result<(), HandlerErr> {
    let coach = load_coach(conn, admin_id, coach_id)?;

    let assigned: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM coach_batches WHERE coach_id = ?",
            [&coach.id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if assigned > 0 {
        return Err(HandlerErr::conflict(
            "cannot delete coach with assigned batches",
            Some(json!({ "assignedCount": assigned })),
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    strip_assignments(&tx, &coach.id).map_err(|e| HandlerErr::db("db_update_failed", e))?;
    tx.execute("DELETE FROM coaches WHERE id = ?", [&coach.id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(())
}

/// Drop a batch out of the relationship entirely (used when the batch itself
/// is being deleted). Runs inside the caller's transaction.
pub fn release_batch(tx: &Transaction, batch_id: &str) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM coach_batches WHERE batch_id = ?", [batch_id])?;
    tx.execute(
        "UPDATE batches SET coach_id = NULL, coach_name = NULL WHERE id = ?",
        [batch_id],
    )?;
    Ok(())
}

fn strip_assignments(tx: &Transaction, coach_id: &str) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE batches SET coach_id = NULL, coach_name = NULL WHERE coach_id = ?",
        [coach_id],
    )?;
    tx.execute("DELETE FROM coach_batches WHERE coach_id = ?", [coach_id])?;
    Ok(())
}

fn current_batch_ids(conn: &Connection, coach_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT batch_id FROM coach_batches WHERE coach_id = ? ORDER BY sort_order")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    stmt.query_map([coach_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))
}
