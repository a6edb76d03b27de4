use rusqlite::{Connection, OptionalExtension};

use crate::ipc::error::err;

/// Structured handler failure carried up to the response boundary.
/// Codes are stable snake_case strings the frontend switches on.
#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "not_found",
            message: message.into(),
            details: None,
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "forbidden_state",
            message: message.into(),
            details: None,
        }
    }

    pub fn conflict(message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        HandlerErr {
            code: "conflict",
            message: message.into(),
            details,
        }
    }

    pub fn db(code: &'static str, e: rusqlite::Error) -> Self {
        HandlerErr {
            code,
            message: e.to_string(),
            details: None,
        }
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    match v.as_str() {
        Some(s) => Ok(Some(s.to_string())),
        None => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_string_array(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Err(HandlerErr::bad_params(format!("missing {}", key)));
    };
    let Some(items) = v.as_array() else {
        return Err(HandlerErr::bad_params(format!("{} must be an array", key)));
    };
    Ok(items
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect())
}

pub fn dedupe_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

#[derive(Debug, Clone)]
pub struct AdminRow {
    pub id: String,
    pub name: String,
}

/// Ownership gate: every entity operation names the admin it acts for. The
/// admin must exist and have completed verification before it can operate.
pub fn require_admin(conn: &Connection, admin_id: &str) -> Result<AdminRow, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, name, verified FROM admins WHERE id = ?",
            [admin_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((id, name, verified)) = row else {
        return Err(HandlerErr::not_found("admin not found"));
    };
    if verified == 0 {
        return Err(HandlerErr::forbidden("admin is not verified"));
    }
    Ok(AdminRow { id, name })
}

pub fn student_exists(
    conn: &Connection,
    admin_id: &str,
    student_id: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM students WHERE id = ? AND admin_id = ?",
        (student_id, admin_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}
