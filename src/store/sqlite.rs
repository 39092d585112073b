use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::error::{ActionError, ActionResult};
use crate::model::{
    ActionId, ActionRequest, ActionStatus, GrantId, PermissionGrant, Scope,
};

use super::valid_transition;

/// SQLite-backed durable store for grants and actions.
///
/// Opening with `":memory:"` creates a non-durable in-memory database (used
/// by tests and by callers who don't need the store to survive a restart).
/// Any other path opens (or creates) a file there, in WAL mode.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> ActionResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            let conn = Connection::open(Path::new(path))?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            conn
        };

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS grants (
                id                TEXT PRIMARY KEY,
                handler_id        TEXT NOT NULL,
                permission_name   TEXT NOT NULL,
                scope_json        TEXT NOT NULL,
                granted_at        TEXT NOT NULL,
                expires_at        TEXT,
                granted_by        TEXT NOT NULL,
                revoked           INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_grants_lookup
                ON grants(handler_id, permission_name, revoked);

            CREATE TABLE IF NOT EXISTS actions (
                id                        TEXT PRIMARY KEY,
                handler_id                TEXT NOT NULL,
                action_name               TEXT NOT NULL,
                params_json               TEXT NOT NULL,
                status                    TEXT NOT NULL,
                result_json               TEXT,
                error                     TEXT,
                required_permission_name  TEXT,
                required_scope_json       TEXT,
                created_at                TEXT NOT NULL,
                completed_at              TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_actions_status ON actions(status);
            CREATE INDEX IF NOT EXISTS idx_actions_handler ON actions(handler_id);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn to_rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn from_rfc3339(s: &str) -> ActionResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ActionError::StorageError(format!("bad timestamp '{s}': {e}")))
}

fn scope_to_json(scope: &Scope) -> ActionResult<String> {
    Ok(serde_json::to_string(scope)?)
}

fn scope_from_json(s: &str) -> ActionResult<Scope> {
    Ok(serde_json::from_str(s)?)
}

fn grant_from_row(row: &Row) -> rusqlite::Result<(String, String, String, String, String, Option<String>, String, bool)> {
    Ok((
        row.get(0)?, // id
        row.get(1)?, // handler_id
        row.get(2)?, // permission_name
        row.get(3)?, // scope_json
        row.get(4)?, // granted_at
        row.get(5)?, // expires_at
        row.get(6)?, // granted_by
        row.get::<_, i64>(7)? != 0, // revoked
    ))
}

fn build_grant(
    (id, handler_id, permission_name, scope_json, granted_at, expires_at, granted_by, revoked): (
        String,
        String,
        String,
        String,
        String,
        Option<String>,
        String,
        bool,
    ),
) -> ActionResult<PermissionGrant> {
    Ok(PermissionGrant {
        id: id.parse().map_err(|e| ActionError::StorageError(format!("{e}")))?,
        handler_id,
        permission_name,
        scope: scope_from_json(&scope_json)?,
        granted_at: from_rfc3339(&granted_at)?,
        expires_at: expires_at.as_deref().map(from_rfc3339).transpose()?,
        granted_by,
        revoked,
    })
}

fn action_from_row(row: &Row) -> rusqlite::Result<ActionRequest> {
    let id: String = row.get(0)?;
    let status: String = row.get(4)?;
    let params_json: String = row.get(3)?;
    let result_json: Option<String> = row.get(5)?;
    let required_scope_json: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    let completed_at: Option<String> = row.get(10)?;

    Ok(ActionRequest {
        id: id.parse().map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                "invalid action id".into(),
            )
        })?,
        handler_id: row.get(1)?,
        action_name: row.get(2)?,
        params: serde_json::from_str::<Value>(&params_json).unwrap_or(Value::Null),
        status: ActionStatus::parse(&status).unwrap_or(ActionStatus::Pending),
        result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get(6)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        completed_at: completed_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|d| d.with_timezone(&Utc))
        }),
        required_permission_name: row.get(7)?,
        required_scope: required_scope_json.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

impl super::Store for SqliteStore {
    fn save_grant(&self, grant: PermissionGrant) -> ActionResult<GrantId> {
        let conn = self.lock();
        let scope_json = scope_to_json(&grant.scope)?;
        conn.execute(
            "INSERT INTO grants (id, handler_id, permission_name, scope_json, granted_at, expires_at, granted_by, revoked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                grant.id.to_string(),
                grant.handler_id,
                grant.permission_name,
                scope_json,
                to_rfc3339(grant.granted_at),
                grant.expires_at.map(to_rfc3339),
                grant.granted_by,
                grant.revoked as i64,
            ],
        ).map_err(|e| {
            if matches!(&e, rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation) {
                ActionError::StorageError(format!("grant id clash: {}", grant.id))
            } else {
                ActionError::from(e)
            }
        })?;
        Ok(grant.id)
    }

    fn get_active_grants(
        &self,
        handler_id: &str,
        permission_name: &str,
        now: DateTime<Utc>,
    ) -> ActionResult<Vec<PermissionGrant>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, handler_id, permission_name, scope_json, granted_at, expires_at, granted_by, revoked
             FROM grants
             WHERE handler_id = ?1 AND permission_name = ?2 AND revoked = 0
               AND (expires_at IS NULL OR expires_at > ?3)",
        )?;
        let now_str = to_rfc3339(now);
        let rows = stmt.query_map(params![handler_id, permission_name, now_str], grant_from_row)?;
        let mut grants = Vec::new();
        for row in rows {
            grants.push(build_grant(row?)?);
        }
        Ok(grants)
    }

    fn revoke_grant(&self, id: GrantId) -> ActionResult<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE grants SET revoked = 1 WHERE id = ?1 AND revoked = 0",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn list_grants(&self, handler_id: Option<&str>) -> ActionResult<Vec<PermissionGrant>> {
        let conn = self.lock();
        let base = "SELECT id, handler_id, permission_name, scope_json, granted_at, expires_at, granted_by, revoked FROM grants";
        let mut grants = Vec::new();
        if let Some(handler_id) = handler_id {
            let mut stmt = conn.prepare_cached(&format!("{base} WHERE handler_id = ?1"))?;
            let rows = stmt.query_map(params![handler_id], grant_from_row)?;
            for row in rows {
                grants.push(build_grant(row?)?);
            }
        } else {
            let mut stmt = conn.prepare_cached(base)?;
            let rows = stmt.query_map([], grant_from_row)?;
            for row in rows {
                grants.push(build_grant(row?)?);
            }
        }
        Ok(grants)
    }

    fn save_action(&self, action: ActionRequest) -> ActionResult<ActionId> {
        let conn = self.lock();
        let params_json = serde_json::to_string(&action.params)?;
        let result_json = action.result.as_ref().map(serde_json::to_string).transpose()?;
        let required_scope_json = action
            .required_scope
            .as_ref()
            .map(scope_to_json)
            .transpose()?;

        conn.execute(
            "INSERT INTO actions (id, handler_id, action_name, params_json, status, result_json, error,
                                   required_permission_name, required_scope_json, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                action.id.to_string(),
                action.handler_id,
                action.action_name,
                params_json,
                action.status.as_str(),
                result_json,
                action.error,
                action.required_permission_name,
                required_scope_json,
                to_rfc3339(action.created_at),
                action.completed_at.map(to_rfc3339),
            ],
        ).map_err(|e| {
            if matches!(&e, rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation) {
                ActionError::StorageError(format!("action id clash: {}", action.id))
            } else {
                ActionError::from(e)
            }
        })?;
        Ok(action.id)
    }

    fn update_action_status(
        &self,
        id: ActionId,
        status: ActionStatus,
        result: Option<Value>,
        error: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> ActionResult<()> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;

        let current_status: Option<String> = tx
            .query_row(
                "SELECT status FROM actions WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let current_status = current_status
            .ok_or_else(|| ActionError::UnknownAction(id.to_string()))
            .and_then(|s| {
                ActionStatus::parse(&s)
                    .ok_or_else(|| ActionError::StorageError(format!("corrupt status '{s}'")))
            })?;

        if !valid_transition(current_status, status) {
            return Err(ActionError::InvalidTransition {
                action_id: id.to_string(),
                reason: format!("{:?} -> {:?} is not a valid edge", current_status, status),
            });
        }

        let result_json = result.as_ref().map(serde_json::to_string).transpose()?;

        tx.execute(
            "UPDATE actions SET status = ?1, result_json = ?2, error = ?3, completed_at = ?4 WHERE id = ?5",
            params![
                status.as_str(),
                result_json,
                error,
                completed_at.map(to_rfc3339),
                id.to_string(),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn get_action(&self, id: ActionId) -> ActionResult<Option<ActionRequest>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, handler_id, action_name, params_json, status, result_json, error,
                    required_permission_name, required_scope_json, created_at, completed_at
             FROM actions WHERE id = ?1",
        )?;
        let action = stmt
            .query_row(params![id.to_string()], action_from_row)
            .optional()?;
        Ok(action)
    }

    fn list_pending_actions(&self) -> ActionResult<Vec<ActionRequest>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, handler_id, action_name, params_json, status, result_json, error,
                    required_permission_name, required_scope_json, created_at, completed_at
             FROM actions WHERE status = 'pending' ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], action_from_row)?;
        let mut actions = Vec::new();
        for row in rows {
            actions.push(row?);
        }
        Ok(actions)
    }

    fn list_actions_by_handler(&self, handler_id: &str) -> ActionResult<Vec<ActionRequest>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, handler_id, action_name, params_json, status, result_json, error,
                    required_permission_name, required_scope_json, created_at, completed_at
             FROM actions WHERE handler_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![handler_id], action_from_row)?;
        let mut actions = Vec::new();
        for row in rows {
            actions.push(row?);
        }
        Ok(actions)
    }
}
