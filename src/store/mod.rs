//! Durable persistence for grants and actions.
//!
//! A single-writer relational store over two logical tables (`grants`,
//! `actions`). All mutating operations run inside a transaction; read
//! operations are snapshot reads. The store enforces the action state
//! machine transition at the boundary — `update_action_status` fails with
//! `ActionError::InvalidTransition` if the requested edge isn't one of the
//! ones in the state machine, rather than trusting the caller.

pub mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::ActionResult;
use crate::model::{ActionId, ActionRequest, ActionStatus, GrantId, PermissionGrant};

pub trait Store: Send + Sync {
    fn save_grant(&self, grant: PermissionGrant) -> ActionResult<GrantId>;

    /// Rows where `revoked = false` and (`expires_at` is null OR `expires_at
    /// > now`). Scope matching is the caller's job (PermissionManager) — the
    /// store never interprets scope contents.
    fn get_active_grants(
        &self,
        handler_id: &str,
        permission_name: &str,
        now: DateTime<Utc>,
    ) -> ActionResult<Vec<PermissionGrant>>;

    /// Soft-delete. Idempotent — returns whether any row was modified.
    fn revoke_grant(&self, id: GrantId) -> ActionResult<bool>;

    fn list_grants(&self, handler_id: Option<&str>) -> ActionResult<Vec<PermissionGrant>>;

    fn save_action(&self, action: ActionRequest) -> ActionResult<ActionId>;

    #[allow(clippy::too_many_arguments)]
    fn update_action_status(
        &self,
        id: ActionId,
        status: ActionStatus,
        result: Option<Value>,
        error: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> ActionResult<()>;

    fn get_action(&self, id: ActionId) -> ActionResult<Option<ActionRequest>>;

    fn list_pending_actions(&self) -> ActionResult<Vec<ActionRequest>>;

    fn list_actions_by_handler(&self, handler_id: &str) -> ActionResult<Vec<ActionRequest>>;
}

/// True iff `from -> to` is a valid edge in the action state machine
/// (spec.md §4.4). Called by the store before committing a status update.
pub(crate) fn valid_transition(from: ActionStatus, to: ActionStatus) -> bool {
    use ActionStatus::*;
    matches!(
        (from, to),
        (Pending, Running) | (Pending, Failed) | (Running, Completed) | (Running, Failed)
    )
}

#[cfg(test)]
mod transition_tests {
    use super::*;
    use ActionStatus::*;

    #[test]
    fn valid_edges() {
        assert!(valid_transition(Pending, Running));
        assert!(valid_transition(Pending, Failed));
        assert!(valid_transition(Running, Completed));
        assert!(valid_transition(Running, Failed));
    }

    #[test]
    fn terminal_states_reject_everything() {
        assert!(!valid_transition(Completed, Running));
        assert!(!valid_transition(Failed, Running));
        assert!(!valid_transition(Completed, Failed));
    }

    #[test]
    fn pending_cannot_skip_to_terminal_completed() {
        assert!(!valid_transition(Pending, Completed));
    }

    #[test]
    fn running_cannot_return_to_pending() {
        assert!(!valid_transition(Running, Pending));
    }
}
