//! Error taxonomy for the authorization + queued-execution kernel.

/// Errors produced by the Store, PermissionManager, HandlerRegistry, and
/// ActionSystem. Referent/validation errors (`Unknown*`, `InvalidTransition`)
/// are raised before any row is written or mutated. `HandlerExecutionError`
/// is captured onto the failing action rather than propagated to the caller
/// of `request_action`/`approve_action`. `StorageError` propagates as-is —
/// persistence failures mean durability can't be guaranteed.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("unknown handler: {0}")]
    UnknownHandler(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("unknown permission '{permission}' for handler '{handler_id}'")]
    UnknownPermission {
        handler_id: String,
        permission: String,
    },

    #[error("unknown grant: {0}")]
    UnknownGrant(String),

    #[error("unknown scope key '{key}' for permission '{permission}'")]
    UnknownScopeKey { permission: String, key: String },

    #[error("handler '{0}' is already registered")]
    DuplicateHandler(String),

    #[error("invalid handler registration: {0}")]
    InvalidHandler(String),

    #[error("invalid state transition for action {action_id}: {reason}")]
    InvalidTransition { action_id: String, reason: String },

    #[error("permission still missing for action {0}")]
    PermissionStillMissing(String),

    #[error("handler execution failed: {0}")]
    HandlerExecutionError(String),

    #[error("storage error: {0}")]
    StorageError(String),
}

pub type ActionResult<T> = Result<T, ActionError>;

impl From<rusqlite::Error> for ActionError {
    fn from(err: rusqlite::Error) -> Self {
        ActionError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for ActionError {
    fn from(err: serde_json::Error) -> Self {
        ActionError::StorageError(err.to_string())
    }
}
