//! The plugin boundary: handlers declare permissions and perform the actual
//! side effects the core gates. Handlers are in-memory only, registered once
//! at startup, and owned by the [`HandlerRegistry`] for the process lifetime.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ActionError, ActionResult};
use crate::model::{ActionRequest, PermissionDef, Scope};

/// A plugin exposing one or more actions and declaring the permissions they
/// require. `get_required_permission` must be pure — it's called on every
/// `request_action`/`approve_action` to recompute the gate, never cached.
#[async_trait]
pub trait Handler: Send + Sync {
    fn handler_id(&self) -> &str;

    fn human_name(&self) -> &str;

    fn permissions(&self) -> Vec<PermissionDef>;

    /// Returns `(permission_name, scope)` required for this action given
    /// `params`, or `None` if the handler self-gates and the action is
    /// always permitted.
    fn get_required_permission(&self, action_name: &str, params: &Value) -> Option<(String, Scope)>;

    /// Perform the side effect. A returned `Err` is captured on the action as
    /// `FAILED` with the stringified message — it never propagates past the
    /// orchestrator.
    async fn execute(&self, action_name: &str, params: Value) -> Result<Value, String>;

    /// Opaque to the core; forwarded to UI/agent collaborators.
    fn render_request(&self, _request: &ActionRequest) -> Value {
        Value::Null
    }

    /// Opaque to the core; forwarded to UI/agent collaborators.
    fn as_tool_schema(&self) -> Value {
        Value::Null
    }
}

/// Registers handlers and resolves `handler_id -> handler`. Write-once per
/// id during normal operation — re-registering an id is a `DuplicateHandler`
/// error, not a silent overwrite.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler`. Fails with `InvalidHandler` if `handler_id` is
    /// empty or the handler declares two permissions with the same name;
    /// fails with `DuplicateHandler` if `handler_id` is already present.
    pub fn register(&mut self, handler: Box<dyn Handler>) -> ActionResult<()> {
        let id = handler.handler_id().to_string();
        if id.is_empty() {
            return Err(ActionError::InvalidHandler("handler_id must not be empty".to_string()));
        }
        if self.handlers.contains_key(&id) {
            return Err(ActionError::DuplicateHandler(id));
        }

        let mut seen = std::collections::HashSet::new();
        for def in handler.permissions() {
            if !seen.insert(def.name.clone()) {
                return Err(ActionError::InvalidHandler(format!(
                    "handler '{id}' declares duplicate permission '{}'",
                    def.name
                )));
            }
        }

        log::info!("registered handler '{}' ({})", id, handler.human_name());
        self.handlers.insert(id, handler);
        Ok(())
    }

    pub fn get(&self, handler_id: &str) -> Option<&dyn Handler> {
        self.handlers.get(handler_id).map(|b| b.as_ref())
    }

    pub fn list(&self) -> Vec<&dyn Handler> {
        let mut handlers: Vec<&dyn Handler> = self.handlers.values().map(|b| b.as_ref()).collect();
        handlers.sort_by_key(|h| h.handler_id().to_string());
        handlers
    }
}
