//! The public orchestrator: wires the Store, PermissionManager,
//! HandlerRegistry, and EventBus into the action lifecycle state machine.
//!
//! Every public method acquires a single `tokio::sync::Mutex` around the
//! orchestrator's mutable state for its entire duration — including the
//! handler's `execute` call — matching the teacher's single-lock-around-
//! every-mutating-call shape (`Arc<RwLock<PluginManager>>` in `AppState`),
//! collapsed to one mutex because every public operation here can mutate.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::error::{ActionError, ActionResult};
use crate::event_bus::{EventBus, Topic};
use crate::handler::{Handler, HandlerRegistry};
use crate::model::{ActionId, ActionRequest, ActionStatus, Expiration, GrantId, PermissionGrant, Scope};
use crate::permission_manager::PermissionManager;
use crate::store::Store;

/// What a call that may execute or enqueue an action hands back to the
/// caller. `result`/`error` are populated only once `status` is terminal.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub action_id: ActionId,
    pub status: ActionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub required_permission_name: Option<String>,
    pub required_scope: Option<Scope>,
}

struct Inner {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    permissions: PermissionManager,
    registry: HandlerRegistry,
}

pub struct ActionSystem {
    inner: Mutex<Inner>,
    events: Arc<EventBus>,
}

impl ActionSystem {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, events: Arc<EventBus>) -> Self {
        let permissions = PermissionManager::new(store.clone(), clock.clone());
        Self {
            inner: Mutex::new(Inner {
                store,
                clock,
                permissions,
                registry: HandlerRegistry::new(),
            }),
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub async fn register_handler(&self, handler: Box<dyn Handler>) -> ActionResult<()> {
        let mut inner = self.inner.lock().await;
        inner.registry.register(handler)
    }

    pub async fn grant_permission(
        &self,
        handler_id: &str,
        permission_name: &str,
        scope: Scope,
        expiration: Expiration,
        granted_by: &str,
    ) -> ActionResult<GrantId> {
        let inner = self.inner.lock().await;
        let id = inner
            .permissions
            .grant(&inner.registry, handler_id, permission_name, scope, expiration, granted_by)?;

        if let Some(grant) = find_grant(&inner, handler_id, id)? {
            self.events.emit(Topic::PermissionGranted, serde_json::to_value(&grant)?);
        }
        Ok(id)
    }

    pub async fn revoke_permission(&self, grant_id: GrantId) -> ActionResult<bool> {
        let inner = self.inner.lock().await;
        let revoked = inner.permissions.revoke(grant_id)?;
        if revoked {
            if let Some(grant) = find_grant(&inner, "", grant_id)? {
                self.events.emit(Topic::PermissionRevoked, serde_json::to_value(&grant)?);
            } else {
                self.events
                    .emit(Topic::PermissionRevoked, serde_json::json!({ "id": grant_id.to_string() }));
            }
        }
        Ok(revoked)
    }

    pub async fn check_permission(&self, handler_id: &str, permission_name: &str, scope: &Scope) -> ActionResult<bool> {
        let inner = self.inner.lock().await;
        inner.permissions.check(handler_id, permission_name, scope)
    }

    pub async fn request_action(&self, handler_id: &str, action_name: &str, params: Value) -> ActionResult<ActionOutcome> {
        let mut inner = self.inner.lock().await;

        let gate = {
            let handler = inner
                .registry
                .get(handler_id)
                .ok_or_else(|| ActionError::UnknownHandler(handler_id.to_string()))?;
            handler.get_required_permission(action_name, &params)
        };

        let permitted = match &gate {
            Some((permission_name, scope)) => inner.permissions.check(handler_id, permission_name, scope)?,
            None => true,
        };

        let now = inner.clock.now();
        let (required_permission_name, required_scope) = match &gate {
            Some((name, scope)) => (Some(name.clone()), Some(scope.clone())),
            None => (None, None),
        };

        let action = ActionRequest {
            id: ActionId::new(),
            handler_id: handler_id.to_string(),
            action_name: action_name.to_string(),
            params,
            status: if permitted { ActionStatus::Running } else { ActionStatus::Pending },
            result: None,
            error: None,
            created_at: now,
            completed_at: None,
            required_permission_name,
            required_scope,
        };
        inner.store.save_action(action.clone())?;

        if !permitted {
            log::info!("action {} enqueued pending permission", action.id);
            self.events.emit(Topic::ActionEnqueued, serde_json::to_value(&action)?);
            self.events.emit(
                Topic::PermissionNeeded,
                serde_json::json!({
                    "handler_id": handler_id,
                    "permission_name": gate.as_ref().map(|(n, _)| n.clone()),
                    "scope": gate.as_ref().map(|(_, s)| s.clone()),
                }),
            );
            return Ok(ActionOutcome {
                action_id: action.id,
                status: ActionStatus::Pending,
                result: None,
                error: None,
                required_permission_name: action.required_permission_name,
                required_scope: action.required_scope,
            });
        }

        self.run_action(&mut inner, action).await
    }

    pub async fn approve_action(&self, action_id: ActionId) -> ActionResult<ActionOutcome> {
        let mut inner = self.inner.lock().await;

        let action = inner
            .store
            .get_action(action_id)?
            .ok_or_else(|| ActionError::UnknownAction(action_id.to_string()))?;

        if action.status != ActionStatus::Pending {
            return Err(ActionError::InvalidTransition {
                action_id: action_id.to_string(),
                reason: format!("cannot approve action in status {:?}", action.status),
            });
        }

        let permitted = match (&action.required_permission_name, &action.required_scope) {
            (Some(name), Some(scope)) => inner.permissions.check(&action.handler_id, name, scope)?,
            _ => true,
        };

        if !permitted {
            return Err(ActionError::PermissionStillMissing(action_id.to_string()));
        }

        inner
            .store
            .update_action_status(action_id, ActionStatus::Running, None, None, None)?;
        let mut running = action;
        running.status = ActionStatus::Running;

        self.run_action(&mut inner, running).await
    }

    pub async fn deny_action(&self, action_id: ActionId, reason: &str) -> ActionResult<ActionOutcome> {
        let inner = self.inner.lock().await;

        let action = inner
            .store
            .get_action(action_id)?
            .ok_or_else(|| ActionError::UnknownAction(action_id.to_string()))?;

        if action.status != ActionStatus::Pending {
            return Err(ActionError::InvalidTransition {
                action_id: action_id.to_string(),
                reason: format!("cannot deny action in status {:?}", action.status),
            });
        }

        let now = inner.clock.now();
        let error = format!("denied: {reason}");
        inner
            .store
            .update_action_status(action_id, ActionStatus::Failed, None, Some(error.clone()), Some(now))?;

        let mut failed = action;
        failed.status = ActionStatus::Failed;
        failed.error = Some(error.clone());
        failed.completed_at = Some(now);

        log::info!("action {action_id} denied: {reason}");
        self.events.emit(Topic::ActionFailed, serde_json::to_value(&failed)?);

        Ok(ActionOutcome {
            action_id,
            status: ActionStatus::Failed,
            result: None,
            error: Some(error),
            required_permission_name: failed.required_permission_name,
            required_scope: failed.required_scope,
        })
    }

    pub async fn get_action(&self, action_id: ActionId) -> ActionResult<Option<ActionRequest>> {
        let inner = self.inner.lock().await;
        inner.store.get_action(action_id)
    }

    pub async fn list_pending_actions(&self) -> ActionResult<Vec<ActionRequest>> {
        let inner = self.inner.lock().await;
        inner.store.list_pending_actions()
    }

    /// Runs `handler.execute` for an action already persisted as `RUNNING`,
    /// finalizes it to `COMPLETED`/`FAILED`, and emits the matching event.
    /// Shared by `request_action`'s immediate-execute path and
    /// `approve_action`.
    async fn run_action(&self, inner: &mut Inner, action: ActionRequest) -> ActionResult<ActionOutcome> {
        let handler = inner
            .registry
            .get(&action.handler_id)
            .ok_or_else(|| ActionError::UnknownHandler(action.handler_id.clone()))?;

        let outcome = handler.execute(&action.action_name, action.params.clone()).await;
        let now = inner.clock.now();

        match outcome {
            Ok(result) => {
                inner.store.update_action_status(
                    action.id,
                    ActionStatus::Completed,
                    Some(result.clone()),
                    None,
                    Some(now),
                )?;
                let mut completed = action;
                completed.status = ActionStatus::Completed;
                completed.result = Some(result.clone());
                completed.completed_at = Some(now);

                log::info!("action {} completed", completed.id);
                self.events.emit(Topic::ActionCompleted, serde_json::to_value(&completed)?);

                Ok(ActionOutcome {
                    action_id: completed.id,
                    status: ActionStatus::Completed,
                    result: Some(result),
                    error: None,
                    required_permission_name: completed.required_permission_name,
                    required_scope: completed.required_scope,
                })
            }
            Err(message) => {
                inner.store.update_action_status(
                    action.id,
                    ActionStatus::Failed,
                    None,
                    Some(message.clone()),
                    Some(now),
                )?;
                let mut failed = action;
                failed.status = ActionStatus::Failed;
                failed.error = Some(message.clone());
                failed.completed_at = Some(now);

                log::warn!("action {} failed: {}", failed.id, message);
                self.events.emit(Topic::ActionFailed, serde_json::to_value(&failed)?);

                Ok(ActionOutcome {
                    action_id: failed.id,
                    status: ActionStatus::Failed,
                    result: None,
                    error: Some(message),
                    required_permission_name: failed.required_permission_name,
                    required_scope: failed.required_scope,
                })
            }
        }
    }
}

/// Looks up a single grant by id for event-payload purposes. `handler_id`
/// narrows the scan when known; pass `""` to scan every handler.
fn find_grant(inner: &Inner, handler_id: &str, id: GrantId) -> ActionResult<Option<PermissionGrant>> {
    let scope = if handler_id.is_empty() { None } else { Some(handler_id) };
    let grants = inner.store.list_grants(scope)?;
    Ok(grants.into_iter().find(|g| g.id == id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::PermissionDef;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        fn handler_id(&self) -> &str {
            "echo"
        }
        fn human_name(&self) -> &str {
            "Echo"
        }
        fn permissions(&self) -> Vec<PermissionDef> {
            vec![PermissionDef::new("speak", "say things").with_param("topic", "topic filter")]
        }
        fn get_required_permission(&self, _action_name: &str, params: &Value) -> Option<(String, Scope)> {
            let topic = params.get("topic")?.as_str()?.to_string();
            let mut scope = Scope::new();
            scope.insert("topic".to_string(), topic);
            Some(("speak".to_string(), scope))
        }
        async fn execute(&self, _action_name: &str, params: Value) -> Result<Value, String> {
            let text = params.get("text").and_then(|v| v.as_str()).unwrap_or_default();
            Ok(serde_json::json!({ "echoed": text }))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl Handler for FailingHandler {
        fn handler_id(&self) -> &str {
            "boom"
        }
        fn human_name(&self) -> &str {
            "Boom"
        }
        fn permissions(&self) -> Vec<PermissionDef> {
            vec![]
        }
        fn get_required_permission(&self, _action_name: &str, _params: &Value) -> Option<(String, Scope)> {
            None
        }
        async fn execute(&self, _action_name: &str, _params: Value) -> Result<Value, String> {
            Err("boom".to_string())
        }
    }

    async fn harness() -> (ActionSystem, Arc<ManualClock>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(":memory:").unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let events = Arc::new(EventBus::new());
        let system = ActionSystem::new(store, clock.clone(), events);
        system.register_handler(Box::new(EchoHandler)).await.unwrap();
        system.register_handler(Box::new(FailingHandler)).await.unwrap();
        (system, clock)
    }

    #[tokio::test]
    async fn immediate_execute_with_matching_grant() {
        let (system, _clock) = harness().await;
        let mut scope = Scope::new();
        scope.insert("topic".to_string(), "hello".to_string());
        system
            .grant_permission("echo", "speak", scope, Expiration::Indefinite, "user")
            .await
            .unwrap();

        let outcome = system
            .request_action("echo", "say", serde_json::json!({"topic": "hello", "text": "hi"}))
            .await
            .unwrap();

        assert_eq!(outcome.status, ActionStatus::Completed);
        assert_eq!(outcome.result.unwrap()["echoed"], "hi");
    }

    #[tokio::test]
    async fn enqueue_then_approve_full_event_sequence() {
        let (system, _clock) = harness().await;
        let order: Arc<std::sync::Mutex<Vec<&'static str>>> = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o = order.clone();
        system.events().on(Topic::ActionEnqueued, move |_| o.lock().unwrap().push("enqueued"));
        let o = order.clone();
        system
            .events()
            .on(Topic::PermissionNeeded, move |_| o.lock().unwrap().push("needed"));
        let o = order.clone();
        system
            .events()
            .on(Topic::PermissionGranted, move |_| o.lock().unwrap().push("granted"));
        let o = order.clone();
        system
            .events()
            .on(Topic::ActionCompleted, move |_| o.lock().unwrap().push("completed"));

        let outcome = system
            .request_action("echo", "say", serde_json::json!({"topic": "hello", "text": "hi"}))
            .await
            .unwrap();
        assert_eq!(outcome.status, ActionStatus::Pending);

        let mut scope = Scope::new();
        scope.insert("topic".to_string(), "hello".to_string());
        system
            .grant_permission("echo", "speak", scope, Expiration::Indefinite, "user")
            .await
            .unwrap();

        let approved = system.approve_action(outcome.action_id).await.unwrap();
        assert_eq!(approved.status, ActionStatus::Completed);

        assert_eq!(*order.lock().unwrap(), vec!["enqueued", "needed", "granted", "completed"]);
    }

    #[tokio::test]
    async fn scope_mismatch_keeps_pending() {
        let (system, _clock) = harness().await;
        let mut scope = Scope::new();
        scope.insert("topic".to_string(), "world".to_string());
        system
            .grant_permission("echo", "speak", scope, Expiration::Indefinite, "user")
            .await
            .unwrap();

        let outcome = system
            .request_action("echo", "say", serde_json::json!({"topic": "hello"}))
            .await
            .unwrap();
        assert_eq!(outcome.status, ActionStatus::Pending);

        let err = system.approve_action(outcome.action_id).await.unwrap_err();
        assert!(matches!(err, ActionError::PermissionStillMissing(_)));

        let still = system.get_action(outcome.action_id).await.unwrap().unwrap();
        assert_eq!(still.status, ActionStatus::Pending);
    }

    #[tokio::test]
    async fn empty_scope_grant_permits_any_topic() {
        let (system, _clock) = harness().await;
        system
            .grant_permission("echo", "speak", Scope::new(), Expiration::Indefinite, "user")
            .await
            .unwrap();

        let outcome = system
            .request_action("echo", "say", serde_json::json!({"topic": "anything"}))
            .await
            .unwrap();
        assert_eq!(outcome.status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn expired_grant_falls_back_to_pending() {
        let (system, clock) = harness().await;
        let mut scope = Scope::new();
        scope.insert("topic".to_string(), "hello".to_string());
        system
            .grant_permission("echo", "speak", scope, Expiration::OneHour, "user")
            .await
            .unwrap();

        clock.advance(Duration::seconds(3601));

        let outcome = system
            .request_action("echo", "say", serde_json::json!({"topic": "hello"}))
            .await
            .unwrap();
        assert_eq!(outcome.status, ActionStatus::Pending);
    }

    #[tokio::test]
    async fn handler_failure_yields_failed_and_blocks_further_transitions() {
        let (system, _clock) = harness().await;
        let outcome = system.request_action("boom", "anything", serde_json::json!({})).await.unwrap();
        assert_eq!(outcome.status, ActionStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("boom"));

        let err = system.approve_action(outcome.action_id).await.unwrap_err();
        assert!(matches!(err, ActionError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn deny_action_transitions_pending_to_failed() {
        let (system, _clock) = harness().await;
        let outcome = system
            .request_action("echo", "say", serde_json::json!({"topic": "hello"}))
            .await
            .unwrap();
        assert_eq!(outcome.status, ActionStatus::Pending);

        let denied = system.deny_action(outcome.action_id, "not today").await.unwrap();
        assert_eq!(denied.status, ActionStatus::Failed);
        assert_eq!(denied.error.as_deref(), Some("denied: not today"));

        let err = system.deny_action(outcome.action_id, "again").await.unwrap_err();
        assert!(matches!(err, ActionError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn unregistered_handler_is_rejected_before_any_row_written() {
        let (system, _clock) = harness().await;
        let err = system
            .request_action("ghost", "anything", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::UnknownHandler(_)));

        let pending = system.list_pending_actions().await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn subscriber_count_reflects_registrations() {
        let events = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        events.on(Topic::ActionCompleted, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        events.emit(Topic::ActionCompleted, serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
