//! Scope matching, grant lifecycle, and expiration evaluation — stateless
//! logic layered over the [`Store`](crate::store::Store). Time is injected
//! via [`Clock`] so tests can advance it instead of racing the wall clock.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use crate::clock::Clock;
use crate::error::{ActionError, ActionResult};
use crate::handler::HandlerRegistry;
use crate::model::{Expiration, GrantId, PermissionGrant, Scope};
use crate::store::Store;

pub struct PermissionManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl PermissionManager {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// True iff any active, unexpired grant matches `(handler_id,
    /// permission_name, scope)` under the asymmetric scope rule: every key in
    /// a grant's scope must be present and equal in `scope`; an empty grant
    /// scope (handler-wide) matches anything.
    pub fn check(&self, handler_id: &str, permission_name: &str, scope: &Scope) -> ActionResult<bool> {
        let now = self.clock.now();
        let grants = self.store.get_active_grants(handler_id, permission_name, now)?;
        Ok(grants.iter().any(|g| g.is_active(now) && g.matches_scope(scope)))
    }

    /// Validates `permission_name` is declared by `handler_id` and that
    /// `scope`'s keys are a subset of that permission's `parameter_schema`,
    /// then persists a grant with `expiration` resolved to an absolute
    /// `expires_at` via the injected clock.
    pub fn grant(
        &self,
        registry: &HandlerRegistry,
        handler_id: &str,
        permission_name: &str,
        scope: Scope,
        expiration: Expiration,
        granted_by: &str,
    ) -> ActionResult<GrantId> {
        self.validate_scope(registry, handler_id, permission_name, &scope)?;

        let now = self.clock.now();
        let expires_at = match expiration {
            Expiration::OneHour => Some(now + Duration::seconds(3600)),
            Expiration::Today => Some(next_utc_midnight_after(now)),
            Expiration::Indefinite => None,
        };

        let grant = PermissionGrant {
            id: GrantId::new(),
            handler_id: handler_id.to_string(),
            permission_name: permission_name.to_string(),
            scope,
            granted_at: now,
            expires_at,
            granted_by: granted_by.to_string(),
            revoked: false,
        };

        let id = self.store.save_grant(grant)?;
        log::info!("granted '{permission_name}' to handler '{handler_id}' (grant {id})");
        Ok(id)
    }

    pub fn revoke(&self, grant_id: GrantId) -> ActionResult<bool> {
        let revoked = self.store.revoke_grant(grant_id)?;
        if revoked {
            log::info!("revoked grant {grant_id}");
        }
        Ok(revoked)
    }

    pub fn list_grants(&self, handler_id: Option<&str>) -> ActionResult<Vec<PermissionGrant>> {
        self.store.list_grants(handler_id)
    }

    fn validate_scope(
        &self,
        registry: &HandlerRegistry,
        handler_id: &str,
        permission_name: &str,
        scope: &Scope,
    ) -> ActionResult<()> {
        let handler = registry
            .get(handler_id)
            .ok_or_else(|| ActionError::UnknownHandler(handler_id.to_string()))?;

        let def = handler
            .permissions()
            .into_iter()
            .find(|p| p.name == permission_name)
            .ok_or_else(|| ActionError::UnknownPermission {
                handler_id: handler_id.to_string(),
                permission: permission_name.to_string(),
            })?;

        for key in scope.keys() {
            if !def.parameter_schema.contains_key(key) {
                return Err(ActionError::UnknownScopeKey {
                    permission: permission_name.to_string(),
                    key: key.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Next UTC midnight strictly after `now` (spec.md §9 fixes `TODAY` to UTC,
/// resolving the source's inconsistent timezone handling).
fn next_utc_midnight_after(now: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
    let tomorrow = now.date_naive().succ_opt().expect("date overflow");
    Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).expect("valid midnight"))
}
