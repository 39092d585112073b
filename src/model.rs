//! Entities shared by the Store, PermissionManager, and ActionSystem.
//!
//! `Scope` and `Params` use canonical (sorted-key) representations so scope
//! equality and store round-trips are both deterministic, per the source's
//! loose key/value mappings (spec.md §9).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A small string-to-string map qualifying a permission, e.g.
/// `{"recipient": "alice@example.com"}`. `BTreeMap` keeps keys sorted so
/// two scopes built in different orders compare and serialize identically.
pub type Scope = BTreeMap<String, String>;

/// Action parameters / results — arbitrary JSON-serializable data.
pub type Params = Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantId(pub Uuid);

impl GrantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GrantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GrantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for GrantId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub Uuid);

impl ActionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ActionId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A permission a handler declares statically. `parameter_schema` maps a
/// recognized scope key to a human description; keys outside this set are
/// rejected from grants and checks as `UnknownScopeKey`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDef {
    pub name: String,
    pub description: String,
    pub parameter_schema: BTreeMap<String, String>,
}

impl PermissionDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_schema: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, description: impl Into<String>) -> Self {
        self.parameter_schema.insert(key.into(), description.into());
        self
    }
}

/// How long a newly-granted permission should last. Translated to an
/// absolute `expires_at` by `PermissionManager::grant` using the injected
/// clock: `OneHour` = now + 3600s, `Today` = next UTC midnight strictly
/// after now, `Indefinite` = no expiration (sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expiration {
    OneHour,
    Today,
    Indefinite,
}

/// A durable row asserting that `permission_name` with `scope` has been
/// authorized for `handler_id` until `expires_at` (or indefinitely).
/// Revocation is a soft delete — the row is retained for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub id: GrantId,
    pub handler_id: String,
    pub permission_name: String,
    pub scope: Scope,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_by: String,
    pub revoked: bool,
}

impl PermissionGrant {
    /// True iff not revoked and not expired as of `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at.map_or(true, |exp| exp > now)
    }

    /// The asymmetric scope-matching rule (spec.md §4.2): every key in this
    /// grant's scope must be present and equal in `check_scope`. Keys present
    /// only in `check_scope` are ignored — the grant may be wider than the
    /// check. An empty grant scope matches any check.
    pub fn matches_scope(&self, check_scope: &Scope) -> bool {
        self.scope
            .iter()
            .all(|(k, v)| check_scope.get(k).is_some_and(|cv| cv == v))
    }
}

/// Lifecycle state of an `ActionRequest`. `Expired` is reserved for a future
/// reaper and is never produced by this implementation (spec.md §4.4/§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Expired,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionStatus::Completed | ActionStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Running => "running",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ActionStatus::Pending,
            "running" => ActionStatus::Running,
            "completed" => ActionStatus::Completed,
            "failed" => ActionStatus::Failed,
            "expired" => ActionStatus::Expired,
            _ => return None,
        })
    }
}

/// A requested invocation of a handler's side-effecting operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub id: ActionId,
    pub handler_id: String,
    pub action_name: String,
    pub params: Params,
    pub status: ActionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub required_permission_name: Option<String>,
    pub required_scope: Option<Scope>,
}
