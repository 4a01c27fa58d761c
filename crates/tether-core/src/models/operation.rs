//! Queued mutation intents

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::entity::{optimistic_references, rebind_fields, EntityId, EntityKind, Fields};
use crate::error::RecordedError;

/// A unique identifier for an operation, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new unique operation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of mutation an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown operation type '{other}'"
            ))),
        }
    }
}

/// A durable record of one pending mutation
///
/// Everything except the retry bookkeeping is fixed at enqueue time. The
/// identifiers and payloads change only when an optimistic id is rebound to
/// the server-assigned one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    /// Position in the queue; strictly increasing across the store's lifetime
    pub seq: i64,
    pub op_type: OperationType,
    pub kind: EntityKind,
    /// Target entity. For creates this is the optimistic id, which doubles as
    /// the idempotency key.
    pub entity_id: EntityId,
    pub parent_id: Option<EntityId>,
    /// New values of mutable fields (local names)
    pub payload: Fields,
    /// Cached values the payload replaces; the full snapshot for deletes
    pub baseline: Fields,
    pub account_id: String,
    pub user_id: String,
    /// Server version the mutation was made against
    pub base_version: Option<i64>,
    /// `updated_at` of the cached copy the mutation was made against (Unix ms)
    pub base_timestamp: Option<i64>,
    pub enqueued_at: i64,
    pub retry_count: u32,
    pub last_error: Option<RecordedError>,
    /// Earliest time of the next attempt (Unix ms); `None` means now
    pub next_attempt_at: Option<i64>,
}

impl Operation {
    /// Key the backend uses to deduplicate replayed creates
    pub fn idempotency_key(&self) -> Option<&str> {
        matches!(self.op_type, OperationType::Create).then(|| self.entity_id.as_str())
    }

    /// Optimistic identifiers this operation needs resolved before it can run
    ///
    /// A create's own optimistic id is not a dependency.
    pub fn unresolved_references(&self) -> Vec<EntityId> {
        let mut refs = optimistic_references(&self.payload);
        if self.op_type != OperationType::Create && self.entity_id.is_optimistic() {
            refs.insert(0, self.entity_id.clone());
        }
        if let Some(parent) = self.parent_id.as_ref().filter(|id| id.is_optimistic()) {
            if !refs.contains(parent) {
                refs.push(parent.clone());
            }
        }
        if self.op_type == OperationType::Create {
            refs.retain(|id| id != &self.entity_id);
        }
        refs
    }

    /// Whether the operation is waiting out a backoff delay at `now`
    pub fn is_waiting(&self, now: i64) -> bool {
        self.next_attempt_at.is_some_and(|at| at > now)
    }

    /// Replace every occurrence of `from` with `to`; returns whether anything changed
    pub fn rebind(&mut self, from: &EntityId, to: &EntityId) -> bool {
        let mut changed = false;
        if &self.entity_id == from {
            self.entity_id = to.clone();
            changed = true;
        }
        if self.parent_id.as_ref() == Some(from) {
            self.parent_id = Some(to.clone());
            changed = true;
        }
        changed |= rebind_fields(&mut self.payload, from, to);
        changed | rebind_fields(&mut self.baseline, from, to)
    }
}

/// A mutation as submitted by a caller, before identity resolution
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDraft {
    pub op_type: OperationType,
    pub kind: EntityKind,
    pub entity_id: Option<EntityId>,
    pub parent_id: Option<EntityId>,
    pub payload: Fields,
    pub account_id: Option<String>,
    pub user_id: Option<String>,
}

impl OperationDraft {
    /// Create a new entity; an optimistic id is assigned at enqueue
    pub fn create(kind: EntityKind, payload: Fields) -> Self {
        Self {
            op_type: OperationType::Create,
            kind,
            entity_id: None,
            parent_id: None,
            payload,
            account_id: None,
            user_id: None,
        }
    }

    pub fn update(kind: EntityKind, id: EntityId, patch: Fields) -> Self {
        Self {
            op_type: OperationType::Update,
            kind,
            entity_id: Some(id),
            parent_id: None,
            payload: patch,
            account_id: None,
            user_id: None,
        }
    }

    pub fn delete(kind: EntityKind, id: EntityId) -> Self {
        Self {
            op_type: OperationType::Delete,
            kind,
            entity_id: Some(id),
            parent_id: None,
            payload: Fields::new(),
            account_id: None,
            user_id: None,
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: EntityId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Supply the account and user explicitly instead of using the cached session
    #[must_use]
    pub fn with_identity(mut self, account_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self.user_id = Some(user_id.into());
        self
    }
}

/// Why an operation was moved to the failed-operation store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The backend rejected the payload
    PermanentValidation,
    /// Transient failures exceeded the retry limit
    MaxRetriesExceeded,
    /// An entity this operation references was never created
    DependencyFailed,
    /// The entity disappeared on the server and no conflict could be recorded
    MissingRemoteEntity,
}

impl FailureReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PermanentValidation => "permanent_validation",
            Self::MaxRetriesExceeded => "max_retries_exceeded",
            Self::DependencyFailed => "dependency_failed",
            Self::MissingRemoteEntity => "missing_remote_entity",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permanent_validation" => Ok(Self::PermanentValidation),
            "max_retries_exceeded" => Ok(Self::MaxRetriesExceeded),
            "dependency_failed" => Ok(Self::DependencyFailed),
            "missing_remote_entity" => Ok(Self::MissingRemoteEntity),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown failure reason '{other}'"
            ))),
        }
    }
}

/// Dead-letter record kept until the user acknowledges it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub operation: Operation,
    pub reason: FailureReason,
    /// Backend or engine message explaining the failure
    pub message: String,
    pub failed_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn operation(op_type: OperationType, entity_id: EntityId, payload: serde_json::Value) -> Operation {
        Operation {
            id: OperationId::new(),
            seq: 1,
            op_type,
            kind: EntityKind::new("items").unwrap(),
            entity_id,
            parent_id: None,
            payload: payload.as_object().cloned().unwrap(),
            baseline: Fields::new(),
            account_id: "acct".into(),
            user_id: "user".into(),
            base_version: None,
            base_timestamp: None,
            enqueued_at: 0,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }

    #[test]
    fn test_operation_id_roundtrip() {
        let id = OperationId::new();
        let parsed: OperationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn create_does_not_depend_on_itself() {
        let own = EntityId::optimistic();
        let parent = EntityId::optimistic();
        let mut op = operation(
            OperationType::Create,
            own.clone(),
            json!({"transaction_id": parent.as_str()}),
        );
        op.parent_id = Some(parent.clone());

        assert_eq!(op.unresolved_references(), vec![parent]);
        assert_eq!(op.idempotency_key(), Some(own.as_str()));
    }

    #[test]
    fn update_of_optimistic_entity_depends_on_it() {
        let target = EntityId::optimistic();
        let op = operation(OperationType::Update, target.clone(), json!({"name": "x"}));
        assert_eq!(op.unresolved_references(), vec![target]);
        assert_eq!(op.idempotency_key(), None);
    }

    #[test]
    fn rebind_clears_references() {
        let target = EntityId::optimistic();
        let real = EntityId::new("99").unwrap();
        let mut op = operation(
            OperationType::Update,
            target.clone(),
            json!({"sibling": target.as_str()}),
        );

        assert!(op.rebind(&target, &real));
        assert_eq!(op.entity_id, real);
        assert!(op.unresolved_references().is_empty());
        assert!(!op.rebind(&target, &real));
    }

    #[test]
    fn waiting_respects_next_attempt() {
        let mut op = operation(OperationType::Delete, EntityId::new("1").unwrap(), json!({}));
        assert!(!op.is_waiting(10));
        op.next_attempt_at = Some(20);
        assert!(op.is_waiting(10));
        assert!(!op.is_waiting(20));
    }
}
