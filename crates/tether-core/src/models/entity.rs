//! Entity identifiers and cached entity snapshots

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Column values of a row, keyed by field name
pub type Fields = Map<String, Value>;

/// Prefix marking identifiers generated on this device
pub const OPTIMISTIC_ID_PREFIX: &str = "local-";

/// Name of an entity kind (`transactions`, `items`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKind(String);

impl EntityKind {
    const MAX_LENGTH: usize = 64;

    pub fn new(kind: impl Into<String>) -> Result<Self, Error> {
        let kind = kind.into().trim().to_string();
        if kind.is_empty() {
            return Err(Error::InvalidInput("entity kind cannot be empty".into()));
        }
        if kind.len() > Self::MAX_LENGTH {
            return Err(Error::InvalidInput(format!(
                "entity kind exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !kind
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(Error::InvalidInput(format!(
                "entity kind '{kind}' may only contain a-z, 0-9, '-' and '_'"
            )));
        }
        Ok(Self(kind))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EntityKind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityKind> for String {
    fn from(kind: EntityKind) -> Self {
        kind.0
    }
}

/// Identifier of an entity, either optimistic (local) or server-assigned
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wrap a server-assigned or previously generated identifier
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(Error::InvalidInput("entity id cannot be empty".into()));
        }
        if id.chars().any(char::is_control) {
            return Err(Error::InvalidInput(
                "entity id contains control characters".into(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a new optimistic identifier (UUID v7, time-sortable)
    #[must_use]
    pub fn optimistic() -> Self {
        Self(format!("{OPTIMISTIC_ID_PREFIX}{}", Uuid::now_v7()))
    }

    pub fn is_optimistic(&self) -> bool {
        self.0.starts_with(OPTIMISTIC_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Versioned snapshot of a server row held in the local cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Account the row belongs to
    pub scope_id: String,
    /// Owning entity (e.g. the transaction of an item)
    pub parent_id: Option<EntityId>,
    pub fields: Fields,
    /// Server version; 0 while only known optimistically
    pub version: i64,
    pub updated_by: Option<String>,
    /// Unix ms of the last change, local or remote
    pub updated_at: i64,
    /// Unix ms of the last confirmation from the server
    pub last_synced_at: Option<i64>,
    /// Tombstone for a pending delete
    pub is_deleted: bool,
}

impl CachedEntity {
    pub fn is_optimistic(&self) -> bool {
        self.id.is_optimistic()
    }

    /// Whether the cached copy has local changes the server has not confirmed
    pub fn has_local_changes(&self) -> bool {
        self.is_optimistic()
            || self.is_deleted
            || self.last_synced_at.map_or(true, |synced| synced < self.updated_at)
    }

    /// Overlay `patch` onto the cached fields
    pub fn apply_patch(&mut self, patch: &Fields, now: i64) {
        for (key, value) in patch {
            self.fields.insert(key.clone(), value.clone());
        }
        self.updated_at = now;
    }

    /// Replace every occurrence of `from` with `to`; returns whether anything changed
    pub fn rebind(&mut self, from: &EntityId, to: &EntityId) -> bool {
        let mut changed = false;
        if &self.id == from {
            self.id = to.clone();
            changed = true;
        }
        if self.parent_id.as_ref() == Some(from) {
            self.parent_id = Some(to.clone());
            changed = true;
        }
        changed | rebind_fields(&mut self.fields, from, to)
    }
}

/// Replace string values equal to `from` with `to`, recursing into arrays and objects
pub fn rebind_fields(fields: &mut Fields, from: &EntityId, to: &EntityId) -> bool {
    let mut changed = false;
    for value in fields.values_mut() {
        changed |= rebind_value(value, from, to);
    }
    changed
}

fn rebind_value(value: &mut Value, from: &EntityId, to: &EntityId) -> bool {
    match value {
        Value::String(text) if text == from.as_str() => {
            *text = to.as_str().to_string();
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| rebind_value(item, from, to) | changed),
        Value::Object(map) => rebind_fields(map, from, to),
        _ => false,
    }
}

/// Optimistic identifiers referenced anywhere inside `fields`
pub fn optimistic_references(fields: &Fields) -> Vec<EntityId> {
    let mut found = Vec::new();
    for value in fields.values() {
        collect_optimistic(value, &mut found);
    }
    found
}

fn collect_optimistic(value: &Value, found: &mut Vec<EntityId>) {
    match value {
        Value::String(text) if text.starts_with(OPTIMISTIC_ID_PREFIX) => {
            let id = EntityId(text.clone());
            if !found.contains(&id) {
                found.push(id);
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_optimistic(item, found)),
        Value::Object(map) => map.values().for_each(|item| collect_optimistic(item, found)),
        _ => {}
    }
}
