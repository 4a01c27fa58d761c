//! Conflict records and resolution strategies

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::entity::{rebind_fields, EntityId, EntityKind, Fields};
use super::operation::OperationId;

/// Which side changed what
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides modified the same fields
    UpdateUpdate,
    /// Updated locally, deleted on the server
    UpdateDelete,
    /// Deleted locally, modified on the server
    DeleteUpdate,
}

impl ConflictType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UpdateUpdate => "update_update",
            Self::UpdateDelete => "update_delete",
            Self::DeleteUpdate => "delete_update",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update_update" => Ok(Self::UpdateUpdate),
            "update_delete" => Ok(Self::UpdateDelete),
            "delete_update" => Ok(Self::DeleteUpdate),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown conflict type '{other}'"
            ))),
        }
    }
}

/// One side of a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSide {
    /// Field values in local names
    pub data: Fields,
    /// Unix ms
    pub timestamp: i64,
    pub version: i64,
}

/// A persisted divergence between local intent and server state
///
/// There is at most one record per entity. `fields` lists every mutable field
/// that differs; for deletion conflicts it may be empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub item_id: EntityId,
    pub kind: EntityKind,
    pub conflict_type: ConflictType,
    pub fields: Vec<String>,
    pub local: ConflictSide,
    pub server: ConflictSide,
    pub parent_id: Option<EntityId>,
    /// Operation whose intent the record carries
    pub operation_id: Option<OperationId>,
    pub scope_id: String,
    pub detected_at: i64,
}

impl ConflictRecord {
    /// Fold a newer detection for the same entity into this record
    pub fn merge(&mut self, newer: Self) {
        for field in newer.fields {
            if !self.fields.contains(&field) {
                self.fields.push(field);
            }
        }
        for (key, value) in newer.local.data {
            self.local.data.insert(key, value);
        }
        self.local.timestamp = self.local.timestamp.max(newer.local.timestamp);
        self.server = newer.server;
        if newer.conflict_type != ConflictType::UpdateUpdate {
            self.conflict_type = newer.conflict_type;
        }
        self.operation_id = newer.operation_id.or(self.operation_id);
        self.detected_at = newer.detected_at;
    }

    pub fn rebind(&mut self, from: &EntityId, to: &EntityId) -> bool {
        let mut changed = false;
        if &self.item_id == from {
            self.item_id = to.clone();
            changed = true;
        }
        if self.parent_id.as_ref() == Some(from) {
            self.parent_id = Some(to.clone());
            changed = true;
        }
        changed |= rebind_fields(&mut self.local.data, from, to);
        changed | rebind_fields(&mut self.server.data, from, to)
    }
}

/// How to settle a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "value", rename_all = "snake_case")]
pub enum Resolution {
    /// Push the local values over the server's
    KeepLocal,
    /// Accept the server copy; no remote write
    KeepServer,
    /// Server copy with the named fields taken from the local side
    Merge(Vec<String>),
    /// Server copy overlaid with caller-supplied values
    Manual(Fields),
}

impl Resolution {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::KeepLocal => "keep_local",
            Self::KeepServer => "keep_server",
            Self::Merge(_) => "merge",
            Self::Manual(_) => "manual",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn side(data: serde_json::Value, version: i64) -> ConflictSide {
        ConflictSide {
            data: data.as_object().cloned().unwrap(),
            timestamp: version * 10,
            version,
        }
    }

    fn record(fields: &[&str], local: serde_json::Value, server_version: i64) -> ConflictRecord {
        ConflictRecord {
            item_id: EntityId::new("7").unwrap(),
            kind: EntityKind::new("items").unwrap(),
            conflict_type: ConflictType::UpdateUpdate,
            fields: fields.iter().map(ToString::to_string).collect(),
            local: side(local, 1),
            server: side(json!({}), server_version),
            parent_id: None,
            operation_id: None,
            scope_id: "acct".into(),
            detected_at: server_version,
        }
    }

    #[test]
    fn merge_unions_fields_and_local_values() {
        let mut first = record(&["name"], json!({"name": "a"}), 2);
        first.merge(record(&["price", "name"], json!({"price": 3}), 3));

        assert_eq!(first.fields, vec!["name".to_string(), "price".to_string()]);
        assert_eq!(first.local.data["name"], json!("a"));
        assert_eq!(first.local.data["price"], json!(3));
        assert_eq!(first.server.version, 3);
    }

    #[test]
    fn resolution_serializes_with_strategy_tag() {
        let json = serde_json::to_value(Resolution::Merge(vec!["name".into()])).unwrap();
        assert_eq!(json, json!({"strategy": "merge", "value": ["name"]}));
        let parsed: Resolution = serde_json::from_value(json!({"strategy": "keep_server"})).unwrap();
        assert_eq!(parsed, Resolution::KeepServer);
    }
}
