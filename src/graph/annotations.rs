//! Persisted side-channel annotations.
//!
//! These records only ever grow: merges append to `merge_history`, conflict
//! handling extends `conflicts`/`conflict_provenance`. Together they are
//! enough to reconstruct every input record of a merge or resolution.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{NodeId, RelationshipId};

/// Arbitrary key/value properties of a node or relationship.
pub type Properties = BTreeMap<String, Value>;

/// Provenance of the distinct values of one property: value key -> origin ids.
///
/// Keys are produced by [`value_key`].
pub type ValueProvenance = BTreeMap<String, Vec<NodeId>>;

/// Returns the provenance key of a property value: its compact JSON text.
///
/// Strings keep their quotes, so `"87"` and `87` never share a key.
#[must_use]
pub fn value_key(value: &Value) -> String {
    value.to_string()
}

/// Returns true if a value carries no information (null, blank string,
/// empty array or object).
#[must_use]
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Inserts `id` into an id list, keeping it unique and in first-seen order.
pub(crate) fn push_unique<T: PartialEq + Copy>(ids: &mut Vec<T>, id: T) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

/// What happened to one relationship during a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RewriteOutcome {
    /// Endpoint moved onto the kept node.
    Transferred,
    /// An equivalent edge already existed on the kept node; this one was folded into it.
    Collapsed {
        /// The surviving edge.
        into: RelationshipId,
    },
}

/// Record of one relationship's original endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipRewrite {
    /// The relationship as it existed before the merge.
    pub relationship_id: RelationshipId,
    /// Relationship type.
    pub rel_type: String,
    /// Source endpoint before the merge.
    pub original_source: NodeId,
    /// Target endpoint before the merge.
    pub original_target: NodeId,
    /// Properties of the relationship before the merge.
    #[serde(default)]
    pub properties: Properties,
    /// Outcome of the rewrite.
    #[serde(flatten)]
    pub outcome: RewriteOutcome,
}

/// One entry of a kept node's append-only `merge_history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    /// The surviving node.
    pub kept_node_id: NodeId,
    /// Nodes folded into the kept node by this merge.
    pub merged_node_ids: Vec<NodeId>,
    /// Alias -> ids of the input nodes that carried it (as name or alias).
    pub alias_provenance: BTreeMap<String, Vec<NodeId>>,
    /// Property -> value key -> origin ids, for every property of every input.
    pub property_provenance: BTreeMap<String, ValueProvenance>,
    /// Label -> ids of the input nodes that carried it.
    #[serde(default)]
    pub label_provenance: BTreeMap<String, Vec<NodeId>>,
    /// Original endpoints of every relationship touched by the merge.
    #[serde(default)]
    pub relationship_rewrites: Vec<RelationshipRewrite>,
    /// Number of relationships rewritten or collapsed.
    pub relationships_updated: usize,
    /// When the merge committed.
    pub timestamp: DateTime<Utc>,
}

impl MergeRecord {
    /// Returns true if `id` was folded in by this record.
    #[must_use]
    pub fn covers(&self, id: NodeId) -> bool {
        self.merged_node_ids.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_key() {
        assert_eq!(value_key(&json!("Gondor")), r#""Gondor""#);
        assert_eq!(value_key(&json!(42)), "42");
        assert_ne!(value_key(&json!("42")), value_key(&json!(42)));
        assert_ne!(value_key(&json!("true")), value_key(&json!(true)));
        assert_eq!(value_key(&json!(["a", "b"])), "[\"a\",\"b\"]");
    }

    #[test]
    fn test_is_empty_value() {
        assert!(is_empty_value(&Value::Null));
        assert!(is_empty_value(&json!("   ")));
        assert!(is_empty_value(&json!([])));
        assert!(!is_empty_value(&json!(0)));
        assert!(!is_empty_value(&json!(false)));
    }

    #[test]
    fn test_rewrite_outcome_serde() {
        let rewrite = RelationshipRewrite {
            relationship_id: RelationshipId::new(),
            rel_type: "KNOWS".to_string(),
            original_source: NodeId::new(),
            original_target: NodeId::new(),
            properties: Properties::new(),
            outcome: RewriteOutcome::Collapsed {
                into: RelationshipId::new(),
            },
        };
        let json = serde_json::to_value(&rewrite).unwrap();
        assert_eq!(json["outcome"], "collapsed");
        assert!(json["into"].is_string());
        let back: RelationshipRewrite = serde_json::from_value(json).unwrap();
        assert_eq!(back, rewrite);
    }
}
