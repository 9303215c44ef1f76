//! Entity nodes.
//!
//! A node is a graph-store record with type labels, a primary name, aliases
//! and arbitrary properties, plus the persisted consolidation annotations.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::annotations::{is_empty_value, MergeRecord, Properties, ValueProvenance};
use super::ids::{CommunityId, NodeId};

/// An entity record.
///
/// # Examples
///
/// ```
/// use kgconsolidate::Node;
///
/// let node = Node::new("Frodo", ["Hobbit"]).with_alias("Frodo Baggins");
/// assert_eq!(node.names().count(), 2);
/// assert_eq!(node.version, 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable store id.
    pub id: NodeId,

    /// Type labels.
    #[serde(default)]
    pub labels: BTreeSet<String>,

    /// Primary name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Alternate names. After a merge: sorted and unique.
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Arbitrary key/value properties.
    #[serde(default)]
    pub properties: Properties,

    /// Append-only merge history.
    #[serde(default)]
    pub merge_history: Vec<MergeRecord>,

    /// Property -> every variant value seen for it.
    #[serde(default)]
    pub conflicts: BTreeMap<String, Vec<Value>>,

    /// Property -> value key -> origin ids.
    #[serde(default)]
    pub conflict_provenance: BTreeMap<String, ValueProvenance>,

    /// Set when the node's aliases appear in more than one community summary.
    #[serde(default)]
    pub is_bridge: bool,

    /// Communities this node bridges. Grow only.
    #[serde(default)]
    pub bridge_communities: Vec<CommunityId>,

    /// Set on an inert node left behind by a history-preserving merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<NodeId>,

    /// When the node was first created.
    pub created_at: DateTime<Utc>,

    /// When the node was last modified.
    pub updated_at: DateTime<Utc>,

    /// Version number (incremented on every write).
    pub version: u64,
}

impl Node {
    /// Creates a new node with the given name and labels.
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_id(NodeId::new(), Some(name.into()), labels)
    }

    /// Creates a node with a specific id and an optional name.
    #[must_use]
    pub fn with_id<I, S>(id: NodeId, name: Option<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            id,
            labels: labels.into_iter().map(Into::into).collect(),
            name,
            aliases: Vec::new(),
            properties: Properties::new(),
            merge_history: Vec::new(),
            conflicts: BTreeMap::new(),
            conflict_provenance: BTreeMap::new(),
            is_bridge: false,
            bridge_communities: Vec::new(),
            merged_into: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Adds an alias (builder style).
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        if !self.aliases.contains(&alias) {
            self.aliases.push(alias);
        }
        self
    }

    /// Sets a property (builder style).
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Iterates the primary name followed by the aliases, skipping blanks.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.name
            .iter()
            .map(String::as_str)
            .chain(self.aliases.iter().map(String::as_str))
            .filter(|n| !n.trim().is_empty())
    }

    /// Returns true if the node has neither a name nor an alias.
    #[must_use]
    pub fn is_nameless(&self) -> bool {
        self.names().next().is_none()
    }

    /// Returns true unless the node was folded into another one.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.merged_into.is_none()
    }

    /// Number of properties and aliases that carry information.
    #[must_use]
    pub fn richness(&self) -> usize {
        let props = self
            .properties
            .values()
            .filter(|v| !is_empty_value(v))
            .count();
        props + self.aliases.len()
    }

    /// Returns true if any merge record on this node folded in `id`.
    #[must_use]
    pub fn has_absorbed(&self, id: NodeId) -> bool {
        self.merge_history.iter().any(|r| r.covers(id))
    }

    /// Updates `updated_at` and increments the version.
    ///
    /// Call exactly once per write; the store requires `version == stored + 1`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_creation() {
        let node = Node::new("Aragorn", ["Person"]);
        assert_eq!(node.name.as_deref(), Some("Aragorn"));
        assert!(node.labels.contains("Person"));
        assert_eq!(node.version, 1);
        assert!(node.is_active());
    }

    #[test]
    fn test_names_skip_blank() {
        let node = Node::new("  ", ["Person"]).with_alias("Strider");
        let names: Vec<&str> = node.names().collect();
        assert_eq!(names, vec!["Strider"]);
    }

    #[test]
    fn test_nameless() {
        let node = Node::with_id(NodeId::new(), None, ["Thing"]);
        assert!(node.is_nameless());
    }

    #[test]
    fn test_richness_ignores_empty() {
        let node = Node::new("Aragorn", ["Person"])
            .with_alias("Strider")
            .with_property("realm", json!("Gondor"))
            .with_property("title", json!(""));
        assert_eq!(node.richness(), 2);
    }

    #[test]
    fn test_touch_bumps_version() {
        let mut node = Node::new("Aragorn", ["Person"]);
        node.touch();
        assert_eq!(node.version, 2);
    }

    #[test]
    fn test_node_serialization() {
        let node = Node::new("Aragorn", ["Person"]).with_property("realm", json!("Gondor"));
        let json = serde_json::to_string(&node).unwrap();
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, node.id);
        assert_eq!(back.properties["realm"], json!("Gondor"));
        assert!(back.merged_into.is_none());
    }
}
