//! Relationships (edges) between nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::annotations::Properties;
use super::ids::{NodeId, RelationshipId};

/// A typed, directed edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Stable store id.
    pub id: RelationshipId,
    /// Relationship type, e.g. `KNOWS`.
    pub rel_type: String,
    /// Source endpoint.
    pub source: NodeId,
    /// Target endpoint.
    pub target: NodeId,
    /// Edge properties.
    #[serde(default)]
    pub properties: Properties,
    /// When the edge was created.
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    /// Creates a new edge without properties.
    #[must_use]
    pub fn new(rel_type: impl Into<String>, source: NodeId, target: NodeId) -> Self {
        Self {
            id: RelationshipId::new(),
            rel_type: rel_type.into(),
            source,
            target,
            properties: Properties::new(),
            created_at: Utc::now(),
        }
    }

    /// Sets a property (builder style).
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Returns true if `id` is either endpoint.
    #[must_use]
    pub fn touches(&self, id: NodeId) -> bool {
        self.source == id || self.target == id
    }

    /// Returns the endpoint opposite to `id`, if `id` is an endpoint.
    #[must_use]
    pub fn other_end(&self, id: NodeId) -> Option<NodeId> {
        if self.source == id {
            Some(self.target)
        } else if self.target == id {
            Some(self.source)
        } else {
            None
        }
    }

    /// Same type, same endpoints and same properties.
    ///
    /// Edges that differ only by id are parallel duplicates; edges with
    /// distinguishing properties are not.
    #[must_use]
    pub fn is_parallel_to(&self, other: &Self) -> bool {
        self.rel_type == other.rel_type
            && self.source == other.source
            && self.target == other.target
            && self.properties == other.properties
    }
}
