//! Atomic write units.
//!
//! One merge, one conflict application or one soft-link creation is one
//! [`GraphTransaction`]. Mutations apply in order; a failing mutation rolls
//! back everything before it.

use chrono::{DateTime, Utc};

use crate::graph::{Community, CommunityLink, Node, NodeId, Relationship, RelationshipId};

/// A single write.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Insert or replace a node. Replacements must carry `version == stored + 1`.
    PutNode(Box<Node>),
    /// Delete a node. Fails while relationships are still attached.
    DeleteNode(NodeId),
    /// Insert or replace a relationship. Both endpoints must exist.
    PutRelationship(Relationship),
    /// Delete a relationship.
    DeleteRelationship(RelationshipId),
    /// Insert or replace a community. Replacements must carry `version == stored + 1`.
    PutCommunity(Box<Community>),
    /// Insert or replace a soft community link.
    PutCommunityLink(CommunityLink),
}

impl Mutation {
    /// Short stable name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PutNode(_) => "put_node",
            Self::DeleteNode(_) => "delete_node",
            Self::PutRelationship(_) => "put_relationship",
            Self::DeleteRelationship(_) => "delete_relationship",
            Self::PutCommunity(_) => "put_community",
            Self::PutCommunityLink(_) => "put_community_link",
        }
    }
}

/// An ordered, all-or-nothing list of mutations.
#[derive(Debug, Clone, Default)]
pub struct GraphTransaction {
    label: String,
    mutations: Vec<Mutation>,
}

impl GraphTransaction {
    /// Creates an empty transaction. `label` names the unit of work in logs.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            mutations: Vec::new(),
        }
    }

    /// Appends a node write.
    pub fn put_node(&mut self, node: Node) -> &mut Self {
        self.mutations.push(Mutation::PutNode(Box::new(node)));
        self
    }

    /// Appends a node deletion.
    pub fn delete_node(&mut self, id: NodeId) -> &mut Self {
        self.mutations.push(Mutation::DeleteNode(id));
        self
    }

    /// Appends a relationship write.
    pub fn put_relationship(&mut self, rel: Relationship) -> &mut Self {
        self.mutations.push(Mutation::PutRelationship(rel));
        self
    }

    /// Appends a relationship deletion.
    pub fn delete_relationship(&mut self, id: RelationshipId) -> &mut Self {
        self.mutations.push(Mutation::DeleteRelationship(id));
        self
    }

    /// Appends a community write.
    pub fn put_community(&mut self, community: Community) -> &mut Self {
        self.mutations.push(Mutation::PutCommunity(Box::new(community)));
        self
    }

    /// Appends a community link write.
    pub fn put_community_link(&mut self, link: CommunityLink) -> &mut Self {
        self.mutations.push(Mutation::PutCommunityLink(link));
        self
    }

    /// The unit-of-work label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of queued mutations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// The queued mutations, in order.
    #[must_use]
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Consumes the transaction.
    #[must_use]
    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }
}

/// Acknowledgement of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Number of mutations applied.
    pub mutations_applied: usize,
    /// When the commit happened.
    pub committed_at: DateTime<Utc>,
}
