//! Abstract storage contract for the graph store collaborator.
//!
//! The engine owns no storage of its own: every read goes through
//! [`GraphStore`] and every write is one atomic [`GraphTransaction`].
//! By using a trait, we enable:
//! - In-memory backends for testing and embedded use
//! - Adapters over an external property-graph database

use thiserror::Error;

use crate::graph::{
    Community, CommunityId, CommunityLink, Node, NodeId, Relationship, RelationshipId,
};
use crate::storage::transaction::{CommitReceipt, GraphTransaction};

/// Errors that can occur during storage operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Node not found.
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Relationship not found.
    #[error("Relationship not found: {0}")]
    RelationshipNotFound(RelationshipId),

    /// Community not found.
    #[error("Community not found: {0}")]
    CommunityNotFound(CommunityId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Optimistic concurrency check failed; the record changed since it was read.
    #[error("Version conflict on {id}: expected version {expected}, got {actual}")]
    VersionConflict {
        /// Record id.
        id: String,
        /// Version the store would accept.
        expected: u64,
        /// Version carried by the write.
        actual: u64,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Storage trait for the property graph.
///
/// # Safety Considerations
/// - `commit` must be atomic: every mutation applies or none does
/// - Implementations must handle concurrent access safely
pub trait GraphStore: Send + Sync {
    /// Get a node by id, including inert merged nodes.
    fn get_node(&self, id: NodeId) -> Result<Option<Node>, StorageError>;

    /// Page through active nodes in stable insertion order.
    fn scan_nodes(&self, offset: usize, limit: usize) -> Result<Vec<Node>, StorageError>;

    /// Number of active nodes.
    fn node_count(&self) -> Result<usize, StorageError>;

    /// All relationships with `id` as an endpoint.
    fn relationships_of(&self, id: NodeId) -> Result<Vec<Relationship>, StorageError>;

    /// Get a relationship by id.
    fn get_relationship(&self, id: RelationshipId) -> Result<Option<Relationship>, StorageError>;

    /// Get a community by id.
    fn get_community(&self, id: CommunityId) -> Result<Option<Community>, StorageError>;

    /// All communities in stable insertion order.
    fn communities(&self) -> Result<Vec<Community>, StorageError>;

    /// All persisted community links.
    fn community_links(&self) -> Result<Vec<CommunityLink>, StorageError>;

    /// Apply a transaction atomically.
    fn commit(&self, tx: GraphTransaction) -> Result<CommitReceipt, StorageError>;

    /// Read several nodes; missing ids are skipped.
    fn get_nodes(&self, ids: &[NodeId]) -> Result<Vec<Node>, StorageError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.get_node(*id)? {
                out.push(node);
            }
        }
        Ok(out)
    }

    /// Read every active node, one page of `batch_size` at a time.
    fn scan_all_nodes(&self, batch_size: usize) -> Result<Vec<Node>, StorageError> {
        let batch_size = batch_size.max(1);
        let mut out = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.scan_nodes(offset, batch_size)?;
            let len = page.len();
            out.extend(page);
            if len < batch_size {
                return Ok(out);
            }
            offset += len;
        }
    }

    /// Communities that list `id` as a member.
    fn communities_of(&self, id: NodeId) -> Result<Vec<Community>, StorageError> {
        Ok(self
            .communities()?
            .into_iter()
            .filter(|c| c.members.contains(&id))
            .collect())
    }
}
