//! In-memory graph store.
//!
//! A thread-safe reference implementation of [`GraphStore`] intended for
//! embedded usage and tests. Transactions apply under one write lock and are
//! rolled back from an undo log if any mutation fails.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::RwLock;

use chrono::Utc;
use tracing::debug;

use crate::graph::{
    Community, CommunityId, CommunityLink, CommunityLinkId, Node, NodeId, Relationship,
    RelationshipId,
};
use crate::storage::traits::{GraphStore, StorageError};
use crate::storage::transaction::{CommitReceipt, GraphTransaction, Mutation};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Rows kept in first-insertion order.
///
/// A removed key keeps its sequence number, so rolling back a deletion puts
/// the row back where it was.
#[derive(Debug)]
struct OrderedTable<K, V> {
    rows: BTreeMap<u64, V>,
    index: HashMap<K, u64>,
    next_seq: u64,
}

impl<K, V> Default for OrderedTable<K, V> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<K: Copy + Eq + Hash, V> OrderedTable<K, V> {
    fn get(&self, key: &K) -> Option<&V> {
        self.index.get(key).and_then(|seq| self.rows.get(seq))
    }

    fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    fn seq_of(&self, key: &K) -> Option<u64> {
        self.index.get(key).copied()
    }

    /// Sets or clears a row, returning the previous value.
    fn set(&mut self, key: K, value: Option<V>) -> Option<V> {
        match value {
            Some(v) => {
                let next = &mut self.next_seq;
                let seq = *self.index.entry(key).or_insert_with(|| {
                    let seq = *next;
                    *next += 1;
                    seq
                });
                self.rows.insert(seq, v)
            }
            None => {
                let seq = self.index.get(&key)?;
                self.rows.remove(seq)
            }
        }
    }

    fn values(&self) -> impl Iterator<Item = &V> {
        self.rows.values()
    }
}

enum Undo {
    Node(NodeId, Option<Node>),
    Relationship(RelationshipId, Option<Relationship>),
    Community(CommunityId, Option<Community>),
    Link(CommunityLinkId, Option<CommunityLink>),
}

#[derive(Debug, Default)]
struct GraphState {
    nodes: OrderedTable<NodeId, Node>,
    relationships: OrderedTable<RelationshipId, Relationship>,
    adjacency: HashMap<NodeId, BTreeSet<RelationshipId>>,
    communities: OrderedTable<CommunityId, Community>,
    links: OrderedTable<CommunityLinkId, CommunityLink>,
}

impl GraphState {
    fn unlink(&mut self, node: NodeId, rel: RelationshipId) {
        if let Some(set) = self.adjacency.get_mut(&node) {
            set.remove(&rel);
            if set.is_empty() {
                self.adjacency.remove(&node);
            }
        }
    }

    fn set_relationship(
        &mut self,
        id: RelationshipId,
        value: Option<Relationship>,
    ) -> Option<Relationship> {
        let new_ends = value.as_ref().map(|r| (r.source, r.target));
        let prev = self.relationships.set(id, value);
        if let Some(p) = &prev {
            self.unlink(p.source, id);
            self.unlink(p.target, id);
        }
        if let Some((source, target)) = new_ends {
            self.adjacency.entry(source).or_default().insert(id);
            self.adjacency.entry(target).or_default().insert(id);
        }
        prev
    }

    fn apply(&mut self, mutation: Mutation, undo: &mut Vec<Undo>) -> Result<(), StorageError> {
        match mutation {
            Mutation::PutNode(node) => {
                let node = *node;
                let expected = self.nodes.get(&node.id).map_or(1, |p| p.version + 1);
                if node.version != expected {
                    return Err(StorageError::VersionConflict {
                        id: node.id.to_string(),
                        expected,
                        actual: node.version,
                    });
                }
                let id = node.id;
                let prev = self.nodes.set(id, Some(node));
                undo.push(Undo::Node(id, prev));
            }
            Mutation::DeleteNode(id) => {
                if !self.nodes.contains(&id) {
                    return Err(StorageError::NodeNotFound(id));
                }
                if self.adjacency.get(&id).map_or(false, |s| !s.is_empty()) {
                    return Err(StorageError::BackendError(format!(
                        "cannot delete node {id}: relationships still attached"
                    )));
                }
                let prev = self.nodes.set(id, None);
                undo.push(Undo::Node(id, prev));
            }
            Mutation::PutRelationship(rel) => {
                for end in [rel.source, rel.target] {
                    if !self.nodes.contains(&end) {
                        return Err(StorageError::NodeNotFound(end));
                    }
                }
                let id = rel.id;
                let prev = self.set_relationship(id, Some(rel));
                undo.push(Undo::Relationship(id, prev));
            }
            Mutation::DeleteRelationship(id) => {
                if !self.relationships.contains(&id) {
                    return Err(StorageError::RelationshipNotFound(id));
                }
                let prev = self.set_relationship(id, None);
                undo.push(Undo::Relationship(id, prev));
            }
            Mutation::PutCommunity(community) => {
                let community = *community;
                let expected = self
                    .communities
                    .get(&community.id)
                    .map_or(1, |p| p.version + 1);
                if community.version != expected {
                    return Err(StorageError::VersionConflict {
                        id: community.id.to_string(),
                        expected,
                        actual: community.version,
                    });
                }
                let id = community.id;
                let prev = self.communities.set(id, Some(community));
                undo.push(Undo::Community(id, prev));
            }
            Mutation::PutCommunityLink(link) => {
                for end in [link.community_a, link.community_b] {
                    if !self.communities.contains(&end) {
                        return Err(StorageError::CommunityNotFound(end));
                    }
                }
                if self
                    .links
                    .values()
                    .any(|l| l.id != link.id && l.joins(link.community_a, link.community_b))
                {
                    return Err(StorageError::DuplicateKey(format!(
                        "community link {}-{}",
                        link.community_a, link.community_b
                    )));
                }
                let id = link.id;
                let prev = self.links.set(id, Some(link));
                undo.push(Undo::Link(id, prev));
            }
        }
        Ok(())
    }

    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Node(id, prev) => {
                self.nodes.set(id, prev);
            }
            Undo::Relationship(id, prev) => {
                self.set_relationship(id, prev);
            }
            Undo::Community(id, prev) => {
                self.communities.set(id, prev);
            }
            Undo::Link(id, prev) => {
                self.links.set(id, prev);
            }
        }
    }
}

/// Thread-safe in-memory graph store.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    state: RwLock<GraphState>,
}

impl InMemoryGraphStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new node.
    pub fn insert_node(&self, node: Node) -> Result<(), StorageError> {
        if self.get_node(node.id)?.is_some() {
            return Err(StorageError::DuplicateKey(node.id.to_string()));
        }
        let mut tx = GraphTransaction::new("insert_node");
        tx.put_node(node);
        self.commit(tx).map(|_| ())
    }

    /// Insert a new relationship.
    pub fn insert_relationship(&self, rel: Relationship) -> Result<(), StorageError> {
        if self.get_relationship(rel.id)?.is_some() {
            return Err(StorageError::DuplicateKey(rel.id.to_string()));
        }
        let mut tx = GraphTransaction::new("insert_relationship");
        tx.put_relationship(rel);
        self.commit(tx).map(|_| ())
    }

    /// Insert a new community.
    pub fn insert_community(&self, community: Community) -> Result<(), StorageError> {
        if self.get_community(community.id)?.is_some() {
            return Err(StorageError::DuplicateKey(community.id.to_string()));
        }
        let mut tx = GraphTransaction::new("insert_community");
        tx.put_community(community);
        self.commit(tx).map(|_| ())
    }

    /// Total number of stored relationships.
    pub fn relationship_count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("relationship_count"))?;
        Ok(state.relationships.values().count())
    }
}

impl GraphStore for InMemoryGraphStore {
    fn get_node(&self, id: NodeId) -> Result<Option<Node>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("get_node"))?;
        Ok(state.nodes.get(&id).cloned())
    }

    fn scan_nodes(&self, offset: usize, limit: usize) -> Result<Vec<Node>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("scan_nodes"))?;
        Ok(state
            .nodes
            .values()
            .filter(|n| n.is_active())
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn node_count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("node_count"))?;
        Ok(state.nodes.values().filter(|n| n.is_active()).count())
    }

    fn relationships_of(&self, id: NodeId) -> Result<Vec<Relationship>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("relationships_of"))?;
        let Some(ids) = state.adjacency.get(&id) else {
            return Ok(Vec::new());
        };
        let mut rels: Vec<(u64, Relationship)> = ids
            .iter()
            .filter_map(|rid| {
                let seq = state.relationships.seq_of(rid)?;
                state.relationships.get(rid).map(|r| (seq, r.clone()))
            })
            .collect();
        rels.sort_by_key(|(seq, _)| *seq);
        Ok(rels.into_iter().map(|(_, r)| r).collect())
    }

    fn get_relationship(&self, id: RelationshipId) -> Result<Option<Relationship>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("get_relationship"))?;
        Ok(state.relationships.get(&id).cloned())
    }

    fn get_community(&self, id: CommunityId) -> Result<Option<Community>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("get_community"))?;
        Ok(state.communities.get(&id).cloned())
    }

    fn communities(&self) -> Result<Vec<Community>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("communities"))?;
        Ok(state.communities.values().cloned().collect())
    }

    fn community_links(&self) -> Result<Vec<CommunityLink>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("community_links"))?;
        Ok(state.links.values().cloned().collect())
    }

    fn commit(&self, tx: GraphTransaction) -> Result<CommitReceipt, StorageError> {
        let label = tx.label().to_string();
        let mutations = tx.into_mutations();
        let count = mutations.len();

        let mut state = self.state.write().map_err(|_| lock_err("commit"))?;
        let mut undo: Vec<Undo> = Vec::with_capacity(count);
        for mutation in mutations {
            let kind = mutation.kind();
            if let Err(err) = state.apply(mutation, &mut undo) {
                for entry in undo.into_iter().rev() {
                    state.revert(entry);
                }
                debug!(tx = %label, mutation = kind, error = %err, "transaction rolled back");
                return Err(err);
            }
        }

        Ok(CommitReceipt {
            mutations_applied: count,
            committed_at: Utc::now(),
        })
    }
}
