//! Non-destructive node merging.
//!
//! A merge folds a duplicate group into one kept node inside a single store
//! transaction. Nothing is lost: aliases are unioned, every distinct property
//! value is retained (the representative under `properties`, all variants
//! under `conflicts`), relationships move to the kept node, and a merge record
//! with full provenance is appended to the kept node's history.

mod values;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{KeptNodeSelection, MergeConfig, MergeMode};
use crate::detection::DuplicateGroup;
use crate::error::{ConsolidationError, ConsolidationResult, ValidationError};
use crate::graph::{
    push_unique, MergeRecord, Node, NodeId, Relationship, RelationshipId, RelationshipRewrite,
    RewriteOutcome, ValueProvenance,
};
use crate::storage::{GraphStore, GraphTransaction, NodeLockGuard, NodeLockTable};

pub(crate) use values::{collect_node_variants, VariantSet};

/// Merged value of one property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MergedValue {
    /// Every input agreed.
    Unique(Value),
    /// Inputs disagreed; every distinct variant, first-seen order.
    Variants(Vec<Value>),
}

/// Outcome of one merge call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    /// The surviving node.
    pub kept_node_id: NodeId,
    /// Nodes folded into the kept node, input order.
    pub merged_node_ids: Vec<NodeId>,
    /// Property -> merged value.
    pub merged_properties: BTreeMap<String, MergedValue>,
    /// Relationships rewritten or collapsed.
    pub relationships_updated: usize,
    /// True when the merge had already landed and nothing was written.
    #[serde(default)]
    pub already_applied: bool,
}

/// Merges duplicate groups.
pub struct NodeMerger {
    store: Arc<dyn GraphStore>,
    locks: Arc<NodeLockTable>,
    config: MergeConfig,
}

impl std::fmt::Debug for NodeMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMerger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NodeMerger {
    /// Creates a merger with its own lock table.
    #[must_use]
    pub fn new(store: Arc<dyn GraphStore>, config: MergeConfig) -> Self {
        Self::with_locks(store, Arc::new(NodeLockTable::new()), config)
    }

    /// Creates a merger sharing `locks` with other writers.
    #[must_use]
    pub fn with_locks(
        store: Arc<dyn GraphStore>,
        locks: Arc<NodeLockTable>,
        config: MergeConfig,
    ) -> Self {
        Self {
            store,
            locks,
            config,
        }
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Merges a detected group, letting the configuration pick the kept node.
    pub fn merge_group(&self, group: &DuplicateGroup) -> ConsolidationResult<MergeResult> {
        self.merge(&group.node_ids, None)
    }

    /// Merges `node_ids` into one node.
    ///
    /// Needs at least two distinct ids; `kept_id`, when given, must be one of
    /// them. The whole merge is one transaction: on any failure nothing is
    /// written. Calling again after a merge landed returns the recorded result
    /// with `already_applied` set and writes nothing.
    pub fn merge(
        &self,
        node_ids: &[NodeId],
        kept_id: Option<NodeId>,
    ) -> ConsolidationResult<MergeResult> {
        let mut ids: Vec<NodeId> = Vec::with_capacity(node_ids.len());
        for id in node_ids {
            push_unique(&mut ids, *id);
        }
        if ids.len() < 2 {
            return Err(ValidationError::TooFewNodes { count: ids.len() }.into());
        }
        if let Some(kept) = kept_id {
            if !ids.contains(&kept) {
                return Err(ValidationError::KeptNodeNotInGroup { id: kept }.into());
            }
        }

        let _guard = self.lock_neighbourhood(&ids)?;

        let mut found: Vec<Option<Node>> = Vec::with_capacity(ids.len());
        for id in &ids {
            found.push(self.store.get_node(*id)?);
        }

        if let Some(result) = already_applied(&ids, &found, kept_id) {
            debug!(kept = %result.kept_node_id, "merge already applied");
            return Ok(result);
        }

        let mut nodes = Vec::with_capacity(ids.len());
        for (id, node) in ids.iter().zip(found) {
            let node = node.ok_or_else(|| ConsolidationError::node_not_found(*id))?;
            if let Some(into) = node.merged_into {
                return Err(ValidationError::AlreadyMerged { id: *id, into }.into());
            }
            nodes.push(node);
        }

        let kept_idx = match kept_id {
            Some(kept) => ids.iter().position(|id| *id == kept).unwrap_or(0),
            None => self.select_kept(&nodes),
        };
        self.merge_nodes(nodes, kept_idx)
    }

    /// Locks `ids` plus the far endpoint of every edge touching them.
    ///
    /// Moving an edge rewrites a record shared with its far endpoint, which
    /// another merge may be moving too. Edges can change while waiting, so
    /// the endpoints are read again under the lock until the held set covers
    /// them.
    fn lock_neighbourhood(&self, ids: &[NodeId]) -> ConsolidationResult<NodeLockGuard<'_>> {
        let mut wanted = self.endpoints_of(ids)?;
        wanted.extend(ids.iter().copied());
        loop {
            let guard = self.locks.acquire(wanted.iter().copied())?;
            let current = self.endpoints_of(ids)?;
            if current.is_subset(&wanted) {
                return Ok(guard);
            }
            drop(guard);
            debug!(added = current.difference(&wanted).count(), "merge neighbourhood grew");
            wanted.extend(current);
        }
    }

    fn endpoints_of(&self, ids: &[NodeId]) -> ConsolidationResult<BTreeSet<NodeId>> {
        let mut out = BTreeSet::new();
        for id in ids {
            for rel in self.store.relationships_of(*id)? {
                out.insert(rel.source);
                out.insert(rel.target);
            }
        }
        Ok(out)
    }

    fn select_kept(&self, nodes: &[Node]) -> usize {
        match self.config.kept_selection {
            KeptNodeSelection::First => 0,
            KeptNodeSelection::Richest => {
                let mut best = 0;
                for (idx, node) in nodes.iter().enumerate().skip(1) {
                    if node.richness() > nodes[best].richness() {
                        best = idx;
                    }
                }
                best
            }
        }
    }

    fn merge_nodes(&self, nodes: Vec<Node>, kept_idx: usize) -> ConsolidationResult<MergeResult> {
        let kept_id = nodes[kept_idx].id;
        let group: HashSet<NodeId> = nodes.iter().map(|n| n.id).collect();
        let merged_ids: Vec<NodeId> = nodes
            .iter()
            .map(|n| n.id)
            .filter(|id| *id != kept_id)
            .collect();

        // Names and labels.
        let mut alias_provenance: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
        let mut label_provenance: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
        for node in &nodes {
            for name in node.names() {
                push_unique(alias_provenance.entry(name.to_string()).or_default(), node.id);
            }
            for label in &node.labels {
                push_unique(label_provenance.entry(label.clone()).or_default(), node.id);
            }
        }

        // Properties, kept node first so its values win first-seen ties.
        let order: Vec<usize> = std::iter::once(kept_idx)
            .chain((0..nodes.len()).filter(|i| *i != kept_idx))
            .collect();
        let mut variants: BTreeMap<String, VariantSet> = BTreeMap::new();
        for &i in &order {
            collect_node_variants(&nodes[i], &mut variants);
        }

        let mut kept = nodes[kept_idx].clone();
        if kept.name.as_deref().map_or(true, |n| n.trim().is_empty()) {
            kept.name = order
                .iter()
                .find_map(|&i| nodes[i].name.clone().filter(|n| !n.trim().is_empty()));
        }
        kept.aliases = alias_provenance.keys().cloned().collect();
        kept.labels = label_provenance.keys().cloned().collect();

        let mut merged_properties = BTreeMap::new();
        let mut property_provenance: BTreeMap<String, ValueProvenance> = BTreeMap::new();
        for (key, set) in &variants {
            let strategy = self.config.strategy_for(key);
            let Some(representative) = set.representative(strategy).cloned() else {
                continue;
            };
            property_provenance.insert(key.clone(), set.provenance());
            kept.properties.insert(key.clone(), representative.clone());
            if set.len() == 1 {
                merged_properties.insert(key.clone(), MergedValue::Unique(representative));
            } else {
                kept.conflicts.insert(key.clone(), set.values());
                kept.conflict_provenance.insert(key.clone(), set.provenance());
                merged_properties.insert(key.clone(), MergedValue::Variants(set.values()));
            }
        }

        for &i in &order[1..] {
            let other = &nodes[i];
            kept.merge_history.extend(other.merge_history.iter().cloned());
            kept.is_bridge |= other.is_bridge;
            for community in &other.bridge_communities {
                push_unique(&mut kept.bridge_communities, *community);
            }
        }

        let mut tx = GraphTransaction::new("merge");
        let rewrites = self.rewrite_relationships(&mut tx, kept_id, &merged_ids, &group)?;
        let relationships_updated = rewrites.len();

        kept.merge_history.push(MergeRecord {
            kept_node_id: kept_id,
            merged_node_ids: merged_ids.clone(),
            alias_provenance,
            property_provenance,
            label_provenance,
            relationship_rewrites: rewrites,
            relationships_updated,
            timestamp: Utc::now(),
        });
        kept.touch();
        tx.put_node(kept);

        for &i in &order[1..] {
            let mut other = nodes[i].clone();
            match self.config.mode {
                MergeMode::Delete => {
                    tx.delete_node(other.id);
                }
                MergeMode::PreserveHistory => {
                    other.merged_into = Some(kept_id);
                    other.touch();
                    tx.put_node(other);
                }
            }
        }

        self.store.commit(tx)?;
        info!(
            kept = %kept_id,
            merged = merged_ids.len(),
            relationships = relationships_updated,
            conflicting = merged_properties
                .values()
                .filter(|v| matches!(v, MergedValue::Variants(_)))
                .count(),
            "merged duplicate group"
        );

        Ok(MergeResult {
            kept_node_id: kept_id,
            merged_node_ids: merged_ids,
            merged_properties,
            relationships_updated,
            already_applied: false,
        })
    }

    /// Stages the relationship moves of a merge and returns their records.
    ///
    /// Every endpoint inside the group is re-pointed at the kept node, so an
    /// edge between two group members becomes a loop on the kept node. An
    /// edge that ends up parallel to one already on the kept node is collapsed
    /// into it; nothing else is dropped.
    fn rewrite_relationships(
        &self,
        tx: &mut GraphTransaction,
        kept_id: NodeId,
        merged_ids: &[NodeId],
        group: &HashSet<NodeId>,
    ) -> ConsolidationResult<Vec<RelationshipRewrite>> {
        let moves = |id: NodeId| id != kept_id && group.contains(&id);
        let mut seen: HashSet<RelationshipId> = HashSet::new();
        let mut surviving: Vec<Relationship> = Vec::new();
        let mut touched: Vec<Relationship> = Vec::new();

        for rel in self.store.relationships_of(kept_id)? {
            seen.insert(rel.id);
            if moves(rel.source) || moves(rel.target) {
                touched.push(rel);
            } else {
                surviving.push(rel);
            }
        }
        for id in merged_ids {
            for rel in self.store.relationships_of(*id)? {
                if seen.insert(rel.id) {
                    touched.push(rel);
                }
            }
        }

        let redirect = |id: NodeId| if moves(id) { kept_id } else { id };
        let mut rewrites = Vec::with_capacity(touched.len());
        for rel in touched {
            let mut moved = rel.clone();
            moved.source = redirect(rel.source);
            moved.target = redirect(rel.target);
            let outcome = match surviving.iter().find(|s| s.is_parallel_to(&moved)) {
                Some(existing) => {
                    tx.delete_relationship(rel.id);
                    RewriteOutcome::Collapsed { into: existing.id }
                }
                None => {
                    tx.put_relationship(moved.clone());
                    surviving.push(moved);
                    RewriteOutcome::Transferred
                }
            };
            rewrites.push(RelationshipRewrite {
                relationship_id: rel.id,
                rel_type: rel.rel_type,
                original_source: rel.source,
                original_target: rel.target,
                properties: rel.properties,
                outcome,
            });
        }
        Ok(rewrites)
    }
}

/// Detects a merge that already landed.
///
/// It has landed when one input is active and every other input is either
/// gone but recorded in its history, or marked as merged into it.
fn already_applied(
    ids: &[NodeId],
    found: &[Option<Node>],
    kept_id: Option<NodeId>,
) -> Option<MergeResult> {
    let kept = found.iter().flatten().find(|candidate| {
        candidate.is_active()
            && kept_id.map_or(true, |k| k == candidate.id)
            && ids.iter().zip(found).all(|(id, node)| {
                *id == candidate.id
                    || match node {
                        Some(n) => n.merged_into == Some(candidate.id),
                        None => candidate.has_absorbed(*id),
                    }
            })
    })?;

    let merged_node_ids: Vec<NodeId> = ids.iter().copied().filter(|id| *id != kept.id).collect();
    let records: Vec<&MergeRecord> = kept
        .merge_history
        .iter()
        .filter(|r| r.kept_node_id == kept.id && merged_node_ids.iter().any(|id| r.covers(*id)))
        .collect();
    let relationships_updated = records.iter().map(|r| r.relationships_updated).sum();

    let touched: BTreeSet<&String> = records
        .iter()
        .flat_map(|r| r.property_provenance.keys())
        .collect();
    let merged_properties = touched
        .into_iter()
        .filter_map(|key| {
            let value = match kept.conflicts.get(key) {
                Some(variants) if variants.len() > 1 => MergedValue::Variants(variants.clone()),
                _ => MergedValue::Unique(kept.properties.get(key)?.clone()),
            };
            Some((key.clone(), value))
        })
        .collect();

    Some(MergeResult {
        kept_node_id: kept.id,
        merged_node_ids,
        merged_properties,
        relationships_updated,
        already_applied: true,
    })
}
