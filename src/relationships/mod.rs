//! Relationship discovery.
//!
//! Proposes edges the graph is missing: near-duplicate pairs that were not
//! merged (`SameAs`), string properties naming another entity, and entity
//! names mentioned inside long-text properties. Candidates are only written
//! when a caller applies them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::RelationshipConfig;
use crate::conflict::ApplyOutcome;
use crate::error::{
    ConfigError, ConsolidationError, ConsolidationResult, UnitFailure, ValidationError,
};
use crate::graph::{Node, NodeId, Relationship};
use crate::similarity::{
    best_name_match, mention_pattern, normalize, normalized_names, SimilarityMethod,
};
use crate::storage::{GraphStore, GraphTransaction, NodeLockTable};

/// Property written on applied edges naming their origin.
pub const PROPOSED_BY: &str = "kgconsolidate";

/// Longest `merged_into` chain followed when applying a candidate.
const MAX_REDIRECTS: usize = 16;

const REFERENCE_CONFIDENCE: f64 = 0.8;
const MENTION_CONFIDENCE: f64 = 0.65;
/// Shortest alias considered for mentions.
const MIN_MENTION_LEN: usize = 3;

/// Kind of a proposed relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    /// Likely the same entity, not merged.
    SameAs,
    /// Mentioned by the other entity.
    RelatedTo,
    /// Contained in the other entity.
    PartOf,
    /// Loosely associated.
    AssociatedWith,
    /// Derived from the other entity.
    DerivedFrom,
}

impl RelationshipType {
    /// Edge type used in the graph store.
    #[must_use]
    pub fn edge_label(&self) -> &'static str {
        match self {
            Self::SameAs => "SAME_AS",
            Self::RelatedTo => "RELATED_TO",
            Self::PartOf => "PART_OF",
            Self::AssociatedWith => "ASSOCIATED_WITH",
            Self::DerivedFrom => "DERIVED_FROM",
        }
    }
}

/// A proposed edge. Transient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipCandidate {
    /// Source endpoint.
    pub source_id: NodeId,
    /// Target endpoint.
    pub target_id: NodeId,
    /// Proposed type.
    pub relationship_type: RelationshipType,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Why the edge was proposed.
    pub evidence: BTreeMap<String, Value>,
}

impl RelationshipCandidate {
    fn key(&self) -> (NodeId, NodeId, RelationshipType) {
        let (a, b) = if self.source_id <= self.target_id {
            (self.source_id, self.target_id)
        } else {
            (self.target_id, self.source_id)
        };
        (a, b, self.relationship_type)
    }
}

/// Finds and applies relationship candidates.
pub struct RelationshipDiscoverer {
    store: Arc<dyn GraphStore>,
    locks: Arc<NodeLockTable>,
    config: RelationshipConfig,
    duplicate_threshold: f64,
    method: SimilarityMethod,
}

impl std::fmt::Debug for RelationshipDiscoverer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationshipDiscoverer")
            .field("config", &self.config)
            .field("duplicate_threshold", &self.duplicate_threshold)
            .finish_non_exhaustive()
    }
}

impl RelationshipDiscoverer {
    /// Creates a discoverer.
    ///
    /// `duplicate_threshold` is the detector's fuzzy threshold: pairs at or
    /// above it are duplicates, not `SameAs` candidates.
    pub fn new(
        store: Arc<dyn GraphStore>,
        config: RelationshipConfig,
        duplicate_threshold: f64,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if !(0.0..=1.0).contains(&duplicate_threshold) {
            return Err(ConfigError::ThresholdOutOfRange {
                name: "duplicate_threshold",
                value: duplicate_threshold,
            });
        }
        Ok(Self {
            store,
            locks: Arc::new(NodeLockTable::new()),
            config,
            duplicate_threshold,
            method: SimilarityMethod::Ratio,
        })
    }

    /// Shares a lock table with other writers.
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<NodeLockTable>) -> Self {
        self.locks = locks;
        self
    }

    /// Uses `method` for `SameAs` similarity.
    #[must_use]
    pub fn with_method(mut self, method: SimilarityMethod) -> Self {
        self.method = method;
        self
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &RelationshipConfig {
        &self.config
    }

    /// Proposes missing edges.
    ///
    /// With a `scope`, every candidate has a scoped endpoint. Candidates whose
    /// typed edge already exists are dropped; the rest are sorted by
    /// confidence and truncated to `max_relationships`.
    pub fn discover(
        &self,
        scope: Option<&[NodeId]>,
        batch_size: usize,
    ) -> ConsolidationResult<Vec<RelationshipCandidate>> {
        if batch_size == 0 {
            return Err(ConfigError::NonPositive { name: "batch_size" }.into());
        }
        let nodes: Vec<Node> = self.store.scan_all_nodes(batch_size)?;
        let keys: Vec<Vec<String>> = nodes.iter().map(normalized_names).collect();
        let scope: Option<HashSet<NodeId>> = scope.map(|s| s.iter().copied().collect());
        let involves = |a: usize, b: usize| {
            scope
                .as_ref()
                .map_or(true, |s| s.contains(&nodes[a].id) || s.contains(&nodes[b].id))
        };

        let mut found = Vec::new();
        self.same_as(&nodes, &keys, &involves, &mut found);
        self.property_references(&nodes, &keys, &involves, &mut found);
        self.mentions(&nodes, &keys, &involves, &mut found);

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for candidate in found {
            if candidate.confidence < self.config.min_confidence || !seen.insert(candidate.key()) {
                continue;
            }
            if self.edge_exists(&candidate)? {
                continue;
            }
            out.push(candidate);
        }
        out.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        out.truncate(self.config.max_relationships);

        info!(candidates = out.len(), scoped = scope.is_some(), "relationship discovery finished");
        Ok(out)
    }

    fn same_as<F>(
        &self,
        nodes: &[Node],
        keys: &[Vec<String>],
        involves: &F,
        out: &mut Vec<RelationshipCandidate>,
    ) where
        F: Fn(usize, usize) -> bool,
    {
        for i in 0..nodes.len() {
            for j in (i + 1)..nodes.len() {
                if nodes[i].labels != nodes[j].labels || !involves(i, j) {
                    continue;
                }
                let Some(m) = best_name_match(&keys[i], &keys[j], self.method) else {
                    continue;
                };
                if m.score < self.config.same_as_min_similarity || m.score >= self.duplicate_threshold {
                    continue;
                }
                let mut evidence = BTreeMap::new();
                evidence.insert("left".to_string(), json!(m.left));
                evidence.insert("right".to_string(), json!(m.right));
                evidence.insert("score".to_string(), json!(m.score));
                out.push(RelationshipCandidate {
                    source_id: nodes[i].id,
                    target_id: nodes[j].id,
                    relationship_type: RelationshipType::SameAs,
                    confidence: m.score,
                    evidence,
                });
            }
        }
    }

    fn property_references<F>(
        &self,
        nodes: &[Node],
        keys: &[Vec<String>],
        involves: &F,
        out: &mut Vec<RelationshipCandidate>,
    ) where
        F: Fn(usize, usize) -> bool,
    {
        let mut index: HashMap<&str, Vec<usize>> = HashMap::new();
        for (idx, names) in keys.iter().enumerate() {
            for name in names {
                index.entry(name.as_str()).or_default().push(idx);
            }
        }

        for (x, node) in nodes.iter().enumerate() {
            for (prop, value) in &node.properties {
                if self.config.mention_properties.contains(prop) {
                    continue;
                }
                let Some(text) = value.as_str() else {
                    continue;
                };
                let Some(targets) = index.get(normalize(text).as_str()) else {
                    continue;
                };
                let relationship_type = self
                    .config
                    .property_relationships
                    .get(prop)
                    .copied()
                    .unwrap_or(RelationshipType::AssociatedWith);
                for &y in targets {
                    if y == x || !involves(x, y) {
                        continue;
                    }
                    let mut evidence = BTreeMap::new();
                    evidence.insert("property".to_string(), json!(prop));
                    evidence.insert("value".to_string(), value.clone());
                    out.push(RelationshipCandidate {
                        source_id: node.id,
                        target_id: nodes[y].id,
                        relationship_type,
                        confidence: REFERENCE_CONFIDENCE,
                        evidence,
                    });
                }
            }
        }
    }

    fn mentions<F>(
        &self,
        nodes: &[Node],
        keys: &[Vec<String>],
        involves: &F,
        out: &mut Vec<RelationshipCandidate>,
    ) where
        F: Fn(usize, usize) -> bool,
    {
        let patterns: Vec<Vec<(String, Regex)>> = keys
            .iter()
            .map(|names| {
                names
                    .iter()
                    .filter(|n| n.chars().count() >= MIN_MENTION_LEN)
                    .filter_map(|n| mention_pattern(n).map(|re| (n.clone(), re)))
                    .collect()
            })
            .collect();

        for (x, node) in nodes.iter().enumerate() {
            for prop in &self.config.mention_properties {
                let Some(text) = node.properties.get(prop).and_then(Value::as_str) else {
                    continue;
                };
                for (y, names) in patterns.iter().enumerate() {
                    if y == x || !involves(x, y) {
                        continue;
                    }
                    let Some((name, _)) = names.iter().find(|(_, re)| re.is_match(text)) else {
                        continue;
                    };
                    let mut evidence = BTreeMap::new();
                    evidence.insert("property".to_string(), json!(prop));
                    evidence.insert("mention".to_string(), json!(name));
                    out.push(RelationshipCandidate {
                        source_id: node.id,
                        target_id: nodes[y].id,
                        relationship_type: RelationshipType::RelatedTo,
                        confidence: MENTION_CONFIDENCE,
                        evidence,
                    });
                }
            }
        }
    }

    fn edge_exists(&self, candidate: &RelationshipCandidate) -> ConsolidationResult<bool> {
        let label = candidate.relationship_type.edge_label();
        Ok(self
            .store
            .relationships_of(candidate.source_id)?
            .iter()
            .any(|rel| {
                rel.rel_type == label
                    && rel.other_end(candidate.source_id) == Some(candidate.target_id)
            }))
    }

    /// Writes candidates as edges, one transaction each.
    ///
    /// Edges that already exist are counted as unchanged, so applying the
    /// same candidates twice creates nothing the second time.
    pub fn apply_candidates(&self, candidates: &[RelationshipCandidate]) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        for candidate in candidates {
            if candidate.confidence < self.config.min_confidence {
                outcome.skipped += 1;
                continue;
            }
            match self.apply_one(candidate) {
                Ok(true) => outcome.applied += 1,
                Ok(false) => outcome.unchanged += 1,
                Err(err) => {
                    warn!(
                        source = %candidate.source_id,
                        target = %candidate.target_id,
                        error = %err,
                        "failed to apply relationship candidate"
                    );
                    outcome.failed.push(UnitFailure::new(
                        "relationships",
                        format!("{}->{}", candidate.source_id, candidate.target_id),
                        &err,
                    ));
                }
            }
        }
        debug!(applied = outcome.applied, unchanged = outcome.unchanged, "relationship candidates applied");
        outcome
    }

    /// Follows `merged_into` from `id` to the node that absorbed it.
    fn active_node(&self, id: NodeId) -> ConsolidationResult<Node> {
        let mut current = id;
        for _ in 0..MAX_REDIRECTS {
            let node = self
                .store
                .get_node(current)?
                .ok_or_else(|| ConsolidationError::node_not_found(current))?;
            match node.merged_into {
                Some(into) => current = into,
                None => return Ok(node),
            }
        }
        Err(ValidationError::AlreadyMerged { id, into: current }.into())
    }

    fn apply_one(&self, candidate: &RelationshipCandidate) -> ConsolidationResult<bool> {
        loop {
            let source = self.active_node(candidate.source_id)?.id;
            let target = self.active_node(candidate.target_id)?.id;
            if source == target {
                debug!(node = %source, "candidate endpoints were merged together");
                return Ok(false);
            }

            let _guard = self.locks.acquire([source, target])?;
            // A merge may have absorbed an endpoint while we waited.
            if self.active_node(source)?.id != source || self.active_node(target)?.id != target {
                continue;
            }

            let redirected = RelationshipCandidate {
                source_id: source,
                target_id: target,
                ..candidate.clone()
            };
            if self.edge_exists(&redirected)? {
                return Ok(false);
            }
            let rel = Relationship::new(redirected.relationship_type.edge_label(), source, target)
                .with_property("confidence", json!(candidate.confidence))
                .with_property("evidence", json!(candidate.evidence))
                .with_property("proposed_by", json!(PROPOSED_BY));

            let mut tx = GraphTransaction::new("discover_relationship");
            tx.put_relationship(rel);
            self.store.commit(tx)?;
            return Ok(true);
        }
    }
}
