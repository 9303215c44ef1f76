//! Duplicate detection.
//!
//! Strategies run in precision order (exact, fuzzy, embedding, contextual).
//! Nodes grouped by one strategy are withheld from every later one, so a node
//! belongs to at most one group per run. Detection only reads the store.

mod contextual;
mod embedding;
mod exact;
mod fuzzy;
mod pool;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{DetectorConfig, Strategy};
use crate::error::{ConfigError, ConsolidationResult};
use crate::graph::NodeId;
use crate::storage::GraphStore;

pub(crate) use pool::claim_shared_keys;

use self::pool::CandidatePool;

/// A set of nodes believed to denote one entity. Transient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    /// Members; at least two, no repeats.
    pub node_ids: Vec<NodeId>,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Strategy that produced the group.
    pub strategy: Strategy,
    /// Strategy-specific evidence.
    pub evidence: BTreeMap<String, Value>,
}

/// Finds duplicate groups in the graph store.
pub struct DuplicateDetector {
    store: Arc<dyn GraphStore>,
    config: DetectorConfig,
}

impl std::fmt::Debug for DuplicateDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplicateDetector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DuplicateDetector {
    /// Creates a detector, validating `config`.
    pub fn new(store: Arc<dyn GraphStore>, config: DetectorConfig) -> Result<Self, ConfigError> {
        Self::validate_config(&config)?;
        Ok(Self { store, config })
    }

    /// Rejects out-of-range thresholds, non-positive sizes and an empty strategy list.
    pub fn validate_config(config: &DetectorConfig) -> Result<(), ConfigError> {
        config.validate()
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Finds duplicate groups.
    ///
    /// With a `scope`, only groups containing at least one scoped node are
    /// returned; candidates are still drawn from the whole graph. Nodes are
    /// read in pages of `batch_size`.
    pub fn find_duplicates(
        &self,
        scope: Option<&[NodeId]>,
        batch_size: usize,
    ) -> ConsolidationResult<Vec<DuplicateGroup>> {
        if batch_size == 0 {
            return Err(ConfigError::NonPositive { name: "batch_size" }.into());
        }

        let nodes = self.store.scan_all_nodes(batch_size)?;
        let mut pool = CandidatePool::new(nodes, scope);
        let mut groups = Vec::new();

        for strategy in self.config.ordered_strategies() {
            let found = match strategy {
                Strategy::Exact => exact::detect(&pool),
                Strategy::Fuzzy => fuzzy::detect(&pool, &self.config),
                Strategy::Embedding => embedding::detect(&pool, &self.config),
                Strategy::Contextual => {
                    contextual::detect(&pool, &self.config, self.store.as_ref())?
                }
            };
            debug!(
                strategy = strategy.name(),
                groups = found.len(),
                "detection strategy finished"
            );
            for group in &found {
                pool.claim(group);
            }
            groups.extend(found);
        }

        info!(
            candidates = pool.len(),
            groups = groups.len(),
            scoped = scope.is_some(),
            "duplicate detection finished"
        );
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Node, Relationship};
    use crate::storage::InMemoryGraphStore;
    use serde_json::json;

    fn detector(store: &Arc<InMemoryGraphStore>, config: DetectorConfig) -> DuplicateDetector {
        DuplicateDetector::new(store.clone(), config).unwrap()
    }

    fn insert(store: &InMemoryGraphStore, node: Node) -> NodeId {
        let id = node.id;
        store.insert_node(node).unwrap();
        id
    }

    #[test]
    fn test_exact_match_on_alias() {
        let store = Arc::new(InMemoryGraphStore::new());
        let a = insert(&store, Node::new("Frodo", ["Hobbit"]).with_alias("Frodo Baggins"));
        let b = insert(&store, Node::new("frodo baggins", ["Hobbit"]));
        insert(&store, Node::new("Sam", ["Hobbit"]));

        let groups = detector(&store, DetectorConfig::default())
            .find_duplicates(None, 10)
            .unwrap();
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.strategy, Strategy::Exact);
        assert_eq!(group.node_ids, vec![a, b]);
        assert!((group.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(group.evidence["matched_names"], json!(["frodo baggins"]));
    }

    #[test]
    fn test_fuzzy_threshold_boundary() {
        let store = Arc::new(InMemoryGraphStore::new());
        insert(&store, Node::new("Galadriel", ["Elf"]));
        insert(&store, Node::new("Galadirel", ["Elf"]));

        let loose = detector(&store, DetectorConfig::default())
            .find_duplicates(None, 10)
            .unwrap();
        assert_eq!(loose.len(), 1);
        assert_eq!(loose[0].strategy, Strategy::Fuzzy);
        assert!((loose[0].confidence - 0.8).abs() < f64::EPSILON);
        assert_eq!(loose[0].evidence["matches"][0]["left"], json!("galadriel"));

        let strict = DetectorConfig {
            similarity_threshold: 0.95,
            ..DetectorConfig::default()
        };
        assert!(detector(&store, strict).find_duplicates(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_fuzzy_rejects_cross_label_matches() {
        let store = Arc::new(InMemoryGraphStore::new());
        insert(&store, Node::new("Galadriel", ["Elf"]));
        insert(&store, Node::new("Galadirel", ["Ship"]));

        let groups = detector(&store, DetectorConfig::default())
            .find_duplicates(None, 10)
            .unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_nameless_nodes_are_ignored() {
        let store = Arc::new(InMemoryGraphStore::new());
        insert(&store, Node::with_id(NodeId::new(), None, ["Thing"]));
        insert(&store, Node::with_id(NodeId::new(), Some("  ".to_string()), ["Thing"]));

        let groups = detector(&store, DetectorConfig::default())
            .find_duplicates(None, 10)
            .unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_earlier_strategy_claims_nodes() {
        let store = Arc::new(InMemoryGraphStore::new());
        let a = insert(&store, Node::new("Boromir", ["Man"]));
        let b = insert(&store, Node::new("boromir", ["Man"]));
        let c = insert(&store, Node::new("Boromirr", ["Man"]));

        let groups = detector(&store, DetectorConfig::default())
            .find_duplicates(None, 2)
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].node_ids, vec![a, b]);
        assert!(!groups.iter().any(|g| g.node_ids.contains(&c)));
    }

    #[test]
    fn test_scope_filters_groups() {
        let store = Arc::new(InMemoryGraphStore::new());
        let a = insert(&store, Node::new("Gimli", ["Dwarf"]));
        let b = insert(&store, Node::new("gimli", ["Dwarf"]));
        let c = insert(&store, Node::new("Legolas", ["Elf"]));
        insert(&store, Node::new("legolas", ["Elf"]));

        let det = detector(&store, DetectorConfig::default());
        let scoped = det.find_duplicates(Some(&[b][..]), 10).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].node_ids, vec![a, b]);

        let other = det.find_duplicates(Some(&[c][..]), 10).unwrap();
        assert_eq!(other.len(), 1);
        assert!(other[0].node_ids.contains(&c));

        assert!(det.find_duplicates(Some(&[][..]), 10).unwrap().is_empty());
    }

    #[test]
    fn test_parallel_fuzzy_matches_sequential() {
        let store = Arc::new(InMemoryGraphStore::new());
        for label in ["Elf", "Man", "Dwarf", "Hobbit", "Wizard"] {
            insert(&store, Node::new(format!("{label} Captain"), [label]));
            insert(&store, Node::new(format!("{label} Captian"), [label]));
            insert(&store, Node::new(format!("Unrelated {label}"), [label]));
        }

        let sequential = detector(&store, DetectorConfig::default())
            .find_duplicates(None, 4)
            .unwrap();
        let parallel = detector(
            &store,
            DetectorConfig {
                parallelism: 3,
                ..DetectorConfig::default()
            },
        )
        .find_duplicates(None, 4)
        .unwrap();
        assert_eq!(sequential.len(), 5);
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_property_similarity_evidence() {
        let store = Arc::new(InMemoryGraphStore::new());
        insert(&store, Node::new("Galadriel", ["Elf"]).with_property("realm", json!("Lorien")));
        insert(&store, Node::new("Galadirel", ["Elf"]).with_property("realm", json!("Lorien")));

        let mut config = DetectorConfig::default();
        config.property_weights.insert("realm".to_string(), 1.0);
        let groups = detector(&store, config).find_duplicates(None, 10).unwrap();
        assert_eq!(groups[0].evidence["property_similarity"], json!(1.0));
    }

    #[test]
    fn test_embedding_strategy() {
        let store = Arc::new(InMemoryGraphStore::new());
        let a = insert(&store, Node::new("Frodo Baggins", ["Hobbit"]));
        let b = insert(&store, Node::new("Baggins, Frodo", ["Hobbit"]));
        insert(&store, Node::new("Saruman", ["Hobbit"]));

        let config = DetectorConfig {
            strategies: vec![Strategy::Embedding],
            ..DetectorConfig::default()
        };
        let groups = detector(&store, config).find_duplicates(None, 10).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].strategy, Strategy::Embedding);
        assert_eq!(groups[0].node_ids, vec![a, b]);
        assert!(groups[0].confidence > 0.99);
    }

    #[test]
    fn test_contextual_strategy_needs_shared_neighbours() {
        let store = Arc::new(InMemoryGraphStore::new());
        let sam = insert(&store, Node::new("Samwise", ["Hobbit"]));
        let sam2 = insert(&store, Node::new("Samwyse", ["Hobbit"]));
        let frodo = insert(&store, Node::new("Frodo", ["Hobbit"]));
        let shire = insert(&store, Node::new("The Shire", ["Place"]));

        let config = DetectorConfig {
            strategies: vec![Strategy::Contextual],
            ..DetectorConfig::default()
        };

        store.insert_relationship(Relationship::new("FRIEND_OF", sam, frodo)).unwrap();
        store.insert_relationship(Relationship::new("FRIEND_OF", sam2, frodo)).unwrap();
        store.insert_relationship(Relationship::new("LIVES_IN", sam, shire)).unwrap();
        let det = detector(&store, config);
        assert!(det.find_duplicates(None, 10).unwrap().is_empty());

        store.insert_relationship(Relationship::new("LIVES_IN", sam2, shire)).unwrap();
        let groups = det.find_duplicates(None, 10).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].node_ids, vec![sam, sam2]);
        assert_eq!(groups[0].strategy, Strategy::Contextual);
    }

    #[test]
    fn test_zero_batch_size_is_configuration_error() {
        let store = Arc::new(InMemoryGraphStore::new());
        let err = detector(&store, DetectorConfig::default())
            .find_duplicates(None, 0)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let store: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let config = DetectorConfig {
            strategies: Vec::new(),
            ..DetectorConfig::default()
        };
        assert_eq!(
            DuplicateDetector::new(store, config).unwrap_err(),
            ConfigError::NoStrategies
        );
    }
}
