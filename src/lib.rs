//! # kgconsolidate - Knowledge-Graph Consolidation Engine
//!
//! Deduplicates, merges and reconciles records inside an already-ingested
//! property graph without discarding information. Every merge and every
//! conflict resolution leaves enough provenance on the surviving record to
//! reconstruct what each input looked like.
//!
//! ## Core Concepts
//!
//! - **Node**: an entity record with labels, a name, aliases and properties
//! - **DuplicateGroup**: nodes believed to denote one entity, with the
//!   strategy and evidence that grouped them
//! - **Merge**: folds a group into one kept node; aliases, values and
//!   relationships are unioned with provenance
//! - **Conflict**: disagreeing values of one property across same-entity
//!   nodes; resolved non-destructively
//! - **Community**: a pre-computed cluster with a free-text summary; linked
//!   softly, never re-partitioned
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//!
//! use kgconsolidate::{ConsolidationConfig, Consolidator, InMemoryGraphStore, Node};
//!
//! let store = Arc::new(InMemoryGraphStore::new());
//! store.insert_node(Node::new("Frodo", ["Hobbit"]).with_alias("Frodo Baggins")).unwrap();
//! store.insert_node(Node::new("frodo baggins", ["Hobbit"])).unwrap();
//!
//! let consolidator = Consolidator::new(store.clone(), ConsolidationConfig::default()).unwrap();
//! let report = consolidator.run_consolidation(500).unwrap();
//! assert_eq!(report.counter("nodes_merged"), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod aggregator;
pub mod community;
pub mod config;
pub mod conflict;
pub mod consolidator;
pub mod detection;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod merge;
pub mod relationships;
pub mod runtime;
pub mod similarity;
pub mod storage;
pub mod summary;

// Re-export primary types at crate root for convenience
pub use aggregator::{AggregationError, TextAggregator};
pub use community::{BridgeEntity, CommunityAnalyzer, LinkProposal, LinkValidator, ValidatedLink};
pub use config::{
    CommunityConfig, ConflictConfig, ConsolidationConfig, DetectorConfig, KeptNodeSelection,
    MergeConfig, MergeMode, RelationshipConfig, ResolutionPolicy, RuntimeConfig, Strategy,
    SummaryConfig, ValueStrategy,
};
pub use conflict::{ApplyOutcome, ConflictGroup, ConflictJudge, ConflictResolver, Resolution};
pub use consolidator::{
    CancelHandle, Changeset, ConsolidationReport, Consolidator, Stage, StageMetrics,
};
pub use detection::{DuplicateDetector, DuplicateGroup};
pub use error::{
    ConfigError, ConsolidationError, ConsolidationResult, RuntimeError, UnitFailure,
    ValidationError,
};
pub use graph::{
    Community, CommunityId, CommunityLink, Node, NodeId, Relationship, RelationshipId,
};
pub use merge::{MergeResult, MergedValue, NodeMerger};
pub use relationships::{RelationshipCandidate, RelationshipDiscoverer, RelationshipType};
pub use runtime::{ConsolidationRuntime, UpdateHandle};
pub use similarity::SimilarityMethod;
pub use storage::{GraphStore, GraphTransaction, InMemoryGraphStore, NodeLockTable, StorageError};
pub use summary::{SummaryConflict, SummaryConsolidator};
