//! Engine configuration.
//!
//! Every component takes an immutable config value, validated once at
//! construction. The structs deserialize from TOML with per-field defaults,
//! so a config file only needs to name what it changes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::relationships::RelationshipType;
use crate::similarity::SimilarityMethod;

/// Duplicate detection strategy.
///
/// Variants are declared in precision order; `Ord` follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Shared normalized name or alias.
    Exact,
    /// Alias edit-similarity above the threshold, same label set.
    Fuzzy,
    /// Lexical-embedding cosine above the threshold, same label set.
    Embedding,
    /// Shared relationship neighbourhood plus loose name similarity.
    Contextual,
}

impl Strategy {
    /// Short stable identifier suitable for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
            Self::Embedding => "embedding",
            Self::Contextual => "contextual",
        }
    }
}

/// How the surviving node of a merge is chosen when the caller names none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeptNodeSelection {
    /// First id of the group.
    #[default]
    First,
    /// Node with the most non-empty properties and aliases; ties go to the earlier id.
    Richest,
}

/// What happens to the non-kept nodes of a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Leave them inert with a `merged_into` marker.
    #[default]
    PreserveHistory,
    /// Delete them once relationships are transferred.
    Delete,
}

/// How a representative value is picked among property variants.
///
/// The pick is always one of the variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueStrategy {
    /// Most origin ids wins; ties go to the earliest-seen value.
    #[default]
    MostProvenance,
    /// Earliest-seen value wins.
    FirstSeen,
    /// Longest text wins; ties go to most provenance, then earliest-seen.
    LongestText,
}

/// Conflict resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Most origin ids wins; ties go to the earliest origin id.
    #[default]
    MostProvenance,
    /// The value held by the earliest node wins.
    FirstSeen,
    /// Ask the text aggregator; fall back to `MostProvenance`.
    Aggregate,
}

impl ResolutionPolicy {
    /// Short stable identifier suitable for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::MostProvenance => "most_provenance",
            Self::FirstSeen => "first_seen",
            Self::Aggregate => "aggregate",
        }
    }
}

fn check_unit(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::ThresholdOutOfRange { name, value })
    }
}

fn check_positive(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::NonPositive { name })
    } else {
        Ok(())
    }
}

/// Duplicate detector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Fuzzy match threshold.
    pub similarity_threshold: f64,
    /// Page size for node scans.
    pub batch_size: usize,
    /// Strategies to run. Always executed in precision order.
    pub strategies: Vec<Strategy>,
    /// Property weights for `node_similarity` evidence.
    pub property_weights: BTreeMap<String, f64>,
    /// String comparison used by fuzzy matching.
    pub method: SimilarityMethod,
    /// Fixed confidence of fuzzy groups.
    pub fuzzy_confidence: f64,
    /// Cosine threshold of the embedding strategy.
    pub embedding_threshold: f64,
    /// Shared neighbours required by the contextual strategy.
    pub contextual_min_shared_neighbors: usize,
    /// Loose name threshold of the contextual strategy.
    pub contextual_name_threshold: f64,
    /// Worker threads for label-partitioned detection. 1 runs inline.
    pub parallelism: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.9,
            batch_size: 1000,
            strategies: vec![Strategy::Exact, Strategy::Fuzzy],
            property_weights: BTreeMap::new(),
            method: SimilarityMethod::Ratio,
            fuzzy_confidence: 0.8,
            embedding_threshold: 0.92,
            contextual_min_shared_neighbors: 2,
            contextual_name_threshold: 0.7,
            parallelism: 1,
        }
    }
}

impl DetectorConfig {
    /// Validate ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("similarity_threshold", self.similarity_threshold)?;
        check_unit("fuzzy_confidence", self.fuzzy_confidence)?;
        check_unit("embedding_threshold", self.embedding_threshold)?;
        check_unit("contextual_name_threshold", self.contextual_name_threshold)?;
        check_positive("batch_size", self.batch_size)?;
        check_positive("parallelism", self.parallelism)?;
        check_positive(
            "contextual_min_shared_neighbors",
            self.contextual_min_shared_neighbors,
        )?;
        if self.strategies.is_empty() {
            return Err(ConfigError::NoStrategies);
        }
        for (property, &weight) in &self.property_weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::InvalidWeight {
                    property: property.clone(),
                    weight,
                });
            }
        }
        Ok(())
    }

    /// Configured strategies, deduplicated, in precision order.
    #[must_use]
    pub fn ordered_strategies(&self) -> Vec<Strategy> {
        let set: BTreeSet<Strategy> = self.strategies.iter().copied().collect();
        set.into_iter().collect()
    }
}

/// Node merger configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Kept-node selection when the caller names none.
    pub kept_selection: KeptNodeSelection,
    /// Fate of the non-kept nodes.
    pub mode: MergeMode,
    /// Representative-value strategy for conflicting properties.
    pub default_merge_strategy: ValueStrategy,
    /// Per-property overrides of `default_merge_strategy`.
    pub property_strategies: BTreeMap<String, ValueStrategy>,
}

impl MergeConfig {
    /// Strategy for one property.
    #[must_use]
    pub fn strategy_for(&self, property: &str) -> ValueStrategy {
        self.property_strategies
            .get(property)
            .copied()
            .unwrap_or(self.default_merge_strategy)
    }
}

/// Conflict resolver configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Default resolution policy.
    pub policy: ResolutionPolicy,
    /// Per-property overrides of `policy`.
    pub property_policies: BTreeMap<String, ResolutionPolicy>,
    /// Properties never reported as conflicting.
    pub ignored_properties: BTreeSet<String>,
    /// Resolutions below this confidence are reported but not applied.
    pub min_confidence: f64,
}

impl ConflictConfig {
    /// Validate ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("conflict.min_confidence", self.min_confidence)
    }

    /// Policy for one property.
    #[must_use]
    pub fn policy_for(&self, property: &str) -> ResolutionPolicy {
        self.property_policies
            .get(property)
            .copied()
            .unwrap_or(self.policy)
    }
}

/// Relationship discovery configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationshipConfig {
    /// Lowest confidence a candidate may carry.
    pub min_confidence: f64,
    /// Lowest alias similarity for a `SameAs` proposal. Pairs at or above the
    /// duplicate threshold are left to the merger.
    pub same_as_min_similarity: f64,
    /// Maximum candidates per discovery call.
    pub max_relationships: usize,
    /// Commit candidates during a consolidation run.
    pub auto_apply: bool,
    /// Property name -> relationship type for property references.
    pub property_relationships: BTreeMap<String, RelationshipType>,
    /// Long-text properties scanned for whole-word mentions.
    pub mention_properties: Vec<String>,
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        let property_relationships = [
            ("part_of", RelationshipType::PartOf),
            ("located_in", RelationshipType::PartOf),
            ("member_of", RelationshipType::PartOf),
            ("derived_from", RelationshipType::DerivedFrom),
            ("source", RelationshipType::DerivedFrom),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            min_confidence: 0.6,
            same_as_min_similarity: 0.8,
            max_relationships: 100,
            auto_apply: false,
            property_relationships,
            mention_properties: vec!["description".to_string(), "summary".to_string()],
        }
    }
}

impl RelationshipConfig {
    /// Validate ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("relationships.min_confidence", self.min_confidence)?;
        check_unit("same_as_min_similarity", self.same_as_min_similarity)?;
        check_positive("max_relationships", self.max_relationships)
    }
}

/// Community analyzer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityConfig {
    /// Shortest alias matched against summaries.
    pub min_alias_len: usize,
    /// Shortest vocabulary token counted as a shared term.
    pub min_term_len: usize,
    /// Shared terms required to propose a link.
    pub min_shared_terms: usize,
    /// Link confidence with one shared term, minus one increment.
    pub link_base_confidence: f64,
    /// Confidence added per shared term.
    pub link_term_increment: f64,
    /// Link confidence cap.
    pub link_max_confidence: f64,
    /// Persist `is_bridge`/`bridge_communities` during a run.
    pub annotate_bridges: bool,
    /// Extra stopwords on top of the built-in list.
    pub stopwords: BTreeSet<String>,
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            min_alias_len: 3,
            min_term_len: 4,
            min_shared_terms: 1,
            link_base_confidence: 0.5,
            link_term_increment: 0.05,
            link_max_confidence: 0.95,
            annotate_bridges: true,
            stopwords: BTreeSet::new(),
        }
    }
}

impl CommunityConfig {
    /// Validate ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("link_base_confidence", self.link_base_confidence)?;
        check_unit("link_term_increment", self.link_term_increment)?;
        check_unit("link_max_confidence", self.link_max_confidence)?;
        check_positive("min_shared_terms", self.min_shared_terms)?;
        if self.link_base_confidence > self.link_max_confidence {
            return Err(ConfigError::InvalidConfidenceBounds {
                base: self.link_base_confidence,
                max: self.link_max_confidence,
            });
        }
        Ok(())
    }
}

/// Summary consolidator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    /// Token Jaccard overlap at which two differing summaries conflict.
    pub min_context_overlap: f64,
    /// Shortest token counted toward overlap.
    pub min_term_len: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            min_context_overlap: 0.2,
            min_term_len: 4,
        }
    }
}

impl SummaryConfig {
    /// Validate ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("min_context_overlap", self.min_context_overlap)
    }
}

/// Incremental-update runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads.
    pub workers: usize,
    /// Maximum queued changesets.
    pub queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 256,
        }
    }
}

impl RuntimeConfig {
    /// Validate ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("workers", self.workers)?;
        check_positive("queue_capacity", self.queue_capacity)
    }
}

/// Configuration of the whole pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Duplicate detection.
    pub detector: DetectorConfig,
    /// Node merging.
    pub merge: MergeConfig,
    /// Conflict resolution.
    pub conflict: ConflictConfig,
    /// Relationship discovery.
    pub relationships: RelationshipConfig,
    /// Community analysis.
    pub community: CommunityConfig,
    /// Summary consolidation.
    pub summary: SummaryConfig,
    /// Incremental-update runtime.
    pub runtime: RuntimeConfig,
}

impl ConsolidationConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.detector.validate()?;
        self.conflict.validate()?;
        self.relationships.validate()?;
        self.community.validate()?;
        self.summary.validate()?;
        self.runtime.validate()
    }

    /// Parse and validate a TOML document.
    ///
    /// # Examples
    ///
    /// ```
    /// use kgconsolidate::ConsolidationConfig;
    ///
    /// let config = ConsolidationConfig::from_toml_str(
    ///     "[detector]\nsimilarity_threshold = 0.95\nstrategies = [\"fuzzy\", \"exact\"]\n",
    /// )
    /// .unwrap();
    /// assert_eq!(config.detector.similarity_threshold, 0.95);
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            message: format!("{}: {e}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }
}
