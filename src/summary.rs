//! Community summary consolidation.
//!
//! Summaries are only ever added to: merged or synthesized texts are stored
//! next to the originals, and a changed summary leaves a version entry.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregator::{synthesize_checked, TextAggregator};
use crate::community::{jaccard, vocabulary};
use crate::config::SummaryConfig;
use crate::conflict::ApplyOutcome;
use crate::error::{ConfigError, ConsolidationError, ConsolidationResult, UnitFailure};
use crate::graph::{Community, CommunityId, ConsolidatedSummary, SummaryVersion};
use crate::similarity::normalize;
use crate::storage::{GraphStore, GraphTransaction};

/// `method` of a summary produced by the text aggregator.
pub const METHOD_AGGREGATOR: &str = "aggregator";
/// `method` of an attributed concatenation.
pub const METHOD_CONCATENATION: &str = "attributed_concatenation";

/// Two communities with overlapping context but different summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryConflict {
    /// First community, in store order.
    pub community_a: CommunityId,
    /// Second community.
    pub community_b: CommunityId,
    /// Token Jaccard overlap of the two summaries.
    pub overlap: f64,
    /// Shared vocabulary, sorted.
    pub shared_terms: Vec<String>,
}

/// Non-destructive versioning of one summary change.
#[must_use]
pub fn version_summary_changes(old: &str, new: &str) -> SummaryVersion {
    SummaryVersion {
        old: old.to_string(),
        new: new.to_string(),
        changed_at: Utc::now(),
    }
}

fn attributed(communities: &[Community]) -> String {
    communities
        .iter()
        .map(|c| format!("[From {}]: {}", c.name, c.summary.trim()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn consolidated(communities: &[Community], text: String, method: &str) -> ConsolidatedSummary {
    ConsolidatedSummary {
        text,
        originals: communities
            .iter()
            .map(|c| (c.id, c.summary.clone()))
            .collect(),
        method: method.to_string(),
        created_at: Utc::now(),
    }
}

/// Detects, merges and records community summary changes.
pub struct SummaryConsolidator {
    store: Arc<dyn GraphStore>,
    config: SummaryConfig,
    aggregator: Option<Arc<dyn TextAggregator>>,
}

impl std::fmt::Debug for SummaryConsolidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryConsolidator")
            .field("config", &self.config)
            .field("aggregator", &self.aggregator.is_some())
            .finish_non_exhaustive()
    }
}

impl SummaryConsolidator {
    /// Creates a consolidator without an aggregator.
    pub fn new(store: Arc<dyn GraphStore>, config: SummaryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            aggregator: None,
        })
    }

    /// Uses `aggregator` to synthesize conflicting summaries.
    #[must_use]
    pub fn with_aggregator(mut self, aggregator: Arc<dyn TextAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    /// Pairs of non-empty summaries whose vocabulary overlaps by at least
    /// `min_context_overlap` while their normalized texts differ.
    pub fn detect_summary_conflicts(
        &self,
        scope: Option<&[CommunityId]>,
    ) -> ConsolidationResult<Vec<SummaryConflict>> {
        let communities = self.store.communities()?;
        let scope: Option<HashSet<CommunityId>> = scope.map(|s| s.iter().copied().collect());
        let no_stopwords = BTreeSet::new();
        let prepared: Vec<_> = communities
            .iter()
            .map(|c| {
                (
                    normalize(&c.summary),
                    vocabulary(&c.summary, self.config.min_term_len, &no_stopwords),
                )
            })
            .collect();

        let mut conflicts = Vec::new();
        for i in 0..communities.len() {
            for j in (i + 1)..communities.len() {
                let (a, b) = (&communities[i], &communities[j]);
                if let Some(scope) = &scope {
                    if !scope.contains(&a.id) && !scope.contains(&b.id) {
                        continue;
                    }
                }
                let ((text_a, vocab_a), (text_b, vocab_b)) = (&prepared[i], &prepared[j]);
                if text_a.is_empty() || text_b.is_empty() || text_a == text_b {
                    continue;
                }
                let overlap = jaccard(vocab_a, vocab_b);
                if overlap < self.config.min_context_overlap {
                    continue;
                }
                conflicts.push(SummaryConflict {
                    community_a: a.id,
                    community_b: b.id,
                    overlap,
                    shared_terms: vocab_a.intersection(vocab_b).cloned().collect(),
                });
            }
        }

        info!(conflicts = conflicts.len(), "summary conflict detection finished");
        Ok(conflicts)
    }

    fn load_pair(&self, conflict: &SummaryConflict) -> ConsolidationResult<Vec<Community>> {
        [conflict.community_a, conflict.community_b]
            .into_iter()
            .map(|id| {
                self.store
                    .get_community(id)?
                    .ok_or_else(|| ConsolidationError::NotFound {
                        kind: "community",
                        id: id.to_string(),
                    })
            })
            .collect()
    }

    /// Attributed concatenation of each pair: `"[From A]: ... [From B]: ..."`.
    pub fn merge_complementary_summaries(
        &self,
        conflicts: &[SummaryConflict],
    ) -> ConsolidationResult<Vec<ConsolidatedSummary>> {
        conflicts
            .iter()
            .map(|conflict| {
                let pair = self.load_pair(conflict)?;
                Ok(consolidated(&pair, attributed(&pair), METHOD_CONCATENATION))
            })
            .collect()
    }

    /// Synthesizes each pair with the text aggregator.
    ///
    /// Falls back to attributed concatenation when no aggregator is set or
    /// it fails.
    pub fn resolve_summary_conflicts_with_external_aggregator(
        &self,
        conflicts: &[SummaryConflict],
    ) -> ConsolidationResult<Vec<ConsolidatedSummary>> {
        let mut out = Vec::with_capacity(conflicts.len());
        for conflict in conflicts {
            let pair = self.load_pair(conflict)?;
            let synthesized = self.aggregator.as_deref().and_then(|aggregator| {
                let variants: Vec<String> = pair.iter().map(|c| c.summary.clone()).collect();
                match synthesize_checked(aggregator, &variants) {
                    Ok(text) => Some(text),
                    Err(err) => {
                        warn!(
                            community_a = %conflict.community_a,
                            community_b = %conflict.community_b,
                            error = %err,
                            "summary aggregation failed, concatenating"
                        );
                        None
                    }
                }
            });
            out.push(match synthesized {
                Some(text) => consolidated(&pair, text, METHOD_AGGREGATOR),
                None => consolidated(&pair, attributed(&pair), METHOD_CONCATENATION),
            });
        }
        Ok(out)
    }

    /// Appends each consolidated summary to every community it covers.
    ///
    /// `summary` itself is left untouched; a summary already present with
    /// the same text and originals is not added again.
    pub fn apply_summary_resolutions(&self, resolutions: &[ConsolidatedSummary]) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        for resolution in resolutions {
            match self.apply_one(resolution) {
                Ok(true) => outcome.applied += 1,
                Ok(false) => outcome.unchanged += 1,
                Err(err) => {
                    let unit = resolution
                        .originals
                        .keys()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(",");
                    warn!(communities = %unit, error = %err, "failed to store consolidated summary");
                    outcome.failed.push(UnitFailure::new("summaries", unit, &err));
                }
            }
        }
        outcome
    }

    fn apply_one(&self, resolution: &ConsolidatedSummary) -> ConsolidationResult<bool> {
        let mut tx = GraphTransaction::new("consolidate_summary");
        for id in resolution.originals.keys() {
            let mut community = self
                .store
                .get_community(*id)?
                .ok_or_else(|| ConsolidationError::NotFound {
                    kind: "community",
                    id: id.to_string(),
                })?;
            if community
                .consolidated_summaries
                .iter()
                .any(|s| s.same_content(resolution))
            {
                continue;
            }
            community.consolidated_summaries.push(resolution.clone());
            community.touch();
            tx.put_community(community);
        }
        if tx.is_empty() {
            return Ok(false);
        }
        self.store.commit(tx)?;
        Ok(true)
    }

    /// Replaces a community's summary, keeping the old text as a version.
    ///
    /// Returns false when the text is unchanged.
    pub fn record_summary_change(
        &self,
        id: CommunityId,
        new_text: &str,
    ) -> ConsolidationResult<bool> {
        let mut community = self
            .store
            .get_community(id)?
            .ok_or_else(|| ConsolidationError::NotFound {
                kind: "community",
                id: id.to_string(),
            })?;
        if community.summary == new_text {
            return Ok(false);
        }
        community
            .summary_versions
            .push(version_summary_changes(&community.summary, new_text));
        community.summary = new_text.to_string();
        community.touch();

        let mut tx = GraphTransaction::new("summary_change");
        tx.put_community(community);
        self.store.commit(tx)?;
        debug!(community = %id, "summary change recorded");
        Ok(true)
    }
}
