//! Pipeline orchestration.
//!
//! Runs detection, merging, relationship discovery, conflict resolution,
//! community analysis and summary consolidation in that order. Each stage
//! writes non-destructively, so a run that stops part way leaves a graph
//! that the next run picks up from.
//!
//! A failed unit of work (one merge, one resolution, one link) is recorded
//! and skipped. A failed stage read aborts the rest of the run. Invalid
//! configuration is the only error returned to the caller.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::aggregator::TextAggregator;
use crate::community::{CommunityAnalyzer, LinkValidator};
use crate::config::ConsolidationConfig;
use crate::conflict::{ApplyOutcome, ConflictJudge, ConflictResolver};
use crate::detection::DuplicateDetector;
use crate::error::{ConfigError, ConsolidationError, ConsolidationResult, UnitFailure};
use crate::graph::{CommunityId, NodeId};
use crate::merge::NodeMerger;
use crate::relationships::RelationshipDiscoverer;
use crate::storage::{GraphStore, NodeLockTable};
use crate::summary::SummaryConsolidator;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Duplicate detection.
    Detection,
    /// Node merging.
    Merge,
    /// Relationship discovery.
    Relationships,
    /// Conflict resolution.
    Conflicts,
    /// Bridge entities and soft community links.
    Community,
    /// Summary consolidation.
    Summaries,
}

impl Stage {
    /// Every stage, in execution order.
    pub const ALL: [Stage; 6] = [
        Stage::Detection,
        Stage::Merge,
        Stage::Relationships,
        Stage::Conflicts,
        Stage::Community,
        Stage::Summaries,
    ];

    /// Name used in logs and metrics keys.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::Merge => "merge",
            Self::Relationships => "relationships",
            Self::Conflicts => "conflicts",
            Self::Community => "community",
            Self::Summaries => "summaries",
        }
    }
}

/// Unit-of-work counts for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Units that wrote or produced something.
    pub succeeded: u64,
    /// Units that failed and were skipped.
    pub failed: u64,
    /// Units with nothing to do (already applied, below threshold, not applied).
    pub skipped: u64,
}

impl StageMetrics {
    fn absorb(&mut self, outcome: &ApplyOutcome) {
        self.succeeded += outcome.applied as u64;
        self.skipped += (outcome.unchanged + outcome.skipped) as u64;
        self.failed += outcome.failed.len() as u64;
    }
}

/// What one run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    /// Per-stage unit counts. Every stage that ran has an entry.
    pub stages: BTreeMap<Stage, StageMetrics>,
    /// Named counters (`duplicate_groups`, `nodes_merged`, ...).
    pub counters: BTreeMap<String, u64>,
    /// Every failed unit, in the order it failed.
    pub failures: Vec<UnitFailure>,
    /// Stage at which the run stopped early, if it did.
    pub aborted_at: Option<Stage>,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

impl ConsolidationReport {
    /// Flattens the report into `stage.succeeded`-style keys plus counters.
    #[must_use]
    pub fn to_metrics_map(&self) -> BTreeMap<String, u64> {
        let mut out = self.counters.clone();
        for (stage, m) in &self.stages {
            let name = stage.name();
            out.insert(format!("{name}.succeeded"), m.succeeded);
            out.insert(format!("{name}.failed"), m.failed);
            out.insert(format!("{name}.skipped"), m.skipped);
        }
        out.insert("failures".to_string(), self.failures.len() as u64);
        out.insert("aborted".to_string(), u64::from(self.aborted_at.is_some()));
        out.insert("duration_ms".to_string(), self.duration_ms);
        out
    }

    /// Metrics of `stage`, zero if it did not run.
    #[must_use]
    pub fn stage(&self, stage: Stage) -> StageMetrics {
        self.stages.get(&stage).copied().unwrap_or_default()
    }

    /// Value of a named counter, zero if never set.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    fn add(&mut self, name: &str, n: usize) {
        *self.counters.entry(name.to_string()).or_insert(0) += n as u64;
    }

    fn metrics(&mut self, stage: Stage) -> &mut StageMetrics {
        self.stages.entry(stage).or_default()
    }

    fn record_outcome(&mut self, stage: Stage, outcome: ApplyOutcome) {
        self.metrics(stage).absorb(&outcome);
        self.failures.extend(outcome.failed);
    }
}

/// Entities and communities touched by an ingestion event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    /// New or updated entities.
    #[serde(default)]
    pub node_ids: Vec<NodeId>,
    /// Affected communities.
    #[serde(default)]
    pub community_ids: Vec<CommunityId>,
}

impl Changeset {
    /// Returns true if the changeset names nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty() && self.community_ids.is_empty()
    }
}

#[derive(Clone, Copy)]
struct Scope<'a> {
    nodes: Option<&'a [NodeId]>,
    communities: Option<&'a [CommunityId]>,
}

/// Stops the runs in flight at their next unit boundary.
///
/// Cancelling does not undo anything: every committed unit stays. Runs that
/// start after the call are not affected.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    epoch: Arc<AtomicU64>,
}

impl CancelHandle {
    /// Cancels every run currently in flight.
    pub fn cancel(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

/// Stage failure that ends the run.
struct Abort(Stage, ConsolidationError);

/// Runs the whole consolidation pipeline.
pub struct Consolidator {
    config: ConsolidationConfig,
    detector: DuplicateDetector,
    merger: NodeMerger,
    discoverer: RelationshipDiscoverer,
    resolver: ConflictResolver,
    analyzer: CommunityAnalyzer,
    summaries: SummaryConsolidator,
    cancel: CancelHandle,
}

impl std::fmt::Debug for Consolidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consolidator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Consolidator {
    /// Validates `config` and builds every stage over `store`.
    pub fn new(store: Arc<dyn GraphStore>, config: ConsolidationConfig) -> Result<Self, ConfigError> {
        Self::with_locks(store, Arc::new(NodeLockTable::new()), config)
    }

    /// Like [`Consolidator::new`], sharing `locks` with other writers.
    pub fn with_locks(
        store: Arc<dyn GraphStore>,
        locks: Arc<NodeLockTable>,
        config: ConsolidationConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let detector = DuplicateDetector::new(Arc::clone(&store), config.detector.clone())?;
        let merger = NodeMerger::with_locks(Arc::clone(&store), Arc::clone(&locks), config.merge.clone());
        let discoverer = RelationshipDiscoverer::new(
            Arc::clone(&store),
            config.relationships.clone(),
            config.detector.similarity_threshold,
        )?
        .with_method(config.detector.method)
        .with_locks(Arc::clone(&locks));
        let resolver = ConflictResolver::new(Arc::clone(&store), config.conflict.clone())?
            .with_locks(Arc::clone(&locks));
        let analyzer = CommunityAnalyzer::new(Arc::clone(&store), config.community.clone())?
            .with_locks(locks);
        let summaries = SummaryConsolidator::new(store, config.summary.clone())?;
        Ok(Self {
            config,
            detector,
            merger,
            discoverer,
            resolver,
            analyzer,
            summaries,
            cancel: CancelHandle::default(),
        })
    }

    /// Uses `aggregator` for conflict and summary synthesis.
    #[must_use]
    pub fn with_aggregator(mut self, aggregator: Arc<dyn TextAggregator>) -> Self {
        self.resolver = self.resolver.with_aggregator(Arc::clone(&aggregator));
        self.summaries = self.summaries.with_aggregator(aggregator);
        self
    }

    /// Lets `judge` resolve conflicts before the configured policy.
    #[must_use]
    pub fn with_judge(mut self, judge: Arc<dyn ConflictJudge>) -> Self {
        self.resolver = self.resolver.with_judge(judge);
        self
    }

    /// Replaces the community link validator.
    #[must_use]
    pub fn with_link_validator(mut self, validator: Arc<dyn LinkValidator>) -> Self {
        self.analyzer = self.analyzer.with_validator(validator);
        self
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Handle that cancels the runs in flight.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Consolidates the whole graph.
    pub fn run_consolidation(&self, batch_size: usize) -> ConsolidationResult<ConsolidationReport> {
        self.run(
            Scope {
                nodes: None,
                communities: None,
            },
            batch_size,
        )
    }

    /// Consolidates around one ingestion event.
    ///
    /// Detection, merging, relationship discovery and conflict resolution are
    /// restricted to groups touching `changeset.node_ids`; community and
    /// summary work to `changeset.community_ids`.
    pub fn incremental_update(
        &self,
        changeset: &Changeset,
        batch_size: usize,
    ) -> ConsolidationResult<ConsolidationReport> {
        self.run(
            Scope {
                nodes: Some(&changeset.node_ids),
                communities: Some(&changeset.community_ids),
            },
            batch_size,
        )
    }

    fn run(&self, scope: Scope<'_>, batch_size: usize) -> ConsolidationResult<ConsolidationReport> {
        if batch_size == 0 {
            return Err(ConfigError::NonPositive { name: "batch_size" }.into());
        }
        let started = Instant::now();
        let epoch = self.cancel.epoch();
        let mut report = ConsolidationReport::default();

        match self.stages(scope, batch_size, epoch, &mut report) {
            Ok(()) => {}
            Err(Abort(stage, err)) if err.is_configuration() => {
                warn!(stage = stage.name(), error = %err, "consolidation aborted by configuration");
                return Err(err);
            }
            Err(Abort(stage, err)) => {
                warn!(stage = stage.name(), error = %err, "consolidation aborted");
                report.aborted_at = Some(stage);
                report.metrics(stage).failed += 1;
                report
                    .failures
                    .push(UnitFailure::new(stage.name(), stage.name(), &err));
            }
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            incremental = scope.nodes.is_some(),
            failures = report.failures.len(),
            aborted = report.aborted_at.is_some(),
            duration_ms = report.duration_ms,
            "consolidation finished"
        );
        Ok(report)
    }

    fn check_cancel(&self, stage: Stage, epoch: u64) -> Result<(), Abort> {
        if self.cancel.epoch() != epoch {
            return Err(Abort(stage, ConsolidationError::internal("run cancelled")));
        }
        Ok(())
    }

    fn stages(
        &self,
        scope: Scope<'_>,
        batch_size: usize,
        epoch: u64,
        report: &mut ConsolidationReport,
    ) -> Result<(), Abort> {
        let abort = |stage: Stage| move |err: ConsolidationError| Abort(stage, err);

        self.check_cancel(Stage::Detection, epoch)?;
        let groups = self
            .detector
            .find_duplicates(scope.nodes, batch_size)
            .map_err(abort(Stage::Detection))?;
        report.metrics(Stage::Detection).succeeded += groups.len() as u64;
        report.add("duplicate_groups", groups.len());

        let mut redirected: HashMap<NodeId, NodeId> = HashMap::new();
        for group in &groups {
            self.check_cancel(Stage::Merge, epoch)?;
            match self.merger.merge_group(group) {
                Ok(result) if result.already_applied => report.metrics(Stage::Merge).skipped += 1,
                Ok(result) => {
                    report.metrics(Stage::Merge).succeeded += 1;
                    report.add("nodes_merged", result.merged_node_ids.len());
                    report.add("relationships_updated", result.relationships_updated);
                    for id in &result.merged_node_ids {
                        redirected.insert(*id, result.kept_node_id);
                    }
                }
                Err(err) if err.is_configuration() => return Err(Abort(Stage::Merge, err)),
                Err(err) => {
                    let unit = join_ids(&group.node_ids);
                    warn!(group = %unit, error = %err, "merge failed");
                    report.metrics(Stage::Merge).failed += 1;
                    report.failures.push(UnitFailure::new(Stage::Merge.name(), unit, &err));
                }
            }
        }

        // Scoped ids folded away by a merge now live on the kept node.
        let merged_scope: Option<Vec<NodeId>> = scope.nodes.map(|ids| {
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                let id = redirected.get(id).copied().unwrap_or(*id);
                if !out.contains(&id) {
                    out.push(id);
                }
            }
            out
        });
        let node_scope = merged_scope.as_deref();

        self.check_cancel(Stage::Relationships, epoch)?;
        let candidates = self
            .discoverer
            .discover(node_scope, batch_size)
            .map_err(abort(Stage::Relationships))?;
        report.add("relationship_candidates", candidates.len());
        if self.config.relationships.auto_apply {
            let outcome = self.discoverer.apply_candidates(&candidates);
            report.add("relationships_created", outcome.applied);
            report.record_outcome(Stage::Relationships, outcome);
        } else {
            report.metrics(Stage::Relationships).skipped += candidates.len() as u64;
        }

        self.check_cancel(Stage::Conflicts, epoch)?;
        let conflicts = self
            .resolver
            .detect_conflicts(node_scope, batch_size)
            .map_err(abort(Stage::Conflicts))?;
        let resolutions = self.resolver.resolve_conflicts(&conflicts);
        report.add("conflict_groups", conflicts.len());
        report.add("resolutions", resolutions.len());
        let outcome = self.resolver.apply_resolutions(&resolutions);
        report.record_outcome(Stage::Conflicts, outcome);

        self.check_cancel(Stage::Community, epoch)?;
        let bridges = self
            .analyzer
            .identify_bridge_entities(scope.communities, batch_size)
            .map_err(abort(Stage::Community))?;
        report.add("bridge_entities", bridges.len());
        if self.analyzer.config().annotate_bridges {
            let outcome = self.analyzer.annotate_bridge_entities(&bridges);
            report.record_outcome(Stage::Community, outcome);
        }
        let proposals = self
            .analyzer
            .find_inter_community_relationships(scope.communities)
            .map_err(abort(Stage::Community))?;
        let validated = self.analyzer.validate_community_link_proposals(&proposals);
        report.add("link_proposals", proposals.len());
        report.add("links_validated", validated.len());
        report.metrics(Stage::Community).skipped += (proposals.len() - validated.len()) as u64;
        let outcome = self.analyzer.create_soft_community_links(&validated);
        report.add("community_links_written", outcome.applied);
        report.record_outcome(Stage::Community, outcome);

        self.check_cancel(Stage::Summaries, epoch)?;
        let summary_conflicts = self
            .summaries
            .detect_summary_conflicts(scope.communities)
            .map_err(abort(Stage::Summaries))?;
        report.add("summary_conflicts", summary_conflicts.len());
        let consolidated = self
            .summaries
            .resolve_summary_conflicts_with_external_aggregator(&summary_conflicts)
            .map_err(abort(Stage::Summaries))?;
        let outcome = self.summaries.apply_summary_resolutions(&consolidated);
        report.record_outcome(Stage::Summaries, outcome);

        Ok(())
    }
}

fn join_ids(ids: &[NodeId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Community, Node};
    use crate::storage::InMemoryGraphStore;
    use serde_json::json;

    fn insert(store: &InMemoryGraphStore, node: Node) -> NodeId {
        let id = node.id;
        store.insert_node(node).unwrap();
        id
    }

    fn consolidator(store: &Arc<InMemoryGraphStore>) -> Consolidator {
        Consolidator::new(store.clone(), ConsolidationConfig::default()).unwrap()
    }

    #[test]
    fn test_full_run_merges_and_reports() {
        let store = Arc::new(InMemoryGraphStore::new());
        let frodo = insert(&store, Node::new("Frodo", ["Hobbit"]).with_alias("Frodo Baggins"));
        insert(&store, Node::new("frodo baggins", ["Hobbit"]));
        store
            .insert_community(Community::new("Shire", "Frodo lives in Bag End."))
            .unwrap();
        store
            .insert_community(Community::new("Mordor", "Frodo carries the ring to Mount Doom."))
            .unwrap();

        let report = consolidator(&store).run_consolidation(100).unwrap();
        assert_eq!(report.aborted_at, None);
        assert_eq!(report.counter("duplicate_groups"), 1);
        assert_eq!(report.stage(Stage::Merge).succeeded, 1);
        assert_eq!(report.counter("nodes_merged"), 1);
        assert_eq!(report.counter("bridge_entities"), 1);
        assert!(report.failures.is_empty());
        assert_eq!(store.node_count().unwrap(), 1);
        assert!(store.get_node(frodo).unwrap().unwrap().is_bridge);

        let metrics = report.to_metrics_map();
        assert_eq!(metrics["merge.succeeded"], 1);
        assert_eq!(metrics["aborted"], 0);
    }

    #[test]
    fn test_second_run_is_quiet() {
        let store = Arc::new(InMemoryGraphStore::new());
        insert(&store, Node::new("Aragorn", ["Man"]).with_property("realm", json!("Gondor")));
        insert(&store, Node::new("Aragorn", ["Man"]).with_property("realm", json!("Arnor")));
        let c = consolidator(&store);

        let first = c.run_consolidation(10).unwrap();
        assert_eq!(first.stage(Stage::Merge).succeeded, 1);
        let second = c.run_consolidation(10).unwrap();
        assert_eq!(second.counter("duplicate_groups"), 0);
        assert_eq!(second.counter("conflict_groups"), 0);
        assert_eq!(second.stage(Stage::Conflicts), StageMetrics::default());
    }

    #[test]
    fn test_incremental_update_respects_scope() {
        let store = Arc::new(InMemoryGraphStore::new());
        let a = insert(&store, Node::new("Frodo", ["Hobbit"]));
        insert(&store, Node::new("frodo", ["Hobbit"]));
        insert(&store, Node::new("Sam", ["Hobbit"]));
        insert(&store, Node::new("sam", ["Hobbit"]));
        let c = consolidator(&store);

        let report = c
            .incremental_update(
                &Changeset {
                    node_ids: vec![a],
                    community_ids: Vec::new(),
                },
                10,
            )
            .unwrap();
        assert_eq!(report.counter("duplicate_groups"), 1);
        assert_eq!(store.node_count().unwrap(), 3);

        let empty = c.incremental_update(&Changeset::default(), 10).unwrap();
        assert_eq!(empty.counter("duplicate_groups"), 0);
    }

    #[test]
    fn test_zero_batch_is_configuration_error() {
        let store = Arc::new(InMemoryGraphStore::new());
        let err = consolidator(&store).run_consolidation(0).unwrap_err();
        assert!(err.is_configuration());
    }

    struct CancelOnJudge(CancelHandle);

    impl ConflictJudge for CancelOnJudge {
        fn judge(
            &self,
            _: &str,
            _: &[serde_json::Value],
            _: &crate::graph::ValueProvenance,
        ) -> Option<crate::conflict::Judgement> {
            self.0.cancel();
            None
        }
    }

    #[test]
    fn test_cancel_stops_the_run_in_flight_only() {
        let store = Arc::new(InMemoryGraphStore::new());
        insert(&store, Node::new("Aragorn", ["Man"]).with_property("realm", json!("Gondor")));
        insert(&store, Node::new("Aragorn", ["King"]).with_property("realm", json!("Arnor")));
        // Fuzzy only, so the differently labelled pair is left unmerged and in conflict.
        let mut config = ConsolidationConfig::default();
        config.detector.strategies = vec![crate::config::Strategy::Fuzzy];
        let c = Consolidator::new(store.clone(), config).unwrap();
        let c = {
            let handle = c.cancel_handle();
            c.with_judge(Arc::new(CancelOnJudge(handle)))
        };

        // The judge cancels while conflicts are resolved; the next boundary stops.
        let report = c.run_consolidation(10).unwrap();
        assert_eq!(report.aborted_at, Some(Stage::Community));
        assert_eq!(report.to_metrics_map()["aborted"], 1);
        assert_eq!(report.stage(Stage::Conflicts).succeeded, 2);

        // A cancel before a run starts does not reach it.
        c.cancel_handle().cancel();
        let store = Arc::new(InMemoryGraphStore::new());
        insert(&store, Node::new("Frodo", ["Hobbit"]));
        insert(&store, Node::new("frodo", ["Hobbit"]));
        let fresh = consolidator(&store);
        fresh.cancel_handle().cancel();
        let report = fresh.run_consolidation(10).unwrap();
        assert_eq!(report.aborted_at, None);
        assert_eq!(report.counter("nodes_merged"), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store = Arc::new(InMemoryGraphStore::new());
        let mut config = ConsolidationConfig::default();
        config.detector.similarity_threshold = 2.0;
        assert!(Consolidator::new(store, config).is_err());
    }
}
