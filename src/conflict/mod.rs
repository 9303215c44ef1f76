//! Conflict detection and resolution, independent of merging.
//!
//! Nodes sharing a normalized name (the exact-duplicate key) are compared
//! property by property. Disagreements are resolved by a policy, optionally
//! overridden by an external judge, and applied non-destructively: the chosen
//! value goes under `properties`, every variant stays under `conflicts`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::aggregator::{synthesize_checked, TextAggregator};
use crate::config::{ConflictConfig, ResolutionPolicy, ValueStrategy};
use crate::detection::claim_shared_keys;
use crate::error::{
    ConfigError, ConsolidationError, ConsolidationResult, UnitFailure, ValidationError,
};
use crate::graph::{is_empty_value, push_unique, value_key, Node, NodeId, ValueProvenance};
use crate::merge::{collect_node_variants, VariantSet};
use crate::similarity::normalized_names;
use crate::storage::{GraphStore, GraphTransaction, NodeLockTable};

/// Confidence of a synthesized value.
const AGGREGATE_CONFIDENCE: f64 = 0.6;

/// Nodes sharing a name whose property values disagree. Transient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictGroup {
    /// Members, store order.
    pub node_ids: Vec<NodeId>,
    /// Property -> every variant, first-seen order.
    pub conflicting_properties: BTreeMap<String, Vec<Value>>,
    /// Property -> value key -> origin ids.
    pub provenance: BTreeMap<String, ValueProvenance>,
    /// Why these nodes were compared.
    pub context: BTreeMap<String, Value>,
}

/// Decision for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Target node.
    pub node_id: NodeId,
    /// Property -> chosen value.
    pub resolved_properties: BTreeMap<String, Value>,
    /// Human-readable reason, one clause per property.
    pub rationale: String,
    /// Lowest per-property confidence.
    pub confidence: f64,
    /// Property -> value key -> origin ids.
    pub provenance: BTreeMap<String, ValueProvenance>,
    /// Property -> every variant to retain, including the chosen value.
    pub variants: BTreeMap<String, Vec<Value>>,
}

/// A judge's pick for one property.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgement {
    /// Chosen value. Need not be one of the variants; it is retained as one.
    pub value: Value,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Reason.
    pub rationale: String,
}

/// External reviewer that may decide a conflict instead of the policy.
///
/// Returning `None` defers to the configured policy.
pub trait ConflictJudge: Send + Sync {
    /// Pick a value for `property` among `variants`.
    fn judge(
        &self,
        property: &str,
        variants: &[Value],
        provenance: &ValueProvenance,
    ) -> Option<Judgement>;
}

/// Result of applying a batch of proposals (resolutions or relationships).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    /// Proposals written.
    pub applied: usize,
    /// Proposals already in place; nothing written.
    pub unchanged: usize,
    /// Proposals below `min_confidence`; nothing written.
    pub skipped: usize,
    /// Proposals that failed.
    pub failed: Vec<UnitFailure>,
}

/// Detects, resolves and applies property conflicts.
pub struct ConflictResolver {
    store: Arc<dyn GraphStore>,
    locks: Arc<NodeLockTable>,
    config: ConflictConfig,
    aggregator: Option<Arc<dyn TextAggregator>>,
    judge: Option<Arc<dyn ConflictJudge>>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("config", &self.config)
            .field("aggregator", &self.aggregator.is_some())
            .field("judge", &self.judge.is_some())
            .finish_non_exhaustive()
    }
}

impl ConflictResolver {
    /// Creates a resolver, validating `config`.
    pub fn new(store: Arc<dyn GraphStore>, config: ConflictConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            locks: Arc::new(NodeLockTable::new()),
            config,
            aggregator: None,
            judge: None,
        })
    }

    /// Shares `locks` with other writers.
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<NodeLockTable>) -> Self {
        self.locks = locks;
        self
    }

    /// Text aggregator used by [`ResolutionPolicy::Aggregate`].
    #[must_use]
    pub fn with_aggregator(mut self, aggregator: Arc<dyn TextAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    /// Judge consulted before the policy.
    #[must_use]
    pub fn with_judge(mut self, judge: Arc<dyn ConflictJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Groups nodes by shared normalized name and reports disagreeing properties.
    ///
    /// A property conflicts when the members' current values differ. Reported
    /// variants also include values retained by earlier merges or resolutions.
    /// With a `scope`, only groups containing a scoped node are reported.
    pub fn detect_conflicts(
        &self,
        scope: Option<&[NodeId]>,
        batch_size: usize,
    ) -> ConsolidationResult<Vec<ConflictGroup>> {
        if batch_size == 0 {
            return Err(ConfigError::NonPositive { name: "batch_size" }.into());
        }
        let nodes: Vec<Node> = self.store.scan_all_nodes(batch_size)?;
        let keys: Vec<Vec<String>> = nodes.iter().map(normalized_names).collect();
        let in_scope = |members: &[usize]| {
            scope.map_or(true, |ids| members.iter().any(|&i| ids.contains(&nodes[i].id)))
        };

        let entries = keys
            .iter()
            .enumerate()
            .filter(|(_, k)| !k.is_empty())
            .map(|(i, k)| (i, k.as_slice()));

        let mut groups = Vec::new();
        for (key, members) in claim_shared_keys(entries, in_scope) {
            let members: Vec<&Node> = members.iter().map(|&i| &nodes[i]).collect();
            if let Some(group) = self.compare_group(&key, &members) {
                groups.push(group);
            }
        }

        info!(groups = groups.len(), "conflict detection finished");
        Ok(groups)
    }

    fn compare_group(&self, key: &str, members: &[&Node]) -> Option<ConflictGroup> {
        let mut current: BTreeMap<&str, Vec<&Value>> = BTreeMap::new();
        for node in members {
            for (prop, value) in &node.properties {
                if is_empty_value(value) || self.config.ignored_properties.contains(prop) {
                    continue;
                }
                let seen = current.entry(prop.as_str()).or_default();
                if !seen.contains(&value) {
                    seen.push(value);
                }
            }
        }

        let mut variants: BTreeMap<String, VariantSet> = BTreeMap::new();
        for node in members {
            collect_node_variants(node, &mut variants);
        }

        let mut conflicting_properties = BTreeMap::new();
        let mut provenance = BTreeMap::new();
        for (prop, values) in current {
            if values.len() < 2 {
                continue;
            }
            let Some(set) = variants.get(prop) else {
                continue;
            };
            conflicting_properties.insert(prop.to_string(), set.values());
            provenance.insert(prop.to_string(), set.provenance());
        }
        if conflicting_properties.is_empty() {
            return None;
        }

        let mut context = BTreeMap::new();
        context.insert("shared_name".to_string(), Value::String(key.to_string()));
        Some(ConflictGroup {
            node_ids: members.iter().map(|n| n.id).collect(),
            conflicting_properties,
            provenance,
            context,
        })
    }

    /// Resolves every group, one [`Resolution`] per member node.
    ///
    /// Deterministic for a given input unless an aggregator or judge is set.
    pub fn resolve_conflicts(&self, groups: &[ConflictGroup]) -> Vec<Resolution> {
        let mut out = Vec::new();
        for group in groups {
            let mut resolved = BTreeMap::new();
            let mut rationale = Vec::new();
            let mut confidence = 1.0f64;
            let mut variants = BTreeMap::new();

            for (prop, values) in &group.conflicting_properties {
                let provenance = group.provenance.get(prop).cloned().unwrap_or_default();
                let set = variant_set(values, &provenance);
                let Some(decision) = self.decide(prop, &set, &provenance) else {
                    continue;
                };
                let mut retained = set.values();
                if !retained.contains(&decision.value) {
                    retained.push(decision.value.clone());
                }
                confidence = confidence.min(decision.confidence);
                rationale.push(format!("{prop}: {}", decision.rationale));
                resolved.insert(prop.clone(), decision.value);
                variants.insert(prop.clone(), retained);
            }
            if resolved.is_empty() {
                continue;
            }

            let provenance: BTreeMap<String, ValueProvenance> = group
                .provenance
                .iter()
                .filter(|(k, _)| resolved.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let rationale = rationale.join("; ");
            for id in &group.node_ids {
                out.push(Resolution {
                    node_id: *id,
                    resolved_properties: resolved.clone(),
                    rationale: rationale.clone(),
                    confidence,
                    provenance: provenance.clone(),
                    variants: variants.clone(),
                });
            }
        }
        debug!(resolutions = out.len(), "conflicts resolved");
        out
    }

    fn decide(&self, prop: &str, set: &VariantSet, provenance: &ValueProvenance) -> Option<Judgement> {
        if let Some(judge) = &self.judge {
            if let Some(judgement) = judge.judge(prop, &set.values(), provenance) {
                return Some(Judgement {
                    confidence: judgement.confidence.clamp(0.0, 1.0),
                    ..judgement
                });
            }
        }

        let policy = self.config.policy_for(prop);
        if policy == ResolutionPolicy::Aggregate {
            if let Some(judgement) = self.aggregate(prop, set) {
                return Some(judgement);
            }
        }

        let strategy = match policy {
            ResolutionPolicy::FirstSeen => ValueStrategy::FirstSeen,
            ResolutionPolicy::MostProvenance | ResolutionPolicy::Aggregate => {
                ValueStrategy::MostProvenance
            }
        };
        let idx = set.pick(strategy)?;
        let chosen = &set.variants()[idx];
        let total: usize = set.variants().iter().map(|v| v.origins.len()).sum();
        #[allow(clippy::cast_precision_loss)]
        let confidence = if total == 0 {
            0.0
        } else {
            chosen.origins.len() as f64 / total as f64
        };
        Some(Judgement {
            value: chosen.value.clone(),
            confidence,
            rationale: format!(
                "{} picked {} ({} of {} sources)",
                policy.name(),
                value_key(&chosen.value),
                chosen.origins.len(),
                total
            ),
        })
    }

    fn aggregate(&self, prop: &str, set: &VariantSet) -> Option<Judgement> {
        let aggregator = self.aggregator.as_ref()?;
        let texts: Option<Vec<String>> = set
            .variants()
            .iter()
            .map(|v| v.value.as_str().map(str::to_string))
            .collect();
        let texts = texts?;
        match synthesize_checked(aggregator.as_ref(), &texts) {
            Ok(text) => Some(Judgement {
                value: Value::String(text),
                confidence: AGGREGATE_CONFIDENCE,
                rationale: format!("aggregated {} variants", texts.len()),
            }),
            Err(err) => {
                warn!(property = prop, error = %err, "aggregator failed; falling back to most_provenance");
                None
            }
        }
    }

    /// Writes resolutions, one transaction per node.
    ///
    /// Chosen values go under `properties`; every variant stays in
    /// `conflicts`/`conflict_provenance`. Re-applying a resolution that is
    /// already in place writes nothing. A failing resolution is recorded and
    /// the rest still run.
    pub fn apply_resolutions(&self, resolutions: &[Resolution]) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        for resolution in resolutions {
            if resolution.confidence < self.config.min_confidence {
                outcome.skipped += 1;
                continue;
            }
            match self.apply_one(resolution) {
                Ok(true) => outcome.applied += 1,
                Ok(false) => outcome.unchanged += 1,
                Err(err) => {
                    warn!(node = %resolution.node_id, error = %err, "failed to apply resolution");
                    outcome
                        .failed
                        .push(UnitFailure::new("conflicts", resolution.node_id.to_string(), &err));
                }
            }
        }
        info!(
            applied = outcome.applied,
            unchanged = outcome.unchanged,
            skipped = outcome.skipped,
            failed = outcome.failed.len(),
            "resolutions applied"
        );
        outcome
    }

    fn apply_one(&self, resolution: &Resolution) -> ConsolidationResult<bool> {
        let id = resolution.node_id;
        if resolution.resolved_properties.is_empty() {
            return Err(ValidationError::EmptyResolution { id }.into());
        }

        let _guard = self.locks.acquire([id])?;
        let node = self
            .store
            .get_node(id)?
            .ok_or_else(|| ConsolidationError::node_not_found(id))?;
        if let Some(into) = node.merged_into {
            return Err(ValidationError::AlreadyMerged { id, into }.into());
        }

        let mut updated = node.clone();
        for (prop, value) in &resolution.resolved_properties {
            let variants = updated.conflicts.entry(prop.clone()).or_default();
            let provenance = updated.conflict_provenance.entry(prop.clone()).or_default();

            if let Some(previous) = node.properties.get(prop) {
                if !is_empty_value(previous) && !variants.contains(previous) {
                    variants.push(previous.clone());
                    push_unique(provenance.entry(value_key(previous)).or_default(), id);
                }
            }
            for candidate in resolution.variants.get(prop).into_iter().flatten() {
                if !variants.contains(candidate) {
                    variants.push(candidate.clone());
                }
            }
            if !variants.contains(value) {
                variants.push(value.clone());
            }
            if let Some(recorded) = resolution.provenance.get(prop) {
                for (key, ids) in recorded {
                    let slot = provenance.entry(key.clone()).or_default();
                    for origin in ids {
                        push_unique(slot, *origin);
                    }
                }
            }
            updated.properties.insert(prop.clone(), value.clone());
        }

        if updated.properties == node.properties
            && updated.conflicts == node.conflicts
            && updated.conflict_provenance == node.conflict_provenance
        {
            return Ok(false);
        }

        updated.touch();
        let mut tx = GraphTransaction::new("resolve_conflict");
        tx.put_node(updated);
        self.store.commit(tx)?;
        debug!(node = %id, properties = resolution.resolved_properties.len(), "resolution applied");
        Ok(true)
    }
}

fn variant_set(values: &[Value], provenance: &ValueProvenance) -> VariantSet {
    let mut set = VariantSet::default();
    for value in values {
        let origins = provenance.get(&value_key(value)).cloned().unwrap_or_default();
        set.add(value, &origins);
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AggregationError;
    use crate::storage::InMemoryGraphStore;
    use serde_json::json;

    fn insert(store: &InMemoryGraphStore, node: Node) -> NodeId {
        let id = node.id;
        store.insert_node(node).unwrap();
        id
    }

    fn resolver(store: &Arc<InMemoryGraphStore>, config: ConflictConfig) -> ConflictResolver {
        ConflictResolver::new(store.clone(), config).unwrap()
    }

    fn aragorns(store: &InMemoryGraphStore, realms: &[&str]) -> Vec<NodeId> {
        realms
            .iter()
            .map(|r| insert(store, Node::new("Aragorn", ["Man"]).with_property("realm", json!(r))))
            .collect()
    }

    #[test]
    fn test_detect_conflicts() {
        let store = Arc::new(InMemoryGraphStore::new());
        let ids = aragorns(&store, &["Gondor", "Arnor"]);
        insert(&store, Node::new("Legolas", ["Elf"]).with_property("realm", json!("Mirkwood")));

        let groups = resolver(&store, ConflictConfig::default())
            .detect_conflicts(None, 10)
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].node_ids, ids);
        assert_eq!(
            groups[0].conflicting_properties["realm"],
            vec![json!("Gondor"), json!("Arnor")]
        );
        assert_eq!(groups[0].provenance["realm"][r#""Arnor""#], vec![ids[1]]);
        assert_eq!(groups[0].context["shared_name"], json!("aragorn"));
    }

    #[test]
    fn test_agreeing_nodes_are_not_conflicts() {
        let store = Arc::new(InMemoryGraphStore::new());
        aragorns(&store, &["Gondor", "Gondor"]);
        let groups = resolver(&store, ConflictConfig::default())
            .detect_conflicts(None, 10)
            .unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_ignored_properties() {
        let store = Arc::new(InMemoryGraphStore::new());
        aragorns(&store, &["Gondor", "Arnor"]);
        let mut config = ConflictConfig::default();
        config.ignored_properties.insert("realm".to_string());
        assert!(resolver(&store, config).detect_conflicts(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_most_provenance_wins() {
        let store = Arc::new(InMemoryGraphStore::new());
        let ids = aragorns(&store, &["Arnor", "Gondor", "Gondor"]);
        let r = resolver(&store, ConflictConfig::default());

        let groups = r.detect_conflicts(None, 10).unwrap();
        let resolutions = r.resolve_conflicts(&groups);
        assert_eq!(resolutions.len(), 3);
        assert_eq!(
            resolutions.iter().map(|r| r.node_id).collect::<Vec<_>>(),
            ids
        );
        for res in &resolutions {
            assert_eq!(res.resolved_properties["realm"], json!("Gondor"));
            assert!((res.confidence - 2.0 / 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_tie_breaks_on_earliest_and_is_deterministic() {
        let store = Arc::new(InMemoryGraphStore::new());
        aragorns(&store, &["Arnor", "Gondor"]);
        let r = resolver(&store, ConflictConfig::default());

        let groups = r.detect_conflicts(None, 10).unwrap();
        let first = r.resolve_conflicts(&groups);
        let second = r.resolve_conflicts(&groups);
        assert_eq!(first, second);
        assert_eq!(first[0].resolved_properties["realm"], json!("Arnor"));
    }

    #[test]
    fn test_apply_converges_and_is_idempotent() {
        let store = Arc::new(InMemoryGraphStore::new());
        let ids = aragorns(&store, &["Gondor", "Arnor"]);
        let r = resolver(&store, ConflictConfig::default());

        let resolutions = r.resolve_conflicts(&r.detect_conflicts(None, 10).unwrap());
        let outcome = r.apply_resolutions(&resolutions);
        assert_eq!(outcome.applied, 2);
        assert!(outcome.failed.is_empty());

        let second = store.get_node(ids[1]).unwrap().unwrap();
        assert_eq!(second.properties["realm"], json!("Gondor"));
        assert_eq!(second.conflicts["realm"], vec![json!("Arnor"), json!("Gondor")]);
        assert_eq!(second.conflict_provenance["realm"][r#""Arnor""#], vec![ids[1]]);
        assert_eq!(second.conflict_provenance["realm"][r#""Gondor""#], vec![ids[0]]);

        let again = r.apply_resolutions(&resolutions);
        assert_eq!(again.applied, 0);
        assert_eq!(again.unchanged, 2);
        assert!(r.detect_conflicts(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_min_confidence_skips() {
        let store = Arc::new(InMemoryGraphStore::new());
        aragorns(&store, &["Gondor", "Arnor"]);
        let r = resolver(
            &store,
            ConflictConfig {
                min_confidence: 0.9,
                ..ConflictConfig::default()
            },
        );
        let resolutions = r.resolve_conflicts(&r.detect_conflicts(None, 10).unwrap());
        let outcome = r.apply_resolutions(&resolutions);
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.applied, 0);
    }

    #[test]
    fn test_missing_node_is_recorded_failure() {
        let store = Arc::new(InMemoryGraphStore::new());
        let r = resolver(&store, ConflictConfig::default());
        let resolution = Resolution {
            node_id: NodeId::new(),
            resolved_properties: [("realm".to_string(), json!("Gondor"))].into_iter().collect(),
            rationale: String::new(),
            confidence: 1.0,
            provenance: BTreeMap::new(),
            variants: BTreeMap::new(),
        };
        let empty = Resolution {
            resolved_properties: BTreeMap::new(),
            ..resolution.clone()
        };
        let outcome = r.apply_resolutions(&[resolution, empty]);
        assert_eq!(outcome.failed.len(), 2);
        assert_eq!(outcome.failed[0].stage, "conflicts");
    }

    #[test]
    fn test_aggregate_policy_and_fallback() {
        let store = Arc::new(InMemoryGraphStore::new());
        aragorns(&store, &["Gondor", "Arnor"]);
        let config = ConflictConfig {
            policy: ResolutionPolicy::Aggregate,
            ..ConflictConfig::default()
        };

        let working = resolver(&store, config.clone()).with_aggregator(Arc::new(
            |variants: &[String]| Ok::<_, AggregationError>(variants.join(" and ")),
        ));
        let groups = working.detect_conflicts(None, 10).unwrap();
        let resolutions = working.resolve_conflicts(&groups);
        assert_eq!(resolutions[0].resolved_properties["realm"], json!("Gondor and Arnor"));
        assert_eq!(resolutions[0].variants["realm"].len(), 3);

        let failing = resolver(&store, config).with_aggregator(Arc::new(|_: &[String]| {
            Err::<String, _>(AggregationError::Unavailable("offline".to_string()))
        }));
        let resolutions = failing.resolve_conflicts(&groups);
        assert_eq!(resolutions[0].resolved_properties["realm"], json!("Gondor"));
    }

    struct PreferLast;

    impl ConflictJudge for PreferLast {
        fn judge(&self, _: &str, variants: &[Value], _: &ValueProvenance) -> Option<Judgement> {
            variants.last().map(|v| Judgement {
                value: v.clone(),
                confidence: 0.95,
                rationale: "reviewer".to_string(),
            })
        }
    }

    #[test]
    fn test_judge_overrides_policy() {
        let store = Arc::new(InMemoryGraphStore::new());
        aragorns(&store, &["Gondor", "Arnor"]);
        let r = resolver(&store, ConflictConfig::default()).with_judge(Arc::new(PreferLast));
        let resolutions = r.resolve_conflicts(&r.detect_conflicts(None, 10).unwrap());
        assert_eq!(resolutions[0].resolved_properties["realm"], json!("Arnor"));
        assert!(resolutions[0].rationale.contains("reviewer"));
    }
}
