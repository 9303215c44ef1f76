//! Community-level analysis.
//!
//! Works on whole clusters rather than individual entities: finds entities
//! referenced from several community summaries and proposes soft
//! `ASSOCIATED_WITH` links between communities that share vocabulary.
//!
//! Nothing here writes a [`Community`] record, so membership is never
//! altered.

mod terms;
mod validator;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::CommunityConfig;
use crate::conflict::ApplyOutcome;
use crate::error::{
    ConfigError, ConsolidationError, ConsolidationResult, UnitFailure, ValidationError,
};
use crate::graph::{
    push_unique, Community, CommunityId, CommunityLink, CommunityLinkId, NodeId, ASSOCIATED_WITH,
};
use crate::similarity::mention_pattern;
use crate::storage::{CommunityLockTable, GraphStore, GraphTransaction, NodeLockTable};

pub use terms::{is_stopword, jaccard, vocabulary};
pub use validator::{AcceptAll, LinkValidator, MinConfidence};

/// Fixed confidence of bridge entities.
const BRIDGE_CONFIDENCE: f64 = 0.7;

/// An entity whose aliases appear in more than one community summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeEntity {
    /// The entity.
    pub node_id: NodeId,
    /// Every community whose summary mentions it, in store order.
    pub communities: Vec<CommunityId>,
    /// Heuristic confidence.
    pub confidence: f64,
    /// `matched`: community id -> alias found in its summary.
    pub evidence: BTreeMap<String, Value>,
}

/// A proposed soft link between two communities. Endpoints are canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkProposal {
    /// Lower endpoint.
    pub community_a: CommunityId,
    /// Upper endpoint.
    pub community_b: CommunityId,
    /// Heuristic confidence.
    pub confidence: f64,
    /// `shared_terms`: sorted shared vocabulary.
    pub evidence: BTreeMap<String, Value>,
}

/// A proposal accepted by a [`LinkValidator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedLink {
    /// The accepted proposal.
    pub proposal: LinkProposal,
    /// Validator name.
    pub validated_by: String,
}

/// Finds bridge entities and soft links between communities.
pub struct CommunityAnalyzer {
    store: Arc<dyn GraphStore>,
    locks: Arc<NodeLockTable>,
    link_locks: Arc<CommunityLockTable>,
    config: CommunityConfig,
    validator: Arc<dyn LinkValidator>,
}

impl std::fmt::Debug for CommunityAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunityAnalyzer")
            .field("config", &self.config)
            .field("validator", &self.validator.name())
            .finish_non_exhaustive()
    }
}

impl CommunityAnalyzer {
    /// Creates an analyzer with the [`AcceptAll`] validator.
    pub fn new(store: Arc<dyn GraphStore>, config: CommunityConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            locks: Arc::new(NodeLockTable::new()),
            link_locks: Arc::new(CommunityLockTable::new()),
            config,
            validator: Arc::new(AcceptAll),
        })
    }

    /// Shares a lock table with other writers.
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<NodeLockTable>) -> Self {
        self.locks = locks;
        self
    }

    /// Shares the community lock table guarding soft-link upserts.
    #[must_use]
    pub fn with_link_locks(mut self, link_locks: Arc<CommunityLockTable>) -> Self {
        self.link_locks = link_locks;
        self
    }

    /// Replaces the link validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn LinkValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &CommunityConfig {
        &self.config
    }

    /// Entities whose aliases appear as whole words in two or more summaries.
    ///
    /// With a `scope`, only bridges touching a scoped community are returned;
    /// their `communities` still list every match.
    pub fn identify_bridge_entities(
        &self,
        scope: Option<&[CommunityId]>,
        batch_size: usize,
    ) -> ConsolidationResult<Vec<BridgeEntity>> {
        if batch_size == 0 {
            return Err(ConfigError::NonPositive { name: "batch_size" }.into());
        }
        let communities = self.store.communities()?;
        if communities.len() < 2 {
            return Ok(Vec::new());
        }
        let scope: Option<HashSet<CommunityId>> = scope.map(|s| s.iter().copied().collect());

        let mut bridges = Vec::new();
        for node in self.store.scan_all_nodes(batch_size)? {
            let patterns: Vec<_> = node
                .names()
                .filter(|n| n.trim().chars().count() >= self.config.min_alias_len)
                .filter_map(|n| mention_pattern(n).map(|re| (n.to_string(), re)))
                .collect();
            if patterns.is_empty() {
                continue;
            }

            let mut matched = BTreeMap::new();
            let mut hits = Vec::new();
            for community in &communities {
                let found = patterns.iter().find(|(_, re)| re.is_match(&community.summary));
                if let Some((alias, _)) = found {
                    hits.push(community.id);
                    matched.insert(community.id.to_string(), json!(alias));
                }
            }
            if hits.len() < 2 {
                continue;
            }
            if let Some(scope) = &scope {
                if !hits.iter().any(|id| scope.contains(id)) {
                    continue;
                }
            }

            let mut evidence = BTreeMap::new();
            evidence.insert("matched".to_string(), json!(matched));
            bridges.push(BridgeEntity {
                node_id: node.id,
                communities: hits,
                confidence: BRIDGE_CONFIDENCE,
                evidence,
            });
        }

        info!(bridges = bridges.len(), "bridge detection finished");
        Ok(bridges)
    }

    /// Persists `is_bridge` and grow-only `bridge_communities` on each entity.
    pub fn annotate_bridge_entities(&self, bridges: &[BridgeEntity]) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        for bridge in bridges {
            match self.annotate_one(bridge) {
                Ok(true) => outcome.applied += 1,
                Ok(false) => outcome.unchanged += 1,
                Err(err) => {
                    warn!(node = %bridge.node_id, error = %err, "failed to annotate bridge entity");
                    outcome
                        .failed
                        .push(UnitFailure::new("bridges", bridge.node_id.to_string(), &err));
                }
            }
        }
        outcome
    }

    fn annotate_one(&self, bridge: &BridgeEntity) -> ConsolidationResult<bool> {
        let id = bridge.node_id;
        let _guard = self.locks.acquire([id])?;
        let node = self
            .store
            .get_node(id)?
            .ok_or_else(|| ConsolidationError::node_not_found(id))?;
        if let Some(into) = node.merged_into {
            return Err(ValidationError::AlreadyMerged { id, into }.into());
        }

        let mut updated = node.clone();
        updated.is_bridge = true;
        for community in &bridge.communities {
            push_unique(&mut updated.bridge_communities, *community);
        }
        if updated.is_bridge == node.is_bridge
            && updated.bridge_communities == node.bridge_communities
        {
            return Ok(false);
        }

        updated.touch();
        let mut tx = GraphTransaction::new("annotate_bridge");
        tx.put_node(updated);
        self.store.commit(tx)?;
        Ok(true)
    }

    /// Pairs of communities whose summaries share vocabulary.
    ///
    /// Confidence is `link_base_confidence + link_term_increment × shared`,
    /// capped at `link_max_confidence`. With a `scope`, every proposal has a
    /// scoped endpoint.
    pub fn find_inter_community_relationships(
        &self,
        scope: Option<&[CommunityId]>,
    ) -> ConsolidationResult<Vec<LinkProposal>> {
        let communities = self.store.communities()?;
        let scope: Option<HashSet<CommunityId>> = scope.map(|s| s.iter().copied().collect());
        let vocab: Vec<BTreeSet<String>> = communities
            .iter()
            .map(|c| vocabulary(&c.summary, self.config.min_term_len, &self.config.stopwords))
            .collect();

        let mut proposals = Vec::new();
        for i in 0..communities.len() {
            for j in (i + 1)..communities.len() {
                let (a, b) = (&communities[i], &communities[j]);
                if let Some(scope) = &scope {
                    if !scope.contains(&a.id) && !scope.contains(&b.id) {
                        continue;
                    }
                }
                let shared: Vec<&String> = vocab[i].intersection(&vocab[j]).collect();
                if shared.len() < self.config.min_shared_terms {
                    continue;
                }
                proposals.push(self.proposal(a, b, &shared));
            }
        }

        info!(proposals = proposals.len(), "inter-community link search finished");
        Ok(proposals)
    }

    fn proposal(&self, a: &Community, b: &Community, shared: &[&String]) -> LinkProposal {
        let (community_a, community_b) = CommunityLink::canonical_pair(a.id, b.id);
        let confidence = (self.config.link_base_confidence
            + self.config.link_term_increment * shared.len() as f64)
            .min(self.config.link_max_confidence);
        let mut evidence = BTreeMap::new();
        evidence.insert("shared_terms".to_string(), json!(shared));
        LinkProposal {
            community_a,
            community_b,
            confidence,
            evidence,
        }
    }

    /// Proposals the configured validator accepts.
    #[must_use]
    pub fn validate_community_link_proposals(
        &self,
        proposals: &[LinkProposal],
    ) -> Vec<ValidatedLink> {
        let validated: Vec<ValidatedLink> = proposals
            .iter()
            .filter(|p| self.validator.accepts(p))
            .map(|p| ValidatedLink {
                proposal: p.clone(),
                validated_by: self.validator.name().to_string(),
            })
            .collect();
        debug!(
            proposed = proposals.len(),
            accepted = validated.len(),
            validator = self.validator.name(),
            "link proposals validated"
        );
        validated
    }

    /// Writes validated links as soft edges between community records.
    ///
    /// An existing link between the same pair is updated in place: evidence
    /// arrays only grow and confidence only rises.
    pub fn create_soft_community_links(&self, links: &[ValidatedLink]) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        for link in links {
            match self.write_link(link) {
                Ok(true) => outcome.applied += 1,
                Ok(false) => outcome.unchanged += 1,
                Err(err) => {
                    let unit = format!("{}-{}", link.proposal.community_a, link.proposal.community_b);
                    warn!(link = %unit, error = %err, "failed to create community link");
                    outcome.failed.push(UnitFailure::new("community_links", unit, &err));
                }
            }
        }
        info!(created = outcome.applied, unchanged = outcome.unchanged, "soft community links written");
        outcome
    }

    fn write_link(&self, link: &ValidatedLink) -> ConsolidationResult<bool> {
        let p = &link.proposal;
        // The upsert reads the pair's link and writes it back.
        let _guard = self.link_locks.acquire([p.community_a, p.community_b])?;
        for id in [p.community_a, p.community_b] {
            if self.store.get_community(id)?.is_none() {
                return Err(ConsolidationError::NotFound {
                    kind: "community",
                    id: id.to_string(),
                });
            }
        }

        let existing = self
            .store
            .community_links()?
            .into_iter()
            .find(|l| l.joins(p.community_a, p.community_b));
        let now = Utc::now();
        let record = match existing {
            Some(mut current) => {
                let mut changed = grow_evidence(&mut current.evidence, &p.evidence);
                if p.confidence > current.confidence {
                    current.confidence = p.confidence;
                    changed = true;
                }
                if !changed {
                    return Ok(false);
                }
                current.updated_at = now;
                current
            }
            None => {
                let (community_a, community_b) =
                    CommunityLink::canonical_pair(p.community_a, p.community_b);
                CommunityLink {
                    id: CommunityLinkId::new(),
                    community_a,
                    community_b,
                    link_type: ASSOCIATED_WITH.to_string(),
                    confidence: p.confidence,
                    evidence: p.evidence.clone(),
                    validated_by: link.validated_by.clone(),
                    created_at: now,
                    updated_at: now,
                }
            }
        };

        let mut tx = GraphTransaction::new("soft_community_link");
        tx.put_community_link(record);
        self.store.commit(tx)?;
        Ok(true)
    }
}

/// Unions arrays and adds missing keys. Existing scalars are kept.
fn grow_evidence(into: &mut BTreeMap<String, Value>, from: &BTreeMap<String, Value>) -> bool {
    let mut changed = false;
    for (key, value) in from {
        match (into.get_mut(key), value) {
            (None, _) => {
                into.insert(key.clone(), value.clone());
                changed = true;
            }
            (Some(Value::Array(current)), Value::Array(incoming)) => {
                for item in incoming {
                    if !current.contains(item) {
                        current.push(item.clone());
                        changed = true;
                    }
                }
            }
            (Some(_), _) => {}
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::storage::InMemoryGraphStore;

    fn community(store: &InMemoryGraphStore, name: &str, summary: &str) -> CommunityId {
        let c = Community::new(name, summary);
        let id = c.id;
        store.insert_community(c).unwrap();
        id
    }

    fn analyzer(store: &Arc<InMemoryGraphStore>) -> CommunityAnalyzer {
        CommunityAnalyzer::new(store.clone(), CommunityConfig::default()).unwrap()
    }

    #[test]
    fn test_bridge_needs_two_whole_word_mentions() {
        let store = Arc::new(InMemoryGraphStore::new());
        let rivendell = community(&store, "Rivendell", "Elrond hosts the council; Gandalf arrives.");
        let shire = community(&store, "Shire", "Gandalf visits Bilbo for his party.");
        community(&store, "Mordor", "Elrondish is not a word.");
        let gandalf = Node::new("Gandalf", ["Wizard"]);
        let g = gandalf.id;
        store.insert_node(gandalf).unwrap();
        store.insert_node(Node::new("Elrond", ["Elf"])).unwrap();

        let bridges = analyzer(&store).identify_bridge_entities(None, 10).unwrap();
        assert_eq!(bridges.len(), 1);
        assert_eq!(bridges[0].node_id, g);
        assert_eq!(bridges[0].communities, vec![rivendell, shire]);
        assert_eq!(bridges[0].evidence["matched"][shire.to_string()], json!("Gandalf"));
    }

    #[test]
    fn test_short_aliases_ignored() {
        let store = Arc::new(InMemoryGraphStore::new());
        community(&store, "A", "Ox and more.");
        community(&store, "B", "An ox again.");
        store.insert_node(Node::new("Ox", ["Animal"])).unwrap();
        assert!(analyzer(&store).identify_bridge_entities(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_annotation_grows_only() {
        let store = Arc::new(InMemoryGraphStore::new());
        let a = community(&store, "A", "Gandalf rides.");
        let b = community(&store, "B", "Gandalf speaks.");
        let node = Node::new("Gandalf", ["Wizard"]);
        let id = node.id;
        store.insert_node(node).unwrap();
        let an = analyzer(&store);

        let bridges = an.identify_bridge_entities(None, 10).unwrap();
        assert_eq!(an.annotate_bridge_entities(&bridges).applied, 1);
        assert_eq!(an.annotate_bridge_entities(&bridges).unchanged, 1);
        let stored = store.get_node(id).unwrap().unwrap();
        assert!(stored.is_bridge);
        assert_eq!(stored.bridge_communities, vec![a, b]);
    }

    #[test]
    fn test_shared_glamdring_links_communities() {
        let store = Arc::new(InMemoryGraphStore::new());
        let a = community(&store, "Gondolin", "The sword GLAMDRING was forged here.");
        let b = community(&store, "Erebor", "Thorin found glamdring in a troll hoard.");
        community(&store, "Bree", "An inn with ale.");

        let an = analyzer(&store);
        let links = an.find_inter_community_relationships(None).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(
            (links[0].community_a, links[0].community_b),
            CommunityLink::canonical_pair(a, b)
        );
        assert_eq!(links[0].evidence["shared_terms"], json!(["glamdring"]));
        assert!((links[0].confidence - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_is_capped() {
        let store = Arc::new(InMemoryGraphStore::new());
        let text = "alpha bravo charlie delta echo foxtrot golf hotel india juliet kilo lima";
        community(&store, "A", text);
        community(&store, "B", text);
        let links = analyzer(&store).find_inter_community_relationships(None).unwrap();
        assert_eq!(links[0].confidence, 0.95);
    }

    #[test]
    fn test_validators() {
        let store = Arc::new(InMemoryGraphStore::new());
        community(&store, "A", "glamdring orcrist");
        community(&store, "B", "glamdring");
        let an = analyzer(&store);
        let proposals = an.find_inter_community_relationships(None).unwrap();

        let accepted = an.validate_community_link_proposals(&proposals);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].validated_by, "accept_all");

        let strict = analyzer(&store).with_validator(Arc::new(MinConfidence(0.9)));
        assert!(strict.validate_community_link_proposals(&proposals).is_empty());
    }

    #[test]
    fn test_soft_links_upsert_and_keep_membership() {
        let store = Arc::new(InMemoryGraphStore::new());
        let member = NodeId::new();
        let a = Community::new("A", "glamdring").with_member(member);
        let (a_id, a_members) = (a.id, a.members.clone());
        store.insert_community(a).unwrap();
        let b = community(&store, "B", "glamdring");
        let an = analyzer(&store);

        let validated = an.validate_community_link_proposals(
            &an.find_inter_community_relationships(None).unwrap(),
        );
        assert_eq!(an.create_soft_community_links(&validated).applied, 1);
        assert_eq!(an.create_soft_community_links(&validated).unchanged, 1);

        let mut richer = validated[0].clone();
        richer.proposal.evidence.insert("shared_terms".to_string(), json!(["orcrist"]));
        assert_eq!(an.create_soft_community_links(&[richer]).applied, 1);

        let links = store.community_links().unwrap();
        assert_eq!(links.len(), 1);
        assert!(links[0].joins(a_id, b));
        assert_eq!(links[0].link_type, ASSOCIATED_WITH);
        assert_eq!(links[0].evidence["shared_terms"], json!(["glamdring", "orcrist"]));
        assert_eq!(store.get_community(a_id).unwrap().unwrap().members, a_members);
    }

    #[test]
    fn test_link_to_missing_community_fails() {
        let store = Arc::new(InMemoryGraphStore::new());
        let a = community(&store, "A", "glamdring");
        let link = ValidatedLink {
            proposal: LinkProposal {
                community_a: a,
                community_b: CommunityId::new(),
                confidence: 0.6,
                evidence: BTreeMap::new(),
            },
            validated_by: "accept_all".to_string(),
        };
        let outcome = analyzer(&store).create_soft_community_links(&[link]);
        assert_eq!(outcome.failed.len(), 1);
        assert!(!outcome.failed[0].retryable);
    }

    #[test]
    fn test_concurrent_upserts_keep_every_evidence_term() {
        let store = Arc::new(InMemoryGraphStore::new());
        let a = community(&store, "Rivendell", "glamdring");
        let b = community(&store, "Erebor", "orcrist");
        let analyzer = analyzer(&store);

        let outcomes: Vec<ApplyOutcome> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8u32)
                .map(|i| {
                    let analyzer = &analyzer;
                    scope.spawn(move || {
                        let (community_a, community_b) = if i % 2 == 0 { (a, b) } else { (b, a) };
                        let link = ValidatedLink {
                            proposal: LinkProposal {
                                community_a,
                                community_b,
                                confidence: 0.5 + f64::from(i) * 0.01,
                                evidence: BTreeMap::from([(
                                    "shared_terms".to_string(),
                                    json!([format!("term{i}")]),
                                )]),
                            },
                            validated_by: "accept_all".to_string(),
                        };
                        analyzer.create_soft_community_links(&[link])
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert!(outcomes.iter().all(|o| o.failed.is_empty() && o.applied == 1));
        let links = store.community_links().unwrap();
        assert_eq!(links.len(), 1);
        let terms = links[0].evidence["shared_terms"].as_array().unwrap();
        assert_eq!(terms.len(), 8);
        assert!((links[0].confidence - 0.57).abs() < 1e-9);
    }
}
