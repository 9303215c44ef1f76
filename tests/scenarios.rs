use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use kgconsolidate::config::MergeMode;
use kgconsolidate::graph::RewriteOutcome;
use kgconsolidate::{
    Community, CommunityAnalyzer, CommunityConfig, ConsolidationConfig, ConsolidationError,
    Consolidator, DetectorConfig, DuplicateDetector, GraphStore, InMemoryGraphStore,
    MergeConfig, MergedValue, Node, NodeId, NodeMerger, Relationship, Stage, Strategy,
    ValidationError,
};
use serde_json::json;

fn insert(store: &InMemoryGraphStore, node: Node) -> NodeId {
    let id = node.id;
    store.insert_node(node).unwrap();
    id
}

fn detector(store: &Arc<InMemoryGraphStore>, threshold: f64) -> DuplicateDetector {
    let config = DetectorConfig {
        similarity_threshold: threshold,
        ..DetectorConfig::default()
    };
    DuplicateDetector::new(store.clone(), config).unwrap()
}

#[test]
fn scenario_a_alias_exact_match() {
    let store = Arc::new(InMemoryGraphStore::new());
    let frodo = insert(&store, Node::new("Frodo", ["Hobbit"]).with_alias("Frodo Baggins"));
    let baggins = insert(&store, Node::new("frodo baggins", ["Hobbit"]));

    let groups = detector(&store, 0.9).find_duplicates(None, 100).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].strategy, Strategy::Exact);
    assert_eq!(groups[0].confidence, 1.0);
    assert_eq!(groups[0].node_ids, vec![frodo, baggins]);
}

#[test]
fn scenario_b_conflicting_realm_is_preserved() {
    let store = Arc::new(InMemoryGraphStore::new());
    let a = insert(&store, Node::new("Aragorn", ["Man"]).with_property("realm", json!("Gondor")));
    let b = insert(&store, Node::new("Aragorn", ["Man"]).with_property("realm", json!("Arnor")));

    let merger = NodeMerger::new(store.clone(), MergeConfig::default());
    let result = merger.merge(&[a, b], None).unwrap();
    assert_eq!(
        result.merged_properties["realm"],
        MergedValue::Variants(vec![json!("Gondor"), json!("Arnor")])
    );

    let kept = store.get_node(a).unwrap().unwrap();
    let variants = &kept.conflicts["realm"];
    assert_eq!(variants, &vec![json!("Gondor"), json!("Arnor")]);
    assert!(variants.contains(&kept.properties["realm"]));
    let record = &kept.merge_history[0];
    assert_eq!(record.kept_node_id, a);
    assert_eq!(record.merged_node_ids, vec![b]);
    assert_eq!(kept.conflict_provenance["realm"][r#""Arnor""#], vec![b]);
}

#[test]
fn scenario_c_shared_glamdring_links_communities() {
    let store = Arc::new(InMemoryGraphStore::new());
    store
        .insert_community(Community::new("Gondolin", "Turgon's hall held Glamdring."))
        .unwrap();
    store
        .insert_community(Community::new("Trolls", "Three trolls hoarded glamdring and sting."))
        .unwrap();

    let analyzer = CommunityAnalyzer::new(store.clone(), CommunityConfig::default()).unwrap();
    let links = analyzer.find_inter_community_relationships(None).unwrap();
    assert_eq!(links.len(), 1);
    let terms = links[0].evidence["shared_terms"].as_array().unwrap();
    assert!(terms.contains(&json!("glamdring")));
}

#[test]
fn scenario_d_fuzzy_threshold_boundary() {
    let store = Arc::new(InMemoryGraphStore::new());
    insert(&store, Node::new("Galadriel", ["Elf"]));
    insert(&store, Node::new("Galadirel", ["Elf"]));

    let at_90 = detector(&store, 0.90).find_duplicates(None, 100).unwrap();
    assert_eq!(at_90.len(), 1);
    assert_eq!(at_90[0].strategy, Strategy::Fuzzy);

    let at_95 = detector(&store, 0.95).find_duplicates(None, 100).unwrap();
    assert!(at_95.is_empty());
}

#[test]
fn merge_rejects_fewer_than_two_ids() {
    let store = Arc::new(InMemoryGraphStore::new());
    let a = insert(&store, Node::new("Legolas", ["Elf"]));
    let merger = NodeMerger::new(store.clone(), MergeConfig::default());

    for ids in [vec![a], vec![a, a], Vec::new()] {
        let err = merger.merge(&ids, None).unwrap_err();
        assert!(matches!(
            err,
            ConsolidationError::Validation(ValidationError::TooFewNodes { .. })
        ));
    }
}

#[test]
fn merge_of_unknown_id_is_not_found_and_writes_nothing() {
    let store = Arc::new(InMemoryGraphStore::new());
    let a = insert(&store, Node::new("Legolas", ["Elf"]));
    let merger = NodeMerger::new(store.clone(), MergeConfig::default());

    let err = merger.merge(&[a, NodeId::new()], None).unwrap_err();
    assert!(err.is_not_found());
    let stored = store.get_node(a).unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert!(stored.merge_history.is_empty());
}

#[test]
fn merge_round_trip_keeps_every_value() {
    let store = Arc::new(InMemoryGraphStore::new());
    let a = insert(
        &store,
        Node::new("Boromir", ["Man"])
            .with_property("city", json!("Minas Tirith"))
            .with_property("horn", json!("Horn of Gondor")),
    );
    let b = insert(
        &store,
        Node::new("Boromir of Gondor", ["Man", "Captain"])
            .with_property("city", json!("Osgiliath"))
            .with_property("father", json!("Denethor")),
    );
    let c = insert(
        &store,
        Node::new("boromir", ["Man"]).with_property("city", json!("Minas Tirith")),
    );

    let merger = NodeMerger::new(store.clone(), MergeConfig::default());
    merger.merge(&[a, b, c], None).unwrap();
    let kept = store.get_node(a).unwrap().unwrap();

    let expected_aliases: Vec<String> = ["Boromir", "Boromir of Gondor", "boromir"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(kept.aliases, expected_aliases);
    assert_eq!(
        kept.labels,
        BTreeSet::from(["Captain".to_string(), "Man".to_string()])
    );

    assert_eq!(kept.properties["city"], json!("Minas Tirith"));
    assert_eq!(kept.conflicts["city"], vec![json!("Minas Tirith"), json!("Osgiliath")]);
    assert_eq!(kept.conflict_provenance["city"][r#""Minas Tirith""#], vec![a, c]);
    assert_eq!(kept.properties["horn"], json!("Horn of Gondor"));
    assert_eq!(kept.properties["father"], json!("Denethor"));

    for id in [b, c] {
        let merged = store.get_node(id).unwrap().unwrap();
        assert_eq!(merged.merged_into, Some(a));
    }
    assert_eq!(store.node_count().unwrap(), 1);
}

/// Endpoints of every edge touching `ids`, counted once per endpoint in `ids`.
fn endpoint_count(store: &InMemoryGraphStore, ids: &[NodeId]) -> usize {
    let mut seen = HashSet::new();
    let mut count = 0;
    for id in ids {
        for rel in store.relationships_of(*id).unwrap() {
            if seen.insert(rel.id) {
                count += usize::from(ids.contains(&rel.source)) + usize::from(ids.contains(&rel.target));
            }
        }
    }
    count
}

#[test]
fn merge_conserves_relationship_endpoints() {
    let store = Arc::new(InMemoryGraphStore::new());
    let a = insert(&store, Node::new("Gimli", ["Dwarf"]));
    let b = insert(&store, Node::new("gimli", ["Dwarf"]));
    let c = insert(&store, Node::new("GIMLI", ["Dwarf"]));
    let x = insert(&store, Node::new("Legolas", ["Elf"]));
    let y = insert(&store, Node::new("Axe", ["Artifact"]));

    store.insert_relationship(Relationship::new("FRIEND_OF", a, x)).unwrap();
    store.insert_relationship(Relationship::new("FRIEND_OF", b, x)).unwrap();
    store
        .insert_relationship(Relationship::new("WIELDS", b, y).with_property("since", json!(2941)))
        .unwrap();
    store.insert_relationship(Relationship::new("SAME_CLAN", a, b)).unwrap();
    store.insert_relationship(Relationship::new("SAME_CLAN", c, b)).unwrap();
    store.insert_relationship(Relationship::new("COUSIN_OF", b, c)).unwrap();
    let before = endpoint_count(&store, &[a, b, c]);

    let merger = NodeMerger::new(store.clone(), MergeConfig::default());
    let result = merger.merge(&[a, b, c], None).unwrap();
    assert_eq!(result.relationships_updated, 5);

    let kept = store.get_node(a).unwrap().unwrap();
    let rewrites = &kept.merge_history[0].relationship_rewrites;
    let count = |f: fn(&RewriteOutcome) -> bool| rewrites.iter().filter(|r| f(&r.outcome)).count();
    let collapsed = count(|o| matches!(o, RewriteOutcome::Collapsed { .. }));
    // b->x folds into a->x; c->b folds into the a->a loop that a->b became.
    assert_eq!(collapsed, 2);
    assert_eq!(count(|o| matches!(o, RewriteOutcome::Transferred)), 3);

    // Only the declared collapses remove endpoints.
    let collapsed_endpoints: usize = rewrites
        .iter()
        .filter(|r| matches!(r.outcome, RewriteOutcome::Collapsed { .. }))
        .map(|r| usize::from(r.original_source != x) + usize::from(r.original_target != x))
        .sum();
    assert_eq!(endpoint_count(&store, &[a]), before - collapsed_endpoints);

    let kept_rels = store.relationships_of(a).unwrap();
    assert_eq!(kept_rels.len(), 4);
    assert!(kept_rels.iter().any(|r| r.rel_type == "FRIEND_OF" && r.target == x));
    assert!(kept_rels
        .iter()
        .any(|r| r.rel_type == "WIELDS" && r.source == a && r.properties["since"] == json!(2941)));
    assert!(kept_rels
        .iter()
        .any(|r| r.rel_type == "COUSIN_OF" && r.source == a && r.target == a));
    assert!(store.relationships_of(b).unwrap().is_empty());
    assert!(store.relationships_of(c).unwrap().is_empty());
}

#[test]
fn concurrent_merges_sharing_an_edge_leave_it_between_kept_nodes() {
    for _ in 0..25 {
        let store = Arc::new(InMemoryGraphStore::new());
        let frodo = insert(&store, Node::new("Frodo", ["Hobbit"]));
        let frodo_dup = insert(&store, Node::new("frodo", ["Hobbit"]));
        let sting = insert(&store, Node::new("Sting", ["Artifact"]));
        let sting_dup = insert(&store, Node::new("sting", ["Artifact"]));
        let edge = Relationship::new("CARRIES", frodo_dup, sting_dup);
        let edge_id = edge.id;
        store.insert_relationship(edge).unwrap();

        let merger = NodeMerger::new(store.clone(), MergeConfig::default());
        std::thread::scope(|scope| {
            scope.spawn(|| merger.merge(&[frodo, frodo_dup], None).unwrap());
            scope.spawn(|| merger.merge(&[sting, sting_dup], None).unwrap());
        });

        let rel = store.get_relationship(edge_id).unwrap().unwrap();
        assert_eq!((rel.source, rel.target), (frodo, sting));
        assert!(store.relationships_of(frodo_dup).unwrap().is_empty());
        assert!(store.relationships_of(sting_dup).unwrap().is_empty());
    }
}

#[test]
fn delete_mode_removes_merged_nodes() {
    let store = Arc::new(InMemoryGraphStore::new());
    let a = insert(&store, Node::new("Gimli", ["Dwarf"]));
    let b = insert(&store, Node::new("gimli", ["Dwarf"]));
    let x = insert(&store, Node::new("Legolas", ["Elf"]));
    store.insert_relationship(Relationship::new("FRIEND_OF", b, x)).unwrap();

    let config = MergeConfig {
        mode: MergeMode::Delete,
        ..MergeConfig::default()
    };
    let merger = NodeMerger::new(store.clone(), config);
    merger.merge(&[a, b], None).unwrap();
    assert!(store.get_node(b).unwrap().is_none());

    let again = merger.merge(&[a, b], None).unwrap();
    assert!(again.already_applied);
    assert_eq!(store.get_node(a).unwrap().unwrap().merge_history.len(), 1);
}

#[test]
fn community_analysis_never_changes_membership() {
    let store = Arc::new(InMemoryGraphStore::new());
    let gandalf = insert(&store, Node::new("Gandalf", ["Wizard"]));
    let bilbo = insert(&store, Node::new("Bilbo", ["Hobbit"]));
    store
        .insert_community(
            Community::new("Shire", "Gandalf visits Bilbo with fireworks.").with_member(bilbo),
        )
        .unwrap();
    store
        .insert_community(
            Community::new("Istari", "Gandalf and the fireworks of the order.").with_member(gandalf),
        )
        .unwrap();
    let before: Vec<_> = store
        .communities()
        .unwrap()
        .into_iter()
        .map(|c| (c.id, c.members))
        .collect();

    let report = Consolidator::new(store.clone(), ConsolidationConfig::default())
        .unwrap()
        .run_consolidation(100)
        .unwrap();
    assert!(report.counter("bridge_entities") >= 1);
    assert_eq!(report.counter("community_links_written"), 1);

    let after: Vec<_> = store
        .communities()
        .unwrap()
        .into_iter()
        .map(|c| (c.id, c.members))
        .collect();
    assert_eq!(before, after);
    assert_eq!(store.community_links().unwrap().len(), 1);
}

#[test]
fn full_pipeline_is_idempotent() {
    let store = Arc::new(InMemoryGraphStore::new());
    insert(&store, Node::new("Aragorn", ["Man"]).with_property("realm", json!("Gondor")));
    insert(&store, Node::new("Strider", ["Man"]).with_alias("Aragorn").with_property("realm", json!("Arnor")));
    insert(&store, Node::new("Samwise", ["Hobbit"]));
    insert(&store, Node::new("Samwyse", ["Hobbit"]));
    store
        .insert_community(Community::new("Fellowship", "Aragorn guides the fellowship south."))
        .unwrap();
    store
        .insert_community(Community::new("Dunedain", "Aragorn leads the rangers of the fellowship."))
        .unwrap();

    let mut config = ConsolidationConfig::default();
    config.relationships.auto_apply = true;
    let consolidator = Consolidator::new(store.clone(), config).unwrap();

    let first = consolidator.run_consolidation(2).unwrap();
    assert!(first.failures.is_empty());
    assert_eq!(first.stage(Stage::Merge).succeeded, 1);
    assert_eq!(first.counter("relationships_created"), 1);
    assert_eq!(first.counter("summary_conflicts"), 1);
    let relationships = store.relationship_count().unwrap();
    let links = store.community_links().unwrap().len();

    let second = consolidator.run_consolidation(2).unwrap();
    assert!(second.failures.is_empty());
    assert_eq!(second.counter("duplicate_groups"), 0);
    assert_eq!(second.counter("relationships_created"), 0);
    assert_eq!(second.stage(Stage::Summaries).succeeded, 0);
    assert_eq!(store.relationship_count().unwrap(), relationships);
    assert_eq!(store.community_links().unwrap().len(), links);
}
