//! Contextual strategy: shared relationship neighbourhood plus loose name
//! similarity, within one label set.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::json;

use crate::config::{DetectorConfig, Strategy};
use crate::graph::NodeId;
use crate::similarity::best_name_match;
use crate::storage::{GraphStore, StorageError};

use super::pool::{greedy_clusters, run_partitions, CandidatePool};
use super::DuplicateGroup;

const CONTEXTUAL_CONFIDENCE: f64 = 0.6;

pub(super) fn detect(
    pool: &CandidatePool,
    config: &DetectorConfig,
    store: &dyn GraphStore,
) -> Result<Vec<DuplicateGroup>, StorageError> {
    let partitions = pool.label_partitions();

    // Adjacency is read up front so that partition workers never touch the store.
    let mut neighbours: HashMap<usize, BTreeSet<NodeId>> = HashMap::new();
    for &idx in partitions.iter().flatten() {
        let id = pool.id(idx);
        let set = store
            .relationships_of(id)?
            .iter()
            .filter_map(|rel| rel.other_end(id))
            .filter(|other| *other != id)
            .collect();
        neighbours.insert(idx, set);
    }

    Ok(run_partitions(&partitions, config.parallelism, |members| {
        detect_partition(pool, members, config, &neighbours)
    })
    .into_iter()
    .flatten()
    .collect())
}

fn detect_partition(
    pool: &CandidatePool,
    members: &[usize],
    config: &DetectorConfig,
    neighbours: &HashMap<usize, BTreeSet<NodeId>>,
) -> Vec<DuplicateGroup> {
    let clusters = greedy_clusters(pool, members, |anchor, other| {
        let (a, b) = (neighbours.get(&anchor)?, neighbours.get(&other)?);
        let (anchor_id, other_id) = (pool.id(anchor), pool.id(other));
        let shared: Vec<NodeId> = a
            .intersection(b)
            .copied()
            .filter(|n| *n != anchor_id && *n != other_id)
            .collect();
        if shared.len() < config.contextual_min_shared_neighbors {
            return None;
        }
        let m = best_name_match(
            &pool.candidate(anchor).keys,
            &pool.candidate(other).keys,
            config.method,
        )?;
        (m.score >= config.contextual_name_threshold).then(|| {
            let link = json!({
                "node_id": other_id,
                "shared_neighbors": shared,
                "name_score": m.score,
            });
            (m.score, link)
        })
    });

    clusters
        .into_iter()
        .map(|cluster| {
            let mut evidence = BTreeMap::new();
            evidence.insert("anchor".to_string(), json!(pool.id(cluster.members[0])));
            evidence.insert("matches".to_string(), json!(cluster.links));
            DuplicateGroup {
                node_ids: pool.ids(&cluster.members),
                confidence: CONTEXTUAL_CONFIDENCE,
                strategy: Strategy::Contextual,
                evidence,
            }
        })
        .collect()
}
