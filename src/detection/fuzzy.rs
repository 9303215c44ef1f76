//! Fuzzy strategy: alias edit-similarity within one label set.

use std::collections::BTreeMap;

use serde_json::json;

use crate::config::{DetectorConfig, Strategy};
use crate::similarity::{best_name_match, node_similarity};

use super::pool::{greedy_clusters, run_partitions, CandidatePool};
use super::DuplicateGroup;

pub(super) fn detect(pool: &CandidatePool, config: &DetectorConfig) -> Vec<DuplicateGroup> {
    let partitions = pool.label_partitions();
    run_partitions(&partitions, config.parallelism, |members| {
        detect_partition(pool, members, config)
    })
    .into_iter()
    .flatten()
    .collect()
}

fn detect_partition(
    pool: &CandidatePool,
    members: &[usize],
    config: &DetectorConfig,
) -> Vec<DuplicateGroup> {
    let clusters = greedy_clusters(pool, members, |anchor, other| {
        let m = best_name_match(
            &pool.candidate(anchor).keys,
            &pool.candidate(other).keys,
            config.method,
        )?;
        (m.score >= config.similarity_threshold).then(|| {
            let link = json!({
                "node_id": pool.id(other),
                "left": m.left,
                "right": m.right,
                "score": m.score,
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
            evidence.insert("method".to_string(), json!(config.method));
            evidence.insert("threshold".to_string(), json!(config.similarity_threshold));

            if !config.property_weights.is_empty() {
                let anchor = &pool.candidate(cluster.members[0]).node;
                let others = &cluster.members[1..];
                let total: f64 = others
                    .iter()
                    .map(|&i| node_similarity(anchor, &pool.candidate(i).node, &config.property_weights))
                    .sum();
                #[allow(clippy::cast_precision_loss)]
                let mean = total / others.len() as f64;
                evidence.insert("property_similarity".to_string(), json!(mean));
            }

            DuplicateGroup {
                node_ids: pool.ids(&cluster.members),
                confidence: config.fuzzy_confidence,
                strategy: Strategy::Fuzzy,
                evidence,
            }
        })
        .collect()
}
