//! Embedding strategy: lexical-embedding cosine within one label set.

use std::collections::{BTreeMap, HashMap};

use serde_json::json;

use crate::config::{DetectorConfig, Strategy};
use crate::embedding::{cosine_similarity, name_embedding};

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
    let vectors: HashMap<usize, Vec<f32>> = members
        .iter()
        .map(|&i| {
            let keys = &pool.candidate(i).keys;
            (i, name_embedding(keys.iter().map(String::as_str)))
        })
        .collect();

    let clusters = greedy_clusters(pool, members, |anchor, other| {
        let cosine = cosine_similarity(&vectors[&anchor], &vectors[&other]);
        (cosine >= config.embedding_threshold).then(|| {
            (
                cosine,
                json!({ "node_id": pool.id(other), "cosine": cosine }),
            )
        })
    });

    clusters
        .into_iter()
        .map(|cluster| {
            let confidence = cluster
                .scores
                .iter()
                .copied()
                .fold(1.0f64, f64::min)
                .clamp(0.0, 1.0);
            let mut evidence = BTreeMap::new();
            evidence.insert("anchor".to_string(), json!(pool.id(cluster.members[0])));
            evidence.insert("matches".to_string(), json!(cluster.links));
            evidence.insert("threshold".to_string(), json!(config.embedding_threshold));
            DuplicateGroup {
                node_ids: pool.ids(&cluster.members),
                confidence,
                strategy: Strategy::Embedding,
                evidence,
            }
        })
        .collect()
}
