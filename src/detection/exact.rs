//! Exact strategy: shared normalized name or alias.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};

use crate::config::Strategy;

use super::pool::{claim_shared_keys, CandidatePool};
use super::DuplicateGroup;

pub(super) fn detect(pool: &CandidatePool) -> Vec<DuplicateGroup> {
    let entries = pool
        .unclaimed()
        .map(|idx| (idx, pool.candidate(idx).keys.as_slice()));

    claim_shared_keys(entries, |members| pool.group_in_scope(members))
        .into_iter()
        .map(|(key, members)| {
            let matched = shared_keys(pool, &members);
            debug_assert!(matched.contains(&key));

            let mut evidence = BTreeMap::new();
            evidence.insert("matched_names".to_string(), json!(matched));
            evidence.insert("key".to_string(), Value::String(key));
            DuplicateGroup {
                node_ids: pool.ids(&members),
                confidence: 1.0,
                strategy: Strategy::Exact,
                evidence,
            }
        })
        .collect()
}

/// Keys common to every member.
fn shared_keys(pool: &CandidatePool, members: &[usize]) -> BTreeSet<String> {
    let mut iter = members.iter();
    let Some(&first) = iter.next() else {
        return BTreeSet::new();
    };
    let mut shared: BTreeSet<String> = pool.candidate(first).keys.iter().cloned().collect();
    for &idx in iter {
        let keys = &pool.candidate(idx).keys;
        shared.retain(|k| keys.contains(k));
    }
    shared
}
