//! Candidate pool shared by the detection strategies.
//!
//! Strategies address candidates by index into the pool. Nodes claimed by an
//! earlier strategy are invisible to later ones.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::thread;

use crossbeam_channel::{bounded, unbounded};
use serde_json::Value;

use crate::graph::{Node, NodeId};
use crate::similarity::normalized_names;

use super::DuplicateGroup;

/// A nameable node plus its normalized name keys.
#[derive(Debug)]
pub(crate) struct Candidate {
    pub node: Node,
    pub keys: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct CandidatePool {
    candidates: Vec<Candidate>,
    claimed: HashSet<NodeId>,
    scope: Option<HashSet<NodeId>>,
}

impl CandidatePool {
    /// Builds the pool, dropping nodes without any usable name.
    pub fn new(nodes: Vec<Node>, scope: Option<&[NodeId]>) -> Self {
        let candidates = nodes
            .into_iter()
            .filter_map(|node| {
                let keys = normalized_names(&node);
                (!keys.is_empty()).then_some(Candidate { node, keys })
            })
            .collect();
        Self {
            candidates,
            claimed: HashSet::new(),
            scope: scope.map(|ids| ids.iter().copied().collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn candidate(&self, idx: usize) -> &Candidate {
        &self.candidates[idx]
    }

    pub fn id(&self, idx: usize) -> NodeId {
        self.candidates[idx].node.id
    }

    pub fn ids(&self, members: &[usize]) -> Vec<NodeId> {
        members.iter().map(|&i| self.id(i)).collect()
    }

    pub fn has_scope(&self) -> bool {
        self.scope.is_some()
    }

    pub fn in_scope(&self, idx: usize) -> bool {
        self.scope
            .as_ref()
            .map_or(true, |scope| scope.contains(&self.id(idx)))
    }

    /// A group is reportable when it holds at least one scoped node.
    pub fn group_in_scope(&self, members: &[usize]) -> bool {
        members.iter().any(|&i| self.in_scope(i))
    }

    pub fn unclaimed(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.candidates.len()).filter(|&i| !self.claimed.contains(&self.id(i)))
    }

    pub fn claim(&mut self, group: &DuplicateGroup) {
        self.claimed.extend(group.node_ids.iter().copied());
    }

    /// Unclaimed candidates partitioned by exact label set, in label order.
    ///
    /// Partitions that cannot yield a group (fewer than two members, or no
    /// scoped member) are dropped.
    pub fn label_partitions(&self) -> Vec<Vec<usize>> {
        let mut partitions: BTreeMap<&BTreeSet<String>, Vec<usize>> = BTreeMap::new();
        for idx in self.unclaimed() {
            partitions
                .entry(&self.candidates[idx].node.labels)
                .or_default()
                .push(idx);
        }
        partitions
            .into_values()
            .filter(|members| members.len() >= 2 && self.group_in_scope(members))
            .collect()
    }
}

/// One greedily grown group: the anchor first, then every member that
/// matched it, each with its pair evidence.
#[derive(Debug)]
pub(crate) struct Cluster {
    pub members: Vec<usize>,
    pub scores: Vec<f64>,
    pub links: Vec<Value>,
}

/// Anchor-based greedy clustering of one partition.
///
/// Each unassigned member in turn becomes an anchor and absorbs every later
/// unassigned member for which `pair(anchor, other)` matches. Pairs where
/// neither side is scoped are not compared.
pub(crate) fn greedy_clusters<F>(pool: &CandidatePool, members: &[usize], pair: F) -> Vec<Cluster>
where
    F: Fn(usize, usize) -> Option<(f64, Value)>,
{
    let mut taken = vec![false; members.len()];
    let mut out = Vec::new();

    for (a, &anchor) in members.iter().enumerate() {
        if taken[a] {
            continue;
        }
        let mut matched = Vec::new();
        let mut cluster = Cluster {
            members: vec![anchor],
            scores: Vec::new(),
            links: Vec::new(),
        };
        for (b, &other) in members.iter().enumerate().skip(a + 1) {
            if taken[b] {
                continue;
            }
            if pool.has_scope() && !pool.in_scope(anchor) && !pool.in_scope(other) {
                continue;
            }
            if let Some((score, link)) = pair(anchor, other) {
                matched.push(b);
                cluster.members.push(other);
                cluster.scores.push(score);
                cluster.links.push(link);
            }
        }
        if cluster.members.len() >= 2 && pool.group_in_scope(&cluster.members) {
            taken[a] = true;
            for b in matched {
                taken[b] = true;
            }
            out.push(cluster);
        }
    }
    out
}

/// Exact-key bucketing.
///
/// Every index is filed under each of its keys; buckets are then claimed
/// largest first (ties by key), each keeping only members not claimed by an
/// earlier bucket. Every returned bucket shares its key, and no index appears
/// in two buckets. `accept` may veto a bucket, which leaves its members free.
pub(crate) fn claim_shared_keys<'a, I, A>(entries: I, mut accept: A) -> Vec<(String, Vec<usize>)>
where
    I: IntoIterator<Item = (usize, &'a [String])>,
    A: FnMut(&[usize]) -> bool,
{
    let mut buckets: BTreeMap<&'a str, Vec<usize>> = BTreeMap::new();
    for (idx, keys) in entries {
        for key in keys {
            let bucket = buckets.entry(key.as_str()).or_default();
            if !bucket.contains(&idx) {
                bucket.push(idx);
            }
        }
    }

    let mut ordered: Vec<(&str, Vec<usize>)> =
        buckets.into_iter().filter(|(_, v)| v.len() >= 2).collect();
    ordered.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    let mut claimed: HashSet<usize> = HashSet::new();
    let mut out = Vec::new();
    for (key, members) in ordered {
        let free: Vec<usize> = members.into_iter().filter(|i| !claimed.contains(i)).collect();
        if free.len() >= 2 && accept(&free) {
            claimed.extend(free.iter().copied());
            out.push((key.to_string(), free));
        }
    }
    out
}

/// Runs `work` over every partition, on up to `parallelism` worker threads.
///
/// Results come back in partition order regardless of completion order.
pub(crate) fn run_partitions<T, F>(partitions: &[Vec<usize>], parallelism: usize, work: F) -> Vec<T>
where
    T: Send,
    F: Fn(&[usize]) -> T + Sync,
{
    if parallelism <= 1 || partitions.len() <= 1 {
        return partitions.iter().map(|p| work(p.as_slice())).collect();
    }

    let workers = parallelism.min(partitions.len());
    let (job_tx, job_rx) = bounded::<usize>(partitions.len());
    let (out_tx, out_rx) = unbounded::<(usize, T)>();
    for idx in 0..partitions.len() {
        if job_tx.send(idx).is_err() {
            break;
        }
    }
    drop(job_tx);

    thread::scope(|s| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let out_tx = out_tx.clone();
            let work = &work;
            s.spawn(move || {
                for idx in job_rx.iter() {
                    if out_tx.send((idx, work(partitions[idx].as_slice()))).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(out_tx);

    let mut slots: Vec<Option<T>> = (0..partitions.len()).map(|_| None).collect();
    for (idx, value) in out_rx.iter() {
        slots[idx] = Some(value);
    }
    slots.into_iter().flatten().collect()
}
