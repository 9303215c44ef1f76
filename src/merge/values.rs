//! Property variant collection and representative selection.
//!
//! Shared by the merger and the conflict resolver so both pick the same
//! representative from the same provenance.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::ValueStrategy;
use crate::graph::{is_empty_value, push_unique, value_key, Node, NodeId, ValueProvenance};

/// One distinct value of a property with the ids that contributed it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Variant {
    pub value: Value,
    pub origins: Vec<NodeId>,
}

/// Distinct values of one property, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct VariantSet {
    variants: Vec<Variant>,
}

impl VariantSet {
    pub fn add(&mut self, value: &Value, origins: &[NodeId]) {
        if is_empty_value(value) {
            return;
        }
        let slot = match self.variants.iter().position(|v| v.value == *value) {
            Some(pos) => pos,
            None => {
                self.variants.push(Variant {
                    value: value.clone(),
                    origins: Vec::new(),
                });
                self.variants.len() - 1
            }
        };
        for id in origins {
            push_unique(&mut self.variants[slot].origins, *id);
        }
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub fn values(&self) -> Vec<Value> {
        self.variants.iter().map(|v| v.value.clone()).collect()
    }

    pub fn provenance(&self) -> ValueProvenance {
        let mut out = ValueProvenance::new();
        for variant in &self.variants {
            let ids = out.entry(value_key(&variant.value)).or_default();
            for id in &variant.origins {
                push_unique(ids, *id);
            }
        }
        out
    }

    /// Index of the representative under `strategy`.
    pub fn pick(&self, strategy: ValueStrategy) -> Option<usize> {
        if self.variants.is_empty() {
            return None;
        }
        let by_provenance = |a: usize, b: usize| {
            self.variants[a]
                .origins
                .len()
                .cmp(&self.variants[b].origins.len())
                .then_with(|| b.cmp(&a))
        };
        let indices = 0..self.variants.len();
        match strategy {
            ValueStrategy::FirstSeen => Some(0),
            ValueStrategy::MostProvenance => indices.max_by(|&a, &b| by_provenance(a, b)),
            ValueStrategy::LongestText => indices.max_by(|&a, &b| {
                text_len(&self.variants[a].value)
                    .cmp(&text_len(&self.variants[b].value))
                    .then_with(|| by_provenance(a, b))
            }),
        }
    }

    pub fn representative(&self, strategy: ValueStrategy) -> Option<&Value> {
        self.pick(strategy).map(|i| &self.variants[i].value)
    }
}

fn text_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        other => other.to_string().chars().count(),
    }
}

/// Every variant a node holds for every property.
///
/// A node's recorded conflict variants come first with their recorded
/// provenance (falling back to the node's own id); its current value follows,
/// attributed to the node itself unless it is one of the recorded variants.
pub(crate) fn collect_node_variants(node: &Node, into: &mut BTreeMap<String, VariantSet>) {
    for (key, variants) in &node.conflicts {
        let recorded = node.conflict_provenance.get(key);
        let set = into.entry(key.clone()).or_default();
        for value in variants {
            match recorded.and_then(|p| p.get(&value_key(value))) {
                Some(origins) if !origins.is_empty() => set.add(value, origins),
                _ => set.add(value, &[node.id]),
            }
        }
    }

    for (key, value) in &node.properties {
        if key == "name" || key == "aliases" || is_empty_value(value) {
            continue;
        }
        let already_recorded = node
            .conflicts
            .get(key)
            .map_or(false, |variants| variants.contains(value));
        if already_recorded {
            continue;
        }
        into.entry(key.clone()).or_default().add(value, &[node.id]);
    }
}
