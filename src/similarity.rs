//! String and property similarity.
//!
//! All string comparisons run on [`normalize`]d text. Scores are in `[0, 1]`.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::Node;

/// String comparison method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMethod {
    /// Full-string edit ratio.
    #[default]
    Ratio,
    /// Best ratio of the shorter string against every same-length window of the longer.
    PartialRatio,
    /// Ratio after sorting whitespace tokens; insensitive to word order.
    TokenSortRatio,
    /// Jaro-Winkler similarity.
    JaroWinkler,
}

/// Lowercase, strip punctuation, collapse whitespace.
///
/// # Examples
///
/// ```
/// use kgconsolidate::similarity::normalize;
///
/// assert_eq!(normalize("  Frodo   Baggins! "), "frodo baggins");
/// ```
#[must_use]
pub fn normalize(s: &str) -> String {
    let stripped: String = s
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized, deduplicated name and aliases of a node, in first-seen order.
#[must_use]
pub fn normalized_names(node: &Node) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in node.names() {
        let key = normalize(name);
        if !key.is_empty() && !out.contains(&key) {
            out.push(key);
        }
    }
    out
}

/// Case-insensitive whole-word pattern for a name.
///
/// The name is normalized first; its tokens may be separated by any run of
/// whitespace in the searched text. `None` for names that normalize to
/// nothing or produce an oversized pattern.
#[must_use]
pub fn mention_pattern(name: &str) -> Option<Regex> {
    let normalized = normalize(name);
    if normalized.is_empty() {
        return None;
    }
    let body = normalized
        .split(' ')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    Regex::new(&format!(r"(?i)\b{body}\b")).ok()
}

/// Insert/delete edit distance where an adjacent transposition costs 1.
fn indel_transposition_distance(a: &[char], b: &[char]) -> usize {
    let m = b.len();
    let mut prev2: Vec<usize> = vec![0; m + 1];
    let mut prev: Vec<usize> = (0..=m).collect();
    let mut cur: Vec<usize> = vec![0; m + 1];

    for i in 1..=a.len() {
        cur[0] = i;
        for j in 1..=m {
            let mut best = (prev[j] + 1).min(cur[j - 1] + 1);
            if a[i - 1] == b[j - 1] {
                best = best.min(prev[j - 1]);
            } else if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                best = best.min(prev2[j - 2] + 1);
            }
            cur[j] = best;
        }
        std::mem::swap(&mut prev2, &mut prev);
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[m]
}

#[allow(clippy::cast_precision_loss)]
fn ratio_chars(a: &[char], b: &[char]) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let dist = indel_transposition_distance(a, b);
    (1.0 - dist as f64 / total as f64).clamp(0.0, 1.0)
}

fn partial_ratio_chars(a: &[char], b: &[char]) -> f64 {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if short.len() == long.len() {
        return ratio_chars(short, long);
    }
    if short.is_empty() {
        return 0.0;
    }
    let mut best = 0.0f64;
    for window in long.windows(short.len()) {
        best = best.max(ratio_chars(short, window));
        if best >= 1.0 {
            break;
        }
    }
    best
}

fn sorted_tokens(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Compare two strings that are already normalized.
#[must_use]
pub fn compare_normalized(a: &str, b: &str, method: SimilarityMethod) -> f64 {
    match method {
        SimilarityMethod::Ratio => {
            let a: Vec<char> = a.chars().collect();
            let b: Vec<char> = b.chars().collect();
            ratio_chars(&a, &b)
        }
        SimilarityMethod::PartialRatio => {
            let a: Vec<char> = a.chars().collect();
            let b: Vec<char> = b.chars().collect();
            partial_ratio_chars(&a, &b)
        }
        SimilarityMethod::TokenSortRatio => {
            let a: Vec<char> = sorted_tokens(a).chars().collect();
            let b: Vec<char> = sorted_tokens(b).chars().collect();
            ratio_chars(&a, &b)
        }
        SimilarityMethod::JaroWinkler => strsim::jaro_winkler(a, b),
    }
}

/// Similarity of two raw strings under `method`.
///
/// # Examples
///
/// ```
/// use kgconsolidate::similarity::{similarity, SimilarityMethod};
///
/// let s = similarity("Galadriel", "Galadirel", SimilarityMethod::Ratio);
/// assert!(s >= 0.90 && s < 0.95);
/// ```
#[must_use]
pub fn similarity(a: &str, b: &str, method: SimilarityMethod) -> f64 {
    compare_normalized(&normalize(a), &normalize(b), method)
}

/// Best-scoring pair between two normalized name lists.
#[derive(Debug, Clone, PartialEq)]
pub struct NameMatch {
    /// Similarity of the pair.
    pub score: f64,
    /// Name from the left list.
    pub left: String,
    /// Name from the right list.
    pub right: String,
}

/// Compare every name pair across two normalized name lists and return the best.
#[must_use]
pub fn best_name_match(
    left: &[String],
    right: &[String],
    method: SimilarityMethod,
) -> Option<NameMatch> {
    let mut best: Option<NameMatch> = None;
    for l in left {
        for r in right {
            let score = compare_normalized(l, r, method);
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(NameMatch {
                    score,
                    left: l.clone(),
                    right: r.clone(),
                });
            }
        }
    }
    best
}

fn property_of(node: &Node, key: &str) -> Option<Value> {
    if key == "name" {
        return node.name.clone().map(Value::String);
    }
    node.properties.get(key).cloned()
}

fn numeric_similarity(a: f64, b: f64) -> f64 {
    let denom = a.abs().max(b.abs());
    if denom == 0.0 {
        return 1.0;
    }
    (1.0 - (a - b).abs() / denom).clamp(0.0, 1.0)
}

/// Weighted average similarity over named properties.
///
/// Strings use [`SimilarityMethod::Ratio`], numbers use relative difference,
/// anything else exact equality. Properties missing on either side do not
/// count toward the denominator. Returns 0.0 when nothing is comparable.
#[must_use]
pub fn node_similarity(n1: &Node, n2: &Node, weights: &BTreeMap<String, f64>) -> f64 {
    let mut weighted = 0.0;
    let mut total = 0.0;

    for (key, &weight) in weights {
        if weight <= 0.0 || !weight.is_finite() {
            continue;
        }
        let (Some(a), Some(b)) = (property_of(n1, key), property_of(n2, key)) else {
            continue;
        };
        if a.is_null() || b.is_null() {
            continue;
        }

        let score = match (&a, &b) {
            (Value::String(x), Value::String(y)) => similarity(x, y, SimilarityMethod::Ratio),
            (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => numeric_similarity(x, y),
                _ => f64::from(u8::from(a == b)),
            },
            _ => f64::from(u8::from(a == b)),
        };

        weighted += weight * score;
        total += weight;
    }

    if total == 0.0 {
        0.0
    } else {
        weighted / total
    }
}
