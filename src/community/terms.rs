//! Vocabulary extraction from free-text summaries.

use std::collections::BTreeSet;

use crate::similarity::normalize;

const STOPWORDS: &[&str] = &[
    "about", "after", "also", "among", "been", "before", "being", "between", "both", "could",
    "during", "each", "from", "have", "into", "many", "more", "most", "only", "other", "over",
    "same", "should", "some", "such", "than", "that", "their", "them", "then", "there", "these",
    "they", "this", "those", "through", "under", "upon", "very", "were", "what", "when", "where",
    "which", "while", "whom", "whose", "will", "with", "within", "without", "would", "your",
];

/// Returns true for built-in English stopwords.
#[must_use]
pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.binary_search(&token).is_ok()
}

/// Distinct normalized tokens of `text` at least `min_len` characters long,
/// excluding built-in and `extra` stopwords.
#[must_use]
pub fn vocabulary(text: &str, min_len: usize, extra: &BTreeSet<String>) -> BTreeSet<String> {
    normalize(text)
        .split(' ')
        .filter(|t| t.chars().count() >= min_len.max(1))
        .filter(|t| !is_stopword(t) && !extra.contains(*t))
        .map(str::to_string)
        .collect()
}

/// Token Jaccard overlap in `[0, 1]`; two empty sets score 0.0.
#[must_use]
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}
