//! Advisory text-aggregation collaborator.
//!
//! An external service (a reviewer, a generative-text judge) may synthesize
//! one text from several variants. It is never required: every caller has a
//! deterministic fallback for when it is missing or failing.

use thiserror::Error;

/// Errors raised by a text aggregator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AggregationError {
    /// The service could not be reached.
    #[error("aggregator unavailable: {0}")]
    Unavailable(String),

    /// The service answered but produced nothing usable.
    #[error("aggregator returned an unusable response: {0}")]
    InvalidResponse(String),
}

/// Synthesizes one text from several variants.
pub trait TextAggregator: Send + Sync {
    /// Produce a single text from `variants`.
    fn synthesize(&self, variants: &[String]) -> Result<String, AggregationError>;
}

impl<F> TextAggregator for F
where
    F: Fn(&[String]) -> Result<String, AggregationError> + Send + Sync,
{
    fn synthesize(&self, variants: &[String]) -> Result<String, AggregationError> {
        self(variants)
    }
}

/// Calls `aggregator`, rejecting blank output.
pub(crate) fn synthesize_checked(
    aggregator: &dyn TextAggregator,
    variants: &[String],
) -> Result<String, AggregationError> {
    let text = aggregator.synthesize(variants)?;
    if text.trim().is_empty() {
        return Err(AggregationError::InvalidResponse("empty text".to_string()));
    }
    Ok(text)
}
