//! Link proposal validators.

use super::LinkProposal;

/// Decides whether a proposed community link may be written.
///
/// The default accepts everything; stricter or reviewer-backed validators
/// plug in through [`super::CommunityAnalyzer::with_validator`].
pub trait LinkValidator: Send + Sync {
    /// Name recorded as `validated_by` on accepted links.
    fn name(&self) -> &str;

    /// Returns true if `proposal` should be written.
    fn accepts(&self, proposal: &LinkProposal) -> bool;
}

/// Accepts every proposal.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl LinkValidator for AcceptAll {
    fn name(&self) -> &str {
        "accept_all"
    }

    fn accepts(&self, _proposal: &LinkProposal) -> bool {
        true
    }
}

/// Accepts proposals at or above a confidence floor.
#[derive(Debug, Clone, Copy)]
pub struct MinConfidence(pub f64);

impl LinkValidator for MinConfidence {
    fn name(&self) -> &str {
        "min_confidence"
    }

    fn accepts(&self, proposal: &LinkProposal) -> bool {
        proposal.confidence >= self.0
    }
}
