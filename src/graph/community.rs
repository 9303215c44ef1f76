//! Communities and the soft links between them.
//!
//! A community is a pre-computed cluster of entities with a free-text
//! summary. The consolidation engine never changes `members`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{CommunityId, CommunityLinkId, NodeId};

/// Relationship type written for soft community links.
pub const ASSOCIATED_WITH: &str = "ASSOCIATED_WITH";

/// One non-destructive summary change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryVersion {
    /// Text before the change.
    pub old: String,
    /// Text after the change.
    pub new: String,
    /// When the change was recorded.
    pub changed_at: DateTime<Utc>,
}

/// A synthesized or merged summary stored alongside the originals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidatedSummary {
    /// The consolidated text.
    pub text: String,
    /// Original summaries, keyed by community.
    pub originals: BTreeMap<CommunityId, String>,
    /// How the text was produced (`aggregator`, `attributed_concatenation`).
    pub method: String,
    /// When it was produced.
    pub created_at: DateTime<Utc>,
}

impl ConsolidatedSummary {
    /// Same text from the same originals.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.text == other.text && self.originals == other.originals
    }
}

/// A community record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    /// Stable store id.
    pub id: CommunityId,
    /// Display name.
    pub name: String,
    /// Current free-text summary.
    #[serde(default)]
    pub summary: String,
    /// Member entities.
    #[serde(default)]
    pub members: BTreeSet<NodeId>,
    /// Append-only summary change log.
    #[serde(default)]
    pub summary_versions: Vec<SummaryVersion>,
    /// Append-only consolidated summaries.
    #[serde(default)]
    pub consolidated_summaries: Vec<ConsolidatedSummary>,
    /// When the community was created.
    pub created_at: DateTime<Utc>,
    /// When the community was last modified.
    pub updated_at: DateTime<Utc>,
    /// Version number (incremented on every write).
    pub version: u64,
}

impl Community {
    /// Creates a new community.
    #[must_use]
    pub fn new(name: impl Into<String>, summary: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: CommunityId::new(),
            name: name.into(),
            summary: summary.into(),
            members: BTreeSet::new(),
            summary_versions: Vec::new(),
            consolidated_summaries: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Adds a member (builder style).
    #[must_use]
    pub fn with_member(mut self, id: NodeId) -> Self {
        self.members.insert(id);
        self
    }

    /// Updates `updated_at` and increments the version.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }
}

/// A persisted soft association between two communities.
///
/// Endpoints are stored in canonical order (`community_a < community_b`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityLink {
    /// Stable store id.
    pub id: CommunityLinkId,
    /// Lower endpoint.
    pub community_a: CommunityId,
    /// Upper endpoint.
    pub community_b: CommunityId,
    /// Always [`ASSOCIATED_WITH`] for links written by the engine.
    pub link_type: String,
    /// Link confidence.
    pub confidence: f64,
    /// Supporting evidence.
    #[serde(default)]
    pub evidence: BTreeMap<String, Value>,
    /// Name of the validator that accepted the link.
    pub validated_by: String,
    /// When the link was first written.
    pub created_at: DateTime<Utc>,
    /// When the link was last updated.
    pub updated_at: DateTime<Utc>,
}

impl CommunityLink {
    /// Returns the canonical (ordered) endpoint pair.
    #[must_use]
    pub fn canonical_pair(a: CommunityId, b: CommunityId) -> (CommunityId, CommunityId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Returns true if the link joins `a` and `b` in either order.
    #[must_use]
    pub fn joins(&self, a: CommunityId, b: CommunityId) -> bool {
        (self.community_a, self.community_b) == Self::canonical_pair(a, b)
    }
}
