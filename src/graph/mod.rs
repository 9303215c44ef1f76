//! Graph data model.
//!
//! Nodes, relationships, communities and the persisted consolidation
//! annotations written onto them.

mod annotations;
mod community;
mod ids;
mod node;
mod relationship;

pub use annotations::{
    is_empty_value, value_key, MergeRecord, Properties, RelationshipRewrite, RewriteOutcome,
    ValueProvenance,
};
pub(crate) use annotations::push_unique;
pub use community::{
    Community, CommunityLink, ConsolidatedSummary, SummaryVersion, ASSOCIATED_WITH,
};
pub use ids::{CommunityId, CommunityLinkId, NodeId, RelationshipId};
pub use node::Node;
pub use relationship::Relationship;
