//! Stable identifiers for graph records.
//!
//! The engine only ever holds ids; adjacency is resolved through the store.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an id from an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Returns true if this is a nil (all zeros) UUID.
            #[must_use]
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Globally unique, stable node identifier.
    ///
    /// # Examples
    ///
    /// ```
    /// use kgconsolidate::NodeId;
    ///
    /// let id = NodeId::new();
    /// assert!(!id.is_nil());
    /// ```
    NodeId
);

uuid_id!(
    /// Identifier of a relationship (edge) between two nodes.
    RelationshipId
);

uuid_id!(
    /// Identifier of a pre-computed community record.
    CommunityId
);

uuid_id!(
    /// Identifier of a soft link between two communities.
    CommunityLinkId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(NodeId::new(), NodeId::new());
        assert_ne!(CommunityId::new(), CommunityId::new());
    }

    #[test]
    fn test_id_serde_is_transparent() {
        let uuid = Uuid::new_v4();
        let id = NodeId::from_uuid(uuid);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{uuid}\""));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
