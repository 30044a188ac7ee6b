//! Identifier newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            #[doc = concat!("Generate a new random `", stringify!($name), "`.")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Get the inner UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
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
    /// Unique identifier for a user (owned by the account layer).
    UserId
);
uuid_id!(
    /// Unique identifier for an edition row. Distinct from the edition number.
    EditionId
);
uuid_id!(
    /// Unique identifier for an access grant.
    AccessId
);
uuid_id!(
    /// Unique identifier for an order.
    OrderId
);
uuid_id!(
    /// Unique identifier for a subscription.
    SubscriptionId
);
uuid_id!(
    /// Unique identifier for a shipping address.
    AddressId
);
uuid_id!(
    /// Unique identifier for a queued job.
    JobId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_bare_uuid() {
        let id = UserId::new();
        let json = serde_json::to_string(&id).unwrap_or_default();
        assert_eq!(json, format!("\"{}\"", id.0));
    }

    #[test]
    fn ids_display_inner_uuid() {
        let uuid = Uuid::new_v4();
        assert_eq!(EditionId::from(uuid).to_string(), uuid.to_string());
    }
}
