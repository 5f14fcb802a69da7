// src/id.rs
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! typed_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

typed_id!(WalletId);
typed_id!(AccountId);
/// Journal entry id. v7 uuids are time-ordered, so entry ids double as a
/// newest-first pagination cursor.
typed_id!(EntryId);
typed_id!(LineId);
typed_id!(HoldId);
typed_id!(IntentId);
typed_id!(RefundId);
typed_id!(ApiKeyId);
