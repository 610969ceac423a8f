//! Newtype identifiers for domain entities.
//!
//! Every ID wraps a `String` (Postgres `uuid`/`text` primary keys are
//! rendered to text at the boundary) so call sites can't accidentally swap
//! a `MessageId` for a `ThreadId`.

use std::fmt;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
        )]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

id_type!(UserId);
id_type!(IncomingConnectorId);
id_type!(OutgoingConnectorId);
id_type!(IdentityId);
id_type!(MessageId);
id_type!(AttachmentId);
id_type!(SendIdempotencyKey);
id_type!(OAuthStateId);
id_type!(LabelId);
id_type!(SavedSearchId);
id_type!(ThreadTag);

/// `SyncEvent.id` is a DB-assigned monotonic sequence, not an opaque string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SyncEventId(pub i64);

impl fmt::Display for SyncEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_display_roundtrips_through_string() {
        let id = MessageId::from("msg-123");
        assert_eq!(id.to_string(), "msg-123");
        assert_eq!(MessageId::from(id.to_string()), id);
    }

    #[test]
    fn event_id_ordering_is_numeric() {
        assert!(SyncEventId(42) > SyncEventId(10));
    }
}
