//! Domain layer: entities and value types from SPEC_FULL.md §3.

pub mod connector;
pub mod event;
pub mod identity;
pub mod ids;
pub mod message;
pub mod oauth_state;
pub mod push;
pub mod send;
pub mod sync_state;

pub use connector::{
    AuthConfig, ConnectorStatus, FromEnvelopeDefaults, GmailPush, GmailPushStatus,
    IncomingConnector, IncomingProvider, OutgoingConnector, OutgoingProvider, SentCopyBehavior,
    SentCopyMode, SyncSettings, TlsMode, MAX_WATCH_MAILBOXES,
};
pub use event::{clamp_limit, clamp_since, SyncEvent, SyncEventType, MAX_EVENTS_PAGE, MIN_SINCE};
pub use identity::Identity;
pub use ids::{
    AttachmentId, IdentityId, IncomingConnectorId, LabelId, MessageId, OAuthStateId,
    OutgoingConnectorId, SavedSearchId, SendIdempotencyKey, SyncEventId, ThreadTag, UserId,
};
pub use message::{Address, Attachment, Message, ProviderMeta, ScanStatus};
pub use oauth_state::{ConnectorType, OAuthState};
pub use push::PushSubscription;
pub use send::{
    normalize_send_idempotency_key, OutgoingAttachment, SendIdempotency, SendPayload, SendResult,
    SendStatus,
};
pub use sync_state::{SyncProgress, SyncState, SyncStatePatch, SyncStatus};
