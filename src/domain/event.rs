//! Append-only sync event log (§3 `SyncEvent`, §4.D).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{IncomingConnectorId, SyncEventId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    MessageSynced,
    MessageUpdated,
    SyncCompleted,
    SyncCancelled,
    SyncCancelRequested,
    SyncError,
    SyncInfo,
    MessageParsed,
}

impl SyncEventType {
    /// Event types excluded from browser-push fan-out (§4.D).
    pub fn is_push_eligible(self) -> bool {
        !matches!(self, SyncEventType::MessageParsed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: SyncEventId,
    pub user_id: UserId,
    pub incoming_connector_id: IncomingConnectorId,
    pub event_type: SyncEventType,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Clamp bounds for `listSyncEvents` (§4.D).
pub const MIN_SINCE: i64 = 0;
pub const MAX_EVENTS_PAGE: u32 = 500;

pub fn clamp_since(since: i64) -> i64 {
    since.max(MIN_SINCE)
}

pub fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_EVENTS_PAGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_parsed_is_not_push_eligible() {
        assert!(!SyncEventType::MessageParsed.is_push_eligible());
        assert!(SyncEventType::SyncCompleted.is_push_eligible());
    }

    #[test]
    fn clamp_since_floors_at_zero() {
        assert_eq!(clamp_since(-5), 0);
        assert_eq!(clamp_since(42), 42);
    }

    #[test]
    fn clamp_limit_bounds_to_500() {
        assert_eq!(clamp_limit(0), 1);
        assert_eq!(clamp_limit(10_000), 500);
        assert_eq!(clamp_limit(50), 50);
    }
}
