//! Per-(connector, mailbox) sync state (§3 `SyncState`, §4.F).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::IncomingConnectorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Queued,
    Syncing,
    CancelRequested,
    Cancelled,
    Completed,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncProgress {
    pub inserted: u64,
    pub updated: u64,
    pub reconciled_removed: u64,
    pub metadata_refreshed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub incoming_connector_id: IncomingConnectorId,
    pub mailbox: String,
    pub status: SyncStatus,
    pub uid_validity: Option<u32>,
    pub last_seen_uid: u32,
    pub highest_uid: u32,
    pub modseq: Option<u64>,
    pub last_full_reconcile_at: Option<DateTime<Utc>>,
    pub sync_started_at: Option<DateTime<Utc>>,
    pub sync_completed_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
    pub sync_progress: SyncProgress,
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    pub fn fresh(incoming_connector_id: IncomingConnectorId, mailbox: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            incoming_connector_id,
            mailbox: mailbox.into(),
            status: SyncStatus::Idle,
            uid_validity: None,
            last_seen_uid: 0,
            highest_uid: 0,
            modseq: None,
            last_full_reconcile_at: None,
            sync_started_at: None,
            sync_completed_at: None,
            sync_error: None,
            sync_progress: SyncProgress::default(),
            updated_at: now,
        }
    }
}

/// Only columns that exist in the schema are ever written (§4.F); the store
/// layer filters this against `information_schema` before issuing the
/// UPDATE. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SyncStatePatch {
    pub status: Option<SyncStatus>,
    pub uid_validity: Option<Option<u32>>,
    pub last_seen_uid: Option<u32>,
    pub highest_uid: Option<u32>,
    pub modseq: Option<Option<u64>>,
    pub last_full_reconcile_at: Option<Option<DateTime<Utc>>>,
    pub sync_started_at: Option<Option<DateTime<Utc>>>,
    pub sync_completed_at: Option<Option<DateTime<Utc>>>,
    pub sync_error: Option<Option<String>>,
    pub sync_progress: Option<SyncProgress>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_idle_with_zero_progress() {
        let s = SyncState::fresh(IncomingConnectorId::from("c1"), "INBOX");
        assert_eq!(s.status, SyncStatus::Idle);
        assert_eq!(s.sync_progress, SyncProgress::default());
        assert_eq!(s.last_seen_uid, 0);
    }
}
