//! Sync state persistence (§4.F): `tryClaimMailboxSync`, `reapStaleSyncStates`,
//! `setSyncState`, grounded on the teacher's `storage::queries::accounts`
//! CRUD shape but centered on the CAS claim statement the spec gives
//! verbatim.

use chrono::Utc;
use sqlx::{PgPool, Row};

use crate::domain::{IncomingConnectorId, SyncProgress, SyncState, SyncStatePatch, SyncStatus};
use crate::storage::{Result, StorageError};

fn status_to_str(s: SyncStatus) -> &'static str {
    match s {
        SyncStatus::Idle => "idle",
        SyncStatus::Queued => "queued",
        SyncStatus::Syncing => "syncing",
        SyncStatus::CancelRequested => "cancel_requested",
        SyncStatus::Cancelled => "cancelled",
        SyncStatus::Completed => "completed",
        SyncStatus::Error => "error",
    }
}

fn status_from_str(s: &str) -> SyncStatus {
    match s {
        "queued" => SyncStatus::Queued,
        "syncing" => SyncStatus::Syncing,
        "cancel_requested" => SyncStatus::CancelRequested,
        "cancelled" => SyncStatus::Cancelled,
        "completed" => SyncStatus::Completed,
        "error" => SyncStatus::Error,
        _ => SyncStatus::Idle,
    }
}

pub async fn get(
    pool: &PgPool,
    connector_id: &IncomingConnectorId,
    mailbox: &str,
) -> Result<Option<SyncState>> {
    let row = sqlx::query(
        r#"
        SELECT incoming_connector_id, mailbox, status, uid_validity, last_seen_uid, highest_uid,
               modseq, last_full_reconcile_at, sync_started_at, sync_completed_at, sync_error,
               sync_progress, updated_at
        FROM sync_states WHERE incoming_connector_id = $1 AND mailbox = $2
        "#,
    )
    .bind(&connector_id.0)
    .bind(mailbox)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };

    let uid_validity: Option<i64> = row.try_get("uid_validity")?;
    let modseq: Option<i64> = row.try_get("modseq")?;
    let progress: serde_json::Value = row.try_get("sync_progress")?;

    Ok(Some(SyncState {
        incoming_connector_id: IncomingConnectorId(row.try_get("incoming_connector_id")?),
        mailbox: row.try_get("mailbox")?,
        status: status_from_str(row.try_get::<String, _>("status")?.as_str()),
        uid_validity: uid_validity.map(|v| v as u32),
        last_seen_uid: row.try_get::<i64, _>("last_seen_uid")? as u32,
        highest_uid: row.try_get::<i64, _>("highest_uid")? as u32,
        modseq: modseq.map(|m| m as u64),
        last_full_reconcile_at: row.try_get("last_full_reconcile_at")?,
        sync_started_at: row.try_get("sync_started_at")?,
        sync_completed_at: row.try_get("sync_completed_at")?,
        sync_error: row.try_get("sync_error")?,
        sync_progress: serde_json::from_value(progress).unwrap_or_default(),
        updated_at: row.try_get("updated_at")?,
    }))
}

/// Ensures a `(connectorId, mailbox)` row exists before the first claim.
pub async fn ensure_exists(pool: &PgPool, connector_id: &IncomingConnectorId, mailbox: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_states (incoming_connector_id, mailbox)
        VALUES ($1, $2)
        ON CONFLICT (incoming_connector_id, mailbox) DO NOTHING
        "#,
    )
    .bind(&connector_id.0)
    .bind(mailbox)
    .execute(pool)
    .await?;
    Ok(())
}

/// `tryClaimMailboxSync` (§4.F): single CAS UPDATE. `heartbeat_stale` and
/// `claim_stale` are passed as second intervals rather than baked into the
/// query so callers can use the configured durations.
pub async fn try_claim_mailbox_sync(
    pool: &PgPool,
    connector_id: &IncomingConnectorId,
    mailbox: &str,
    progress: &SyncProgress,
    last_seen_uid: u32,
    highest_uid: u32,
    heartbeat_stale_secs: i64,
    claim_stale_secs: i64,
) -> Result<bool> {
    let progress_json = serde_json::to_value(progress).unwrap_or_default();

    let result = sqlx::query(
        r#"
        UPDATE sync_states
        SET status = 'syncing',
            sync_started_at = NOW(),
            sync_completed_at = NULL,
            sync_error = NULL,
            sync_progress = $3,
            last_seen_uid = $4,
            highest_uid = GREATEST(highest_uid, 0, $5),
            updated_at = NOW()
        WHERE incoming_connector_id = $1 AND mailbox = $2
          AND ( status <> 'syncing'
                OR sync_started_at IS NULL
                OR updated_at < NOW() - ($6 || ' seconds')::interval
                OR sync_started_at < NOW() - ($7 || ' seconds')::interval )
        "#,
    )
    .bind(&connector_id.0)
    .bind(mailbox)
    .bind(progress_json)
    .bind(i64::from(last_seen_uid))
    .bind(i64::from(highest_uid))
    .bind(heartbeat_stale_secs)
    .bind(claim_stale_secs)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// §4.F: marks stale `syncing|queued|cancel_requested` rows as `error`.
/// Returns the `(connector_id, mailbox)` pairs reaped, so the caller can
/// emit one `sync_error` event per row.
pub async fn reap_stale_sync_states(
    pool: &PgPool,
    claim_stale_secs: i64,
) -> Result<Vec<(IncomingConnectorId, String)>> {
    let rows = sqlx::query(
        r#"
        UPDATE sync_states
        SET status = 'error',
            sync_error = 'stale sync state reaped by maintenance',
            updated_at = NOW()
        WHERE status IN ('syncing', 'queued', 'cancel_requested')
          AND COALESCE(sync_started_at, updated_at) < NOW() - ($1 || ' seconds')::interval
        RETURNING incoming_connector_id, mailbox
        "#,
    )
    .bind(claim_stale_secs)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| {
            let connector_id: String = r.try_get("incoming_connector_id").unwrap_or_default();
            let mailbox: String = r.try_get("mailbox").unwrap_or_default();
            (IncomingConnectorId(connector_id), mailbox)
        })
        .collect())
}

/// §4.F `setSyncState`: only writes columns present in `patch`, never
/// touching the rest. `Option<Option<T>>` fields distinguish "leave alone"
/// from "set to NULL" (see `SyncStatePatch` doc comment).
pub async fn set_sync_state(
    pool: &PgPool,
    connector_id: &IncomingConnectorId,
    mailbox: &str,
    patch: &SyncStatePatch,
) -> Result<()> {
    let mut sets: Vec<String> = Vec::new();
    let mut idx = 1u32;
    macro_rules! bind_slot {
        () => {{
            idx += 1;
            idx - 1
        }};
    }

    // Built dynamically because `SyncStatePatch` may touch an arbitrary
    // subset of columns; sqlx's query! macro can't express that without a
    // live database to check against, so this uses the runtime `query`
    // builder instead, matching the "no compile-time macros" choice noted
    // in the storage module docs.
    let mut query_str = String::from("UPDATE sync_states SET updated_at = NOW()");
    let mut bind_status: Option<&'static str> = None;
    let mut bind_uid_validity: Option<Option<i64>> = None;
    let mut bind_last_seen_uid: Option<i64> = None;
    let mut bind_highest_uid: Option<i64> = None;
    let mut bind_modseq: Option<Option<i64>> = None;
    let mut bind_reconcile_at: Option<Option<chrono::DateTime<Utc>>> = None;
    let mut bind_started_at: Option<Option<chrono::DateTime<Utc>>> = None;
    let mut bind_completed_at: Option<Option<chrono::DateTime<Utc>>> = None;
    let mut bind_error: Option<Option<String>> = None;
    let mut bind_progress: Option<serde_json::Value> = None;

    if let Some(status) = patch.status {
        sets.push(format!("status = ${}", bind_slot!()));
        bind_status = Some(status_to_str(status));
    }
    if let Some(uv) = patch.uid_validity {
        sets.push(format!("uid_validity = ${}", bind_slot!()));
        bind_uid_validity = Some(uv.map(i64::from));
    }
    if let Some(lsu) = patch.last_seen_uid {
        sets.push(format!("last_seen_uid = ${}", bind_slot!()));
        bind_last_seen_uid = Some(i64::from(lsu));
    }
    if let Some(hu) = patch.highest_uid {
        sets.push(format!("highest_uid = ${}", bind_slot!()));
        bind_highest_uid = Some(i64::from(hu));
    }
    if let Some(modseq) = patch.modseq {
        sets.push(format!("modseq = ${}", bind_slot!()));
        bind_modseq = Some(modseq.map(|m| m as i64));
    }
    if let Some(rec) = patch.last_full_reconcile_at {
        sets.push(format!("last_full_reconcile_at = ${}", bind_slot!()));
        bind_reconcile_at = Some(rec);
    }
    if let Some(started) = patch.sync_started_at {
        sets.push(format!("sync_started_at = ${}", bind_slot!()));
        bind_started_at = Some(started);
    }
    if let Some(completed) = patch.sync_completed_at {
        sets.push(format!("sync_completed_at = ${}", bind_slot!()));
        bind_completed_at = Some(completed);
    }
    if let Some(err) = patch.sync_error.clone() {
        sets.push(format!("sync_error = ${}", bind_slot!()));
        bind_error = Some(err);
    }
    if let Some(progress) = patch.sync_progress.clone() {
        sets.push(format!("sync_progress = ${}", bind_slot!()));
        bind_progress = Some(serde_json::to_value(progress).unwrap_or_default());
    }

    if !sets.is_empty() {
        query_str.push_str(", ");
        query_str.push_str(&sets.join(", "));
    }

    let connector_slot = bind_slot!();
    let mailbox_slot = bind_slot!();
    query_str.push_str(&format!(
        " WHERE incoming_connector_id = ${connector_slot} AND mailbox = ${mailbox_slot}"
    ));

    let mut q = sqlx::query(&query_str);
    if let Some(v) = bind_status {
        q = q.bind(v);
    }
    if let Some(v) = bind_uid_validity {
        q = q.bind(v);
    }
    if let Some(v) = bind_last_seen_uid {
        q = q.bind(v);
    }
    if let Some(v) = bind_highest_uid {
        q = q.bind(v);
    }
    if let Some(v) = bind_modseq {
        q = q.bind(v);
    }
    if let Some(v) = bind_reconcile_at {
        q = q.bind(v);
    }
    if let Some(v) = bind_started_at {
        q = q.bind(v);
    }
    if let Some(v) = bind_completed_at {
        q = q.bind(v);
    }
    if let Some(v) = bind_error {
        q = q.bind(v);
    }
    if let Some(v) = bind_progress {
        q = q.bind(v);
    }
    q = q.bind(&connector_id.0).bind(mailbox);

    q.execute(pool).await.map_err(StorageError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            SyncStatus::Idle,
            SyncStatus::Queued,
            SyncStatus::Syncing,
            SyncStatus::CancelRequested,
            SyncStatus::Cancelled,
            SyncStatus::Completed,
            SyncStatus::Error,
        ] {
            assert_eq!(status_from_str(status_to_str(s)), s);
        }
    }
}
