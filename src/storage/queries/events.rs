//! Sync event log persistence (§4.D), the storage side of the event bus.
//! The NOTIFY fan-out itself lives in `events::bus`; this module only
//! owns the row insert/select/prune.

use sqlx::{PgPool, Row};

use crate::domain::{clamp_limit, clamp_since, IncomingConnectorId, SyncEvent, SyncEventId, SyncEventType, UserId};
use crate::storage::Result;

fn event_type_to_str(t: SyncEventType) -> &'static str {
    match t {
        SyncEventType::MessageSynced => "message_synced",
        SyncEventType::MessageUpdated => "message_updated",
        SyncEventType::SyncCompleted => "sync_completed",
        SyncEventType::SyncCancelled => "sync_cancelled",
        SyncEventType::SyncCancelRequested => "sync_cancel_requested",
        SyncEventType::SyncError => "sync_error",
        SyncEventType::SyncInfo => "sync_info",
        SyncEventType::MessageParsed => "message_parsed",
    }
}

fn event_type_from_str(s: &str) -> SyncEventType {
    match s {
        "message_updated" => SyncEventType::MessageUpdated,
        "sync_completed" => SyncEventType::SyncCompleted,
        "sync_cancelled" => SyncEventType::SyncCancelled,
        "sync_cancel_requested" => SyncEventType::SyncCancelRequested,
        "sync_error" => SyncEventType::SyncError,
        "sync_info" => SyncEventType::SyncInfo,
        "message_parsed" => SyncEventType::MessageParsed,
        _ => SyncEventType::MessageSynced,
    }
}

/// Inserts a row and returns `(id, userId)`; the caller (the event bus)
/// uses this to update `latest[userId]` and broadcast.
pub async fn insert(
    pool: &PgPool,
    user_id: &UserId,
    connector_id: &IncomingConnectorId,
    event_type: SyncEventType,
    payload: serde_json::Value,
) -> Result<(SyncEventId, UserId)> {
    let row = sqlx::query(
        r#"
        INSERT INTO sync_events (user_id, incoming_connector_id, event_type, payload)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(&user_id.0)
    .bind(&connector_id.0)
    .bind(event_type_to_str(event_type))
    .bind(payload)
    .fetch_one(pool)
    .await?;

    let id: i64 = row.try_get("id")?;
    Ok((SyncEventId(id), user_id.clone()))
}

pub async fn list_since(pool: &PgPool, user_id: &UserId, since: i64, limit: u32) -> Result<Vec<SyncEvent>> {
    let since = clamp_since(since);
    let limit = clamp_limit(limit);

    let rows = sqlx::query(
        r#"
        SELECT id, user_id, incoming_connector_id, event_type, payload, created_at
        FROM sync_events
        WHERE user_id = $1 AND id > $2
        ORDER BY id ASC
        LIMIT $3
        "#,
    )
    .bind(&user_id.0)
    .bind(since)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(SyncEvent {
                id: SyncEventId(row.try_get("id")?),
                user_id: UserId(row.try_get("user_id")?),
                incoming_connector_id: IncomingConnectorId(row.try_get("incoming_connector_id")?),
                event_type: event_type_from_str(row.try_get::<String, _>("event_type")?.as_str()),
                payload: row.try_get("payload")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// Batched `DELETE … RETURNING id` loop (§4.D `pruneSyncEvents`). Stops
/// when a batch returns fewer than `batch_size` rows, or after
/// `max_batches`. Non-positive inputs clamp to the spec's safe defaults.
pub async fn prune_sync_events(
    pool: &PgPool,
    retention_days: i64,
    batch_size: i64,
    max_batches: u32,
) -> Result<u64> {
    let retention_days = if retention_days <= 0 { 14 } else { retention_days };
    let batch_size = if batch_size <= 0 { 2000 } else { batch_size };
    let max_batches = if max_batches == 0 { 50 } else { max_batches };

    let mut total_deleted: u64 = 0;
    for _ in 0..max_batches {
        let rows = sqlx::query(
            r#"
            DELETE FROM sync_events
            WHERE id IN (
                SELECT id FROM sync_events
                WHERE created_at < NOW() - ($1 || ' days')::interval
                ORDER BY id ASC
                LIMIT $2
            )
            RETURNING id
            "#,
        )
        .bind(retention_days)
        .bind(batch_size)
        .fetch_all(pool)
        .await?;

        let deleted = rows.len() as u64;
        total_deleted += deleted;
        if deleted < batch_size as u64 {
            break;
        }
    }
    Ok(total_deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_through_str() {
        for t in [
            SyncEventType::MessageSynced,
            SyncEventType::MessageUpdated,
            SyncEventType::SyncCompleted,
            SyncEventType::SyncCancelled,
            SyncEventType::SyncCancelRequested,
            SyncEventType::SyncError,
            SyncEventType::SyncInfo,
            SyncEventType::MessageParsed,
        ] {
            assert_eq!(event_type_from_str(event_type_to_str(t)), t);
        }
    }
}
