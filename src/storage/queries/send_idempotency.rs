//! Send idempotency ledger persistence (§4.L): `getOrCreate`, the
//! `pending|failed|stale-processing → processing` CAS claim, and the
//! terminal `succeeded`/`failed` writes.

use chrono::{Duration, Utc};
use sqlx::{PgPool, Row};

use crate::domain::{IdentityId, SendIdempotencyKey, SendResult, SendStatus, UserId};
use crate::storage::Result;

fn status_to_str(s: SendStatus) -> &'static str {
    match s {
        SendStatus::Pending => "pending",
        SendStatus::Processing => "processing",
        SendStatus::Succeeded => "succeeded",
        SendStatus::Failed => "failed",
    }
}

fn status_from_str(s: &str) -> SendStatus {
    match s {
        "processing" => SendStatus::Processing,
        "succeeded" => SendStatus::Succeeded,
        "failed" => SendStatus::Failed,
        _ => SendStatus::Pending,
    }
}

pub enum GetOrCreateOutcome {
    Created,
    /// Existing row matched on `(userId, idempotencyKey, identityId, requestHash)`.
    Existing { status: SendStatus, result: Option<SendResult> },
    /// Same key, different identity: reject per §3 invariant.
    IdentityMismatch,
    /// Same key + identity, different request hash: reject per §3 invariant.
    RequestHashMismatch,
}

/// `getOrCreate` (§4.L): `INSERT … ON CONFLICT DO NOTHING` with a 24 h TTL,
/// then re-read to classify identity/hash mismatches against an existing row.
pub async fn get_or_create(
    pool: &PgPool,
    user_id: &UserId,
    idempotency_key: &SendIdempotencyKey,
    identity_id: &IdentityId,
    request_hash: &str,
) -> Result<GetOrCreateOutcome> {
    let expires_at = Utc::now() + Duration::hours(24);

    let insert_result = sqlx::query(
        r#"
        INSERT INTO send_idempotency
            (user_id, idempotency_key, identity_id, request_hash, status, attempts, expires_at)
        VALUES ($1, $2, $3, $4, 'pending', 0, $5)
        ON CONFLICT (user_id, idempotency_key) DO NOTHING
        "#,
    )
    .bind(&user_id.0)
    .bind(&idempotency_key.0)
    .bind(&identity_id.0)
    .bind(request_hash)
    .bind(expires_at)
    .execute(pool)
    .await?;

    if insert_result.rows_affected() > 0 {
        return Ok(GetOrCreateOutcome::Created);
    }

    let row = sqlx::query(
        r#"
        SELECT identity_id, request_hash, status, result
        FROM send_idempotency WHERE user_id = $1 AND idempotency_key = $2
        "#,
    )
    .bind(&user_id.0)
    .bind(&idempotency_key.0)
    .fetch_one(pool)
    .await?;

    let existing_identity: String = row.try_get("identity_id")?;
    if existing_identity != identity_id.0 {
        return Ok(GetOrCreateOutcome::IdentityMismatch);
    }
    let existing_hash: String = row.try_get("request_hash")?;
    if existing_hash != request_hash {
        return Ok(GetOrCreateOutcome::RequestHashMismatch);
    }

    let status = status_from_str(row.try_get::<String, _>("status")?.as_str());
    let result_json: Option<serde_json::Value> = row.try_get("result")?;
    let result = result_json.and_then(|v| serde_json::from_value(v).ok());

    Ok(GetOrCreateOutcome::Existing { status, result })
}

/// The CAS claim statement given verbatim in §4.L: moves `pending`,
/// `failed`, or a `processing` row stale by more than 30s into
/// `processing`, bumping `attempts`. Returns true iff claimed.
pub async fn claim_processing(
    pool: &PgPool,
    user_id: &UserId,
    idempotency_key: &SendIdempotencyKey,
    identity_id: &IdentityId,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE send_idempotency
        SET status = 'processing', updated_at = NOW(), error_message = NULL, attempts = attempts + 1
        WHERE user_id = $1 AND idempotency_key = $2 AND identity_id = $3
          AND ( status = 'pending' OR status = 'failed'
                OR (status = 'processing' AND updated_at < NOW() - interval '30 seconds') )
          AND expires_at > NOW()
        "#,
    )
    .bind(&user_id.0)
    .bind(&idempotency_key.0)
    .bind(&identity_id.0)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn finalize_success(
    pool: &PgPool,
    user_id: &UserId,
    idempotency_key: &SendIdempotencyKey,
    result: &SendResult,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE send_idempotency
        SET status = 'succeeded', result = $3, error_message = NULL, updated_at = NOW()
        WHERE user_id = $1 AND idempotency_key = $2
        "#,
    )
    .bind(&user_id.0)
    .bind(&idempotency_key.0)
    .bind(serde_json::to_value(result).unwrap_or_default())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn finalize_failure(
    pool: &PgPool,
    user_id: &UserId,
    idempotency_key: &SendIdempotencyKey,
    error_message: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE send_idempotency
        SET status = 'failed', error_message = $3, updated_at = NOW()
        WHERE user_id = $1 AND idempotency_key = $2
        "#,
    )
    .bind(&user_id.0)
    .bind(&idempotency_key.0)
    .bind(error_message)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            SendStatus::Pending,
            SendStatus::Processing,
            SendStatus::Succeeded,
            SendStatus::Failed,
        ] {
            assert_eq!(status_from_str(status_to_str(s)), s);
        }
    }
}
