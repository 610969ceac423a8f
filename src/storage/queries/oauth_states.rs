//! OAuth authorize/callback correlation state (§3 `OAuthState`): insert
//! at authorize, single-shot delete-returning on callback, fails closed
//! on storage error per the spec's lifecycle note.

use sqlx::{PgPool, Row};

use crate::domain::{ConnectorType, IncomingConnectorId, OAuthState, OAuthStateId, UserId};
use crate::storage::Result;

fn connector_type_to_str(t: ConnectorType) -> &'static str {
    match t {
        ConnectorType::Incoming => "incoming",
        ConnectorType::Outgoing => "outgoing",
    }
}

fn connector_type_from_str(s: &str) -> ConnectorType {
    match s {
        "outgoing" => ConnectorType::Outgoing,
        _ => ConnectorType::Incoming,
    }
}

pub async fn insert(pool: &PgPool, state: &OAuthState) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO oauth_states (state, user_id, connector_type, connector_id, connector_payload, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&state.state.0)
    .bind(&state.user_id.0)
    .bind(connector_type_to_str(state.connector_type))
    .bind(state.connector_id.as_ref().map(|id| &id.0))
    .bind(&state.connector_payload)
    .bind(state.expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Single-shot delete-returning: the row is consumed exactly once by the
/// callback, regardless of whether it has expired (the caller checks
/// `expires_at` itself and treats an expired row as not-found).
pub async fn take(pool: &PgPool, state: &OAuthStateId) -> Result<Option<OAuthState>> {
    let row = sqlx::query(
        r#"
        DELETE FROM oauth_states WHERE state = $1
        RETURNING state, user_id, connector_type, connector_id, connector_payload, expires_at
        "#,
    )
    .bind(&state.0)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };
    let connector_id: Option<String> = row.try_get("connector_id")?;

    Ok(Some(OAuthState {
        state: OAuthStateId(row.try_get("state")?),
        user_id: UserId(row.try_get("user_id")?),
        connector_type: connector_type_from_str(row.try_get::<String, _>("connector_type")?.as_str()),
        connector_id: connector_id.map(IncomingConnectorId),
        connector_payload: row.try_get("connector_payload")?,
        expires_at: row.try_get("expires_at")?,
    }))
}

pub async fn delete_expired(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM oauth_states WHERE expires_at < NOW()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
