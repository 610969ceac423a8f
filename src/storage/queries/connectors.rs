//! Incoming/outgoing connector CRUD, grounded on the teacher's
//! `storage/queries/accounts.rs` insert/get_by_id shape, generalized to
//! the split incoming/outgoing connector entities and a tagged
//! `AuthConfig`.

use sqlx::{PgPool, Row};

use crate::domain::{
    AuthConfig, ConnectorStatus, IncomingConnector, IncomingConnectorId, IncomingProvider,
    OutgoingConnector, OutgoingConnectorId, OutgoingProvider, SyncSettings, TlsMode, UserId,
};
use crate::storage::{Result, StorageError};

fn provider_to_str(p: IncomingProvider) -> &'static str {
    match p {
        IncomingProvider::Imap => "imap",
        IncomingProvider::Gmail => "gmail",
    }
}

fn provider_from_str(s: &str) -> IncomingProvider {
    match s {
        "gmail" => IncomingProvider::Gmail,
        _ => IncomingProvider::Imap,
    }
}

fn status_to_str(s: ConnectorStatus) -> &'static str {
    match s {
        ConnectorStatus::Active => "active",
        ConnectorStatus::Disabled => "disabled",
        ConnectorStatus::NeedsReconnect => "needs_reconnect",
    }
}

fn status_from_str(s: &str) -> ConnectorStatus {
    match s {
        "disabled" => ConnectorStatus::Disabled,
        "needs_reconnect" => ConnectorStatus::NeedsReconnect,
        _ => ConnectorStatus::Active,
    }
}

pub async fn insert_incoming(pool: &PgPool, connector: &IncomingConnector) -> Result<()> {
    let auth_json = serde_json::to_value(&connector.auth_config).unwrap_or_default();
    let settings_json = serde_json::to_value(&connector.sync_settings).unwrap_or_default();

    sqlx::query(
        r#"
        INSERT INTO incoming_connectors
            (id, user_id, provider, host, port, tls, email_address, auth_config, sync_settings, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&connector.id.0)
    .bind(&connector.user_id.0)
    .bind(provider_to_str(connector.provider))
    .bind(&connector.host)
    .bind(connector.port.map(i32::from))
    .bind(connector.tls)
    .bind(&connector.email_address)
    .bind(auth_json)
    .bind(settings_json)
    .bind(status_to_str(connector.status))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_incoming(pool: &PgPool, id: &IncomingConnectorId) -> Result<Option<IncomingConnector>> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, provider, host, port, tls, email_address, auth_config, sync_settings, status
        FROM incoming_connectors WHERE id = $1
        "#,
    )
    .bind(&id.0)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };
    row_to_incoming(&row).map(Some)
}

fn row_to_incoming(row: &sqlx::postgres::PgRow) -> Result<IncomingConnector> {
    let auth_config: AuthConfig = serde_json::from_value(row.try_get("auth_config")?)
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    let sync_settings: SyncSettings = serde_json::from_value(row.try_get("sync_settings")?)
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    let port: Option<i32> = row.try_get("port")?;

    Ok(IncomingConnector {
        id: IncomingConnectorId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        provider: provider_from_str(row.try_get("provider")?),
        host: row.try_get("host")?,
        port: port.map(|p| p as u16),
        tls: row.try_get("tls")?,
        email_address: row.try_get("email_address")?,
        auth_config,
        sync_settings,
        status: status_from_str(row.try_get::<String, _>("status")?.as_str()),
    })
}

/// Persists a refreshed/revoked `auth_config` (§4.B): only writes on
/// changed fields, enforced by the caller comparing before calling this.
pub async fn update_incoming_auth_config(
    pool: &PgPool,
    id: &IncomingConnectorId,
    auth_config: &AuthConfig,
) -> Result<()> {
    let auth_json = serde_json::to_value(auth_config).unwrap_or_default();
    sqlx::query("UPDATE incoming_connectors SET auth_config = $1, updated_at = now() WHERE id = $2")
        .bind(auth_json)
        .bind(&id.0)
        .execute(pool)
        .await?;
    Ok(())
}

/// Persists a refreshed/revoked `auth_config` on an outgoing connector
/// (§4.K point 4: SMTP+XOAUTH2 obtains a token the same way incoming sync
/// does and must rotate it the same way).
pub async fn update_outgoing_auth_config(pool: &PgPool, id: &OutgoingConnectorId, auth_config: &AuthConfig) -> Result<()> {
    let auth_json = serde_json::to_value(auth_config).unwrap_or_default();
    sqlx::query("UPDATE outgoing_connectors SET auth_config = $1, updated_at = now() WHERE id = $2")
        .bind(auth_json)
        .bind(&id.0)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_active_incoming_for_user(pool: &PgPool, user_id: &UserId) -> Result<Vec<IncomingConnector>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, provider, host, port, tls, email_address, auth_config, sync_settings, status
        FROM incoming_connectors WHERE user_id = $1 AND status = 'active'
        "#,
    )
    .bind(&user_id.0)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_incoming).collect()
}

/// All active connectors across every user, for `resumeConfiguredIdleWatches`
/// at process startup (§4.I) — unlike `list_active_incoming_for_user`, this
/// isn't scoped to a single caller's account.
pub async fn list_all_active_incoming(pool: &PgPool) -> Result<Vec<IncomingConnector>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, provider, host, port, tls, email_address, auth_config, sync_settings, status
        FROM incoming_connectors WHERE status = 'active'
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_incoming).collect()
}

/// Transactional delete with all dependent rows (§3, §5): oauth states,
/// messages/attachments (cascade), sync states, then the connector itself.
pub async fn delete_incoming_connector(pool: &PgPool, id: &IncomingConnectorId) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM oauth_states WHERE connector_id = $1")
        .bind(&id.0)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM messages WHERE incoming_connector_id = $1")
        .bind(&id.0)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM sync_states WHERE incoming_connector_id = $1")
        .bind(&id.0)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM incoming_connectors WHERE id = $1")
        .bind(&id.0)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

fn out_provider_to_str(p: OutgoingProvider) -> &'static str {
    match p {
        OutgoingProvider::Smtp => "smtp",
        OutgoingProvider::Gmail => "gmail",
    }
}

fn out_provider_from_str(s: &str) -> OutgoingProvider {
    match s {
        "gmail" => OutgoingProvider::Gmail,
        _ => OutgoingProvider::Smtp,
    }
}

fn tls_mode_to_str(m: TlsMode) -> &'static str {
    match m {
        TlsMode::Ssl => "ssl",
        TlsMode::Starttls => "starttls",
        TlsMode::None => "none",
    }
}

fn tls_mode_from_str(s: &str) -> TlsMode {
    match s {
        "ssl" => TlsMode::Ssl,
        "none" => TlsMode::None,
        _ => TlsMode::Starttls,
    }
}

pub async fn get_outgoing(pool: &PgPool, id: &OutgoingConnectorId) -> Result<Option<OutgoingConnector>> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, provider, host, port, tls_mode, from_address, auth_config,
               from_envelope_defaults, sent_copy_behavior
        FROM outgoing_connectors WHERE id = $1
        "#,
    )
    .bind(&id.0)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };

    let auth_config: AuthConfig = serde_json::from_value(row.try_get("auth_config")?)
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    let from_defaults = serde_json::from_value(row.try_get("from_envelope_defaults")?)
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    let sent_copy = serde_json::from_value(row.try_get("sent_copy_behavior")?)
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    let port: Option<i32> = row.try_get("port")?;

    Ok(Some(OutgoingConnector {
        id: OutgoingConnectorId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        provider: out_provider_from_str(row.try_get("provider")?),
        host: row.try_get("host")?,
        port: port.map(|p| p as u16),
        tls_mode: tls_mode_from_str(row.try_get::<String, _>("tls_mode")?.as_str()),
        from_address: row.try_get("from_address")?,
        auth_config,
        from_envelope_defaults: from_defaults,
        sent_copy_behavior: sent_copy,
    }))
}

pub async fn insert_outgoing(pool: &PgPool, connector: &OutgoingConnector) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO outgoing_connectors
            (id, user_id, provider, host, port, tls_mode, from_address, auth_config,
             from_envelope_defaults, sent_copy_behavior)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&connector.id.0)
    .bind(&connector.user_id.0)
    .bind(out_provider_to_str(connector.provider))
    .bind(&connector.host)
    .bind(connector.port.map(i32::from))
    .bind(tls_mode_to_str(connector.tls_mode))
    .bind(&connector.from_address)
    .bind(serde_json::to_value(&connector.auth_config).unwrap_or_default())
    .bind(serde_json::to_value(&connector.from_envelope_defaults).unwrap_or_default())
    .bind(serde_json::to_value(&connector.sent_copy_behavior).unwrap_or_default())
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_round_trips_through_str() {
        for p in [IncomingProvider::Imap, IncomingProvider::Gmail] {
            assert_eq!(provider_from_str(provider_to_str(p)), p);
        }
    }

    #[test]
    fn tls_mode_round_trips_through_str() {
        for m in [TlsMode::Ssl, TlsMode::Starttls, TlsMode::None] {
            assert_eq!(tls_mode_from_str(tls_mode_to_str(m)), m);
        }
    }
}
