//! Sending identity CRUD (§3 `Identity`).

use sqlx::{PgPool, Row};

use crate::domain::{Identity, IdentityId, IncomingConnectorId, OutgoingConnectorId, UserId};
use crate::storage::Result;

pub async fn insert(pool: &PgPool, identity: &Identity) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO identities
            (id, user_id, display_name, email_address, signature, reply_to,
             outgoing_connector_id, sent_to_incoming_connector_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&identity.id.0)
    .bind(&identity.user_id.0)
    .bind(&identity.display_name)
    .bind(&identity.email_address)
    .bind(&identity.signature)
    .bind(&identity.reply_to)
    .bind(&identity.outgoing_connector_id.0)
    .bind(identity.sent_to_incoming_connector_id.as_ref().map(|id| &id.0))
    .execute(pool)
    .await?;
    Ok(())
}

fn row_to_identity(row: &sqlx::postgres::PgRow) -> Result<Identity> {
    let sent_to: Option<String> = row.try_get("sent_to_incoming_connector_id")?;
    Ok(Identity {
        id: IdentityId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        display_name: row.try_get("display_name")?,
        email_address: row.try_get("email_address")?,
        signature: row.try_get("signature")?,
        reply_to: row.try_get("reply_to")?,
        outgoing_connector_id: OutgoingConnectorId(row.try_get("outgoing_connector_id")?),
        sent_to_incoming_connector_id: sent_to.map(IncomingConnectorId),
    })
}

pub async fn get(pool: &PgPool, id: &IdentityId) -> Result<Option<Identity>> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, display_name, email_address, signature, reply_to,
               outgoing_connector_id, sent_to_incoming_connector_id
        FROM identities WHERE id = $1
        "#,
    )
    .bind(&id.0)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };
    row_to_identity(&row).map(Some)
}

/// Enforces the "same user" rule §4.K step 1 by filtering in the WHERE
/// clause rather than trusting the caller to check afterwards.
pub async fn get_owned_by_user(pool: &PgPool, id: &IdentityId, user_id: &UserId) -> Result<Option<Identity>> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, display_name, email_address, signature, reply_to,
               outgoing_connector_id, sent_to_incoming_connector_id
        FROM identities WHERE id = $1 AND user_id = $2
        "#,
    )
    .bind(&id.0)
    .bind(&user_id.0)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };
    row_to_identity(&row).map(Some)
}

pub async fn list_for_user(pool: &PgPool, user_id: &UserId) -> Result<Vec<Identity>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, display_name, email_address, signature, reply_to,
               outgoing_connector_id, sent_to_incoming_connector_id
        FROM identities WHERE user_id = $1
        "#,
    )
    .bind(&user_id.0)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_identity).collect()
}
