//! Browser push subscription CRUD (§3 `PushSubscription`).

use sqlx::{PgPool, Row};

use crate::domain::{PushSubscription, UserId};
use crate::storage::{Result, StorageError};

#[derive(Debug)]
pub enum InsertOutcome {
    Inserted,
    /// `endpoint` already registered to a different user (§3: unique,
    /// second user on the same endpoint → conflict).
    Conflict,
}

pub async fn insert(pool: &PgPool, sub: &PushSubscription) -> Result<InsertOutcome> {
    let existing: Option<String> = sqlx::query("SELECT user_id FROM push_subscriptions WHERE endpoint = $1")
        .bind(&sub.endpoint)
        .fetch_optional(pool)
        .await?
        .map(|row| row.try_get("user_id"))
        .transpose()
        .map_err(StorageError::from)?;

    if let Some(owner) = existing {
        if owner != sub.user_id.0 {
            return Ok(InsertOutcome::Conflict);
        }
        sqlx::query("UPDATE push_subscriptions SET p256dh = $1, auth = $2, user_agent = $3 WHERE endpoint = $4")
            .bind(&sub.p256dh)
            .bind(&sub.auth)
            .bind(&sub.user_agent)
            .bind(&sub.endpoint)
            .execute(pool)
            .await?;
        return Ok(InsertOutcome::Inserted);
    }

    sqlx::query(
        r#"
        INSERT INTO push_subscriptions (user_id, endpoint, p256dh, auth, user_agent)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(&sub.user_id.0)
    .bind(&sub.endpoint)
    .bind(&sub.p256dh)
    .bind(&sub.auth)
    .bind(&sub.user_agent)
    .execute(pool)
    .await?;
    Ok(InsertOutcome::Inserted)
}

pub async fn list_for_user(pool: &PgPool, user_id: &UserId) -> Result<Vec<PushSubscription>> {
    let rows = sqlx::query("SELECT user_id, endpoint, p256dh, auth, user_agent FROM push_subscriptions WHERE user_id = $1")
        .bind(&user_id.0)
        .fetch_all(pool)
        .await?;

    rows.into_iter()
        .map(|row| {
            Ok(PushSubscription {
                user_id: UserId(row.try_get("user_id")?),
                endpoint: row.try_get("endpoint")?,
                p256dh: row.try_get("p256dh")?,
                auth: row.try_get("auth")?,
                user_agent: row.try_get("user_agent")?,
            })
        })
        .collect()
}

pub async fn delete(pool: &PgPool, endpoint: &str) -> Result<()> {
    sqlx::query("DELETE FROM push_subscriptions WHERE endpoint = $1")
        .bind(endpoint)
        .execute(pool)
        .await?;
    Ok(())
}
