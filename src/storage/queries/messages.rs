//! Message/attachment persistence (§3 `Message`/`Attachment`, §4.G/§4.H
//! per-row upsert), grounded on the teacher's `storage/queries/emails.rs`
//! insert-or-update shape but keyed by the dual `(folder, uid)` /
//! `(folder, gmailMessageId)` uniqueness the spec requires instead of a
//! single primary key lookup.

use sqlx::{PgPool, Row};

use crate::domain::{
    Address, Attachment, AttachmentId, IncomingConnectorId, Message, MessageId, ScanStatus, UserId,
};
use crate::storage::Result;

fn scan_status_to_str(s: ScanStatus) -> &'static str {
    match s {
        ScanStatus::Pending => "pending",
        ScanStatus::Processing => "processing",
        ScanStatus::Clean => "clean",
        ScanStatus::Infected => "infected",
        ScanStatus::SizeSkipped => "size_skipped",
        ScanStatus::Disabled => "disabled",
        ScanStatus::Failed => "failed",
        ScanStatus::Missing => "missing",
        ScanStatus::Error => "error",
    }
}

fn scan_status_from_str(s: &str) -> ScanStatus {
    match s {
        "processing" => ScanStatus::Processing,
        "clean" => ScanStatus::Clean,
        "infected" => ScanStatus::Infected,
        "size_skipped" => ScanStatus::SizeSkipped,
        "disabled" => ScanStatus::Disabled,
        "failed" => ScanStatus::Failed,
        "missing" => ScanStatus::Missing,
        "error" => ScanStatus::Error,
        _ => ScanStatus::Pending,
    }
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<Message> {
    let uid: Option<i64> = row.try_get("uid")?;
    let mailbox_uid_validity: Option<i64> = row.try_get("mailbox_uid_validity")?;
    let from_header: serde_json::Value = row.try_get("from_header")?;
    let to_header: serde_json::Value = row.try_get("to_header")?;
    let flags: serde_json::Value = row.try_get("flags")?;
    let provider_meta: serde_json::Value = row.try_get("provider_meta")?;

    Ok(Message {
        id: MessageId(row.try_get("id")?),
        incoming_connector_id: IncomingConnectorId(row.try_get("incoming_connector_id")?),
        folder_path: row.try_get("folder_path")?,
        uid: uid.map(|u| u as u32),
        gmail_message_id: row.try_get("gmail_message_id")?,
        gmail_thread_id: row.try_get("gmail_thread_id")?,
        thread_id: row.try_get("thread_id")?,
        message_id: row.try_get("message_id")?,
        in_reply_to: row.try_get("in_reply_to")?,
        references_header: row.try_get("references_header")?,
        subject: row.try_get("subject")?,
        from_header: serde_json::from_value(from_header).unwrap_or(Address::new("")),
        to_header: serde_json::from_value(to_header).unwrap_or_default(),
        snippet: row.try_get("snippet")?,
        received_at: row.try_get("received_at")?,
        is_read: row.try_get("is_read")?,
        is_starred: row.try_get("is_starred")?,
        flags: serde_json::from_value(flags).unwrap_or_default(),
        mailbox_uid_validity: mailbox_uid_validity.map(|v| v as u32),
        raw_blob_key: row.try_get("raw_blob_key")?,
        body_text: row.try_get("body_text")?,
        body_html: row.try_get("body_html")?,
        provider_meta: serde_json::from_value(provider_meta).unwrap_or_default(),
    })
}

const SELECT_COLUMNS: &str = r#"
    id, incoming_connector_id, folder_path, uid, gmail_message_id, gmail_thread_id, thread_id,
    message_id, in_reply_to, references_header, subject, from_header, to_header, snippet,
    received_at, is_read, is_starred, flags, mailbox_uid_validity, raw_blob_key, body_text,
    body_html, provider_meta
"#;

/// Resolve by `(connector, folder, uid)` — the IMAP identity (§4.H).
pub async fn find_by_uid(
    pool: &PgPool,
    connector_id: &IncomingConnectorId,
    folder_path: &str,
    uid: u32,
) -> Result<Option<Message>> {
    let query = format!(
        "SELECT {SELECT_COLUMNS} FROM messages WHERE incoming_connector_id = $1 AND folder_path = $2 AND uid = $3"
    );
    let row = sqlx::query(&query)
        .bind(&connector_id.0)
        .bind(folder_path)
        .bind(i64::from(uid))
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else { return Ok(None) };
    row_to_message(&row).map(Some)
}

/// Resolve by `(connector, folder, gmailMessageId)`, then fall back to
/// `(connector, folder, messageId)` with a null `gmailMessageId` so the
/// Gmail driver can backfill it on first sight of a row created over IMAP
/// for a Gmail-over-IMAP connector (§4.G step 3).
pub async fn find_by_gmail_message_id(
    pool: &PgPool,
    connector_id: &IncomingConnectorId,
    folder_path: &str,
    gmail_message_id: &str,
    fallback_message_id: &str,
) -> Result<Option<Message>> {
    let by_gmail_id = format!(
        "SELECT {SELECT_COLUMNS} FROM messages WHERE incoming_connector_id = $1 AND folder_path = $2 AND gmail_message_id = $3"
    );
    let row = sqlx::query(&by_gmail_id)
        .bind(&connector_id.0)
        .bind(folder_path)
        .bind(gmail_message_id)
        .fetch_optional(pool)
        .await?;
    if let Some(row) = row {
        return row_to_message(&row).map(Some);
    }

    let by_message_id = format!(
        "SELECT {SELECT_COLUMNS} FROM messages WHERE incoming_connector_id = $1 AND folder_path = $2 AND gmail_message_id IS NULL AND message_id = $3"
    );
    let row = sqlx::query(&by_message_id)
        .bind(&connector_id.0)
        .bind(folder_path)
        .bind(fallback_message_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else { return Ok(None) };
    row_to_message(&row).map(Some)
}

/// Looks up a message by its RFC-822 `Message-ID` header, irrespective of
/// connector. Used by the send pipeline's thread-resolution step (§4.K) to
/// find the Gmail `threadId` a reply belongs to.
pub async fn find_by_message_id(pool: &PgPool, message_id: &str) -> Result<Option<Message>> {
    let query = format!("SELECT {SELECT_COLUMNS} FROM messages WHERE message_id = $1 LIMIT 1");
    let row = sqlx::query(&query).bind(message_id).fetch_optional(pool).await?;
    let Some(row) = row else { return Ok(None) };
    row_to_message(&row).map(Some)
}

const JOINED_SELECT_COLUMNS: &str = r#"
    m.id, m.incoming_connector_id, m.folder_path, m.uid, m.gmail_message_id, m.gmail_thread_id,
    m.thread_id, m.message_id, m.in_reply_to, m.references_header, m.subject, m.from_header,
    m.to_header, m.snippet, m.received_at, m.is_read, m.is_starred, m.flags,
    m.mailbox_uid_validity, m.raw_blob_key, m.body_text, m.body_html, m.provider_meta
"#;

/// §4.J step 1: ownership verification joins the message row to an
/// incoming connector owned by `user_id`. `None` covers both "no such
/// message" and "not yours" so callers can report a uniform "not found".
pub async fn find_by_id_owned_by_user(
    pool: &PgPool,
    id: &MessageId,
    user_id: &UserId,
) -> Result<Option<Message>> {
    let query = format!(
        "SELECT {JOINED_SELECT_COLUMNS} FROM messages m \
         JOIN incoming_connectors c ON c.id = m.incoming_connector_id \
         WHERE m.id = $1 AND c.user_id = $2"
    );
    let row = sqlx::query(&query).bind(&id.0).bind(&user_id.0).fetch_optional(pool).await?;
    let Some(row) = row else { return Ok(None) };
    row_to_message(&row).map(Some)
}

/// §4.J `applyThreadMessageActions`: every message sharing `thread_id`
/// that belongs to a connector owned by `user_id`.
pub async fn find_thread_owned_by_user(
    pool: &PgPool,
    thread_id: &str,
    user_id: &UserId,
) -> Result<Vec<Message>> {
    let query = format!(
        "SELECT {JOINED_SELECT_COLUMNS} FROM messages m \
         JOIN incoming_connectors c ON c.id = m.incoming_connector_id \
         WHERE m.thread_id = $1 AND c.user_id = $2 ORDER BY m.received_at ASC"
    );
    let rows = sqlx::query(&query).bind(thread_id).bind(&user_id.0).fetch_all(pool).await?;
    rows.iter().map(row_to_message).collect()
}

pub async fn insert(pool: &PgPool, message: &Message) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO messages
            (id, incoming_connector_id, folder_path, folder_path_norm, uid, gmail_message_id,
             gmail_thread_id, thread_id, message_id, in_reply_to, references_header, subject,
             from_header, to_header, snippet, received_at, is_read, is_starred, flags,
             mailbox_uid_validity, raw_blob_key, body_text, body_html, provider_meta)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23)
        "#,
    )
    .bind(&message.id.0)
    .bind(&message.incoming_connector_id.0)
    .bind(&message.folder_path)
    .bind(message.folder_path.to_uppercase())
    .bind(message.uid.map(i64::from))
    .bind(&message.gmail_message_id)
    .bind(&message.gmail_thread_id)
    .bind(&message.thread_id)
    .bind(&message.message_id)
    .bind(&message.in_reply_to)
    .bind(&message.references_header)
    .bind(&message.subject)
    .bind(serde_json::to_value(&message.from_header).unwrap_or_default())
    .bind(serde_json::to_value(&message.to_header).unwrap_or_default())
    .bind(&message.snippet)
    .bind(message.received_at)
    .bind(message.is_read)
    .bind(message.is_starred)
    .bind(serde_json::to_value(&message.flags).unwrap_or_default())
    .bind(message.mailbox_uid_validity.map(i64::from))
    .bind(&message.raw_blob_key)
    .bind(&message.body_text)
    .bind(&message.body_html)
    .bind(serde_json::to_value(&message.provider_meta).unwrap_or_default())
    .execute(pool)
    .await?;
    Ok(())
}

/// Metadata-only update (§4.G step 5 / §4.H MODSEQ path): leaves body/raw
/// untouched so a later hydrate pass can fill them in without clobbering
/// an in-flight parse.
pub async fn update_metadata(pool: &PgPool, message: &Message) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE messages SET
            gmail_thread_id = $2, thread_id = $3, subject = $4, from_header = $5, to_header = $6,
            snippet = $7, received_at = $8, is_read = $9, is_starred = $10, flags = $11,
            in_reply_to = $12, references_header = $13, provider_meta = $14
        WHERE id = $1
        "#,
    )
    .bind(&message.id.0)
    .bind(&message.gmail_thread_id)
    .bind(&message.thread_id)
    .bind(&message.subject)
    .bind(serde_json::to_value(&message.from_header).unwrap_or_default())
    .bind(serde_json::to_value(&message.to_header).unwrap_or_default())
    .bind(&message.snippet)
    .bind(message.received_at)
    .bind(message.is_read)
    .bind(message.is_starred)
    .bind(serde_json::to_value(&message.flags).unwrap_or_default())
    .bind(&message.in_reply_to)
    .bind(&message.references_header)
    .bind(serde_json::to_value(&message.provider_meta).unwrap_or_default())
    .execute(pool)
    .await?;
    Ok(())
}

/// Create-vs-rehydrate (§4.H): a new row is inserted without a blob key,
/// then this sets it once the upload succeeds. If the upload fails, the
/// row keeps a null key so the next pass retries.
pub async fn set_raw_blob_key(pool: &PgPool, id: &MessageId, blob_key: &str) -> Result<()> {
    sqlx::query("UPDATE messages SET raw_blob_key = $1 WHERE id = $2")
        .bind(blob_key)
        .bind(&id.0)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_parsed_body(
    pool: &PgPool,
    id: &MessageId,
    body_text: Option<&str>,
    body_html: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE messages SET body_text = $1, body_html = $2 WHERE id = $3")
        .bind(body_text)
        .bind(body_html)
        .bind(&id.0)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_thread_id(pool: &PgPool, id: &MessageId, thread_id: &str) -> Result<()> {
    sqlx::query("UPDATE messages SET thread_id = $1 WHERE id = $2")
        .bind(thread_id)
        .bind(&id.0)
        .execute(pool)
        .await?;
    Ok(())
}

/// §4.J: flags + folder updates used by the action executor's optimistic
/// local update / rollback pair.
pub async fn set_read_state(pool: &PgPool, id: &MessageId, is_read: bool) -> Result<()> {
    sqlx::query("UPDATE messages SET is_read = $1 WHERE id = $2")
        .bind(is_read)
        .bind(&id.0)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_starred_state(pool: &PgPool, id: &MessageId, is_starred: bool) -> Result<()> {
    sqlx::query("UPDATE messages SET is_starred = $1 WHERE id = $2")
        .bind(is_starred)
        .bind(&id.0)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_folder_path(pool: &PgPool, id: &MessageId, folder_path: &str) -> Result<()> {
    sqlx::query("UPDATE messages SET folder_path = $1, folder_path_norm = $2 WHERE id = $3")
        .bind(folder_path)
        .bind(folder_path.to_uppercase())
        .bind(&id.0)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_flags(pool: &PgPool, id: &MessageId, flags: &[String]) -> Result<()> {
    sqlx::query("UPDATE messages SET flags = $1 WHERE id = $2")
        .bind(serde_json::to_value(flags).unwrap_or_default())
        .bind(&id.0)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete(pool: &PgPool, id: &MessageId) -> Result<()> {
    sqlx::query("DELETE FROM messages WHERE id = $1")
        .bind(&id.0)
        .execute(pool)
        .await?;
    Ok(())
}

/// §4.G full reconcile: delete local rows in `folder_path` whose
/// `gmail_message_id` is absent from `seen_ids`, returning deleted ids so
/// callers can best-effort drop blobs.
pub async fn delete_gmail_rows_not_in(
    pool: &PgPool,
    connector_id: &IncomingConnectorId,
    folder_path: &str,
    seen_ids: &[String],
) -> Result<Vec<MessageId>> {
    let rows = sqlx::query(
        r#"
        DELETE FROM messages
        WHERE incoming_connector_id = $1 AND folder_path = $2
          AND gmail_message_id IS NOT NULL AND NOT (gmail_message_id = ANY($3))
        RETURNING id
        "#,
    )
    .bind(&connector_id.0)
    .bind(folder_path)
    .bind(seen_ids)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .filter_map(|r| r.try_get::<String, _>("id").ok())
        .map(MessageId)
        .collect())
}

/// §4.H full reconcile: same idea keyed by UID instead of Gmail message id.
pub async fn delete_imap_rows_not_in(
    pool: &PgPool,
    connector_id: &IncomingConnectorId,
    folder_path: &str,
    seen_uids: &[i64],
) -> Result<Vec<MessageId>> {
    let rows = sqlx::query(
        r#"
        DELETE FROM messages
        WHERE incoming_connector_id = $1 AND folder_path = $2
          AND uid IS NOT NULL AND NOT (uid = ANY($3))
        RETURNING id
        "#,
    )
    .bind(&connector_id.0)
    .bind(folder_path)
    .bind(seen_uids)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .filter_map(|r| r.try_get::<String, _>("id").ok())
        .map(MessageId)
        .collect())
}

pub async fn purge_folder(pool: &PgPool, connector_id: &IncomingConnectorId, folder_path: &str) -> Result<()> {
    sqlx::query("DELETE FROM messages WHERE incoming_connector_id = $1 AND folder_path = $2")
        .bind(&connector_id.0)
        .bind(folder_path)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_in_folder(pool: &PgPool, connector_id: &IncomingConnectorId, folder_path: &str) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE incoming_connector_id = $1 AND folder_path = $2")
        .bind(&connector_id.0)
        .bind(folder_path)
        .fetch_one(pool)
        .await?;
    Ok(row.try_get("n")?)
}

/// §4.G background hydration: rows in `mailbox` lacking body or raw.
pub async fn find_missing_body_or_raw(
    pool: &PgPool,
    connector_id: &IncomingConnectorId,
    folder_path: &str,
    batch_size: u32,
) -> Result<Vec<Message>> {
    let query = format!(
        "SELECT {SELECT_COLUMNS} FROM messages WHERE incoming_connector_id = $1 AND folder_path = $2 AND (raw_blob_key IS NULL OR (body_text IS NULL AND body_html IS NULL)) ORDER BY received_at ASC LIMIT $3"
    );
    let rows = sqlx::query(&query)
        .bind(&connector_id.0)
        .bind(folder_path)
        .bind(i64::from(batch_size))
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_message).collect()
}

// --- Attachments ---

pub async fn replace_attachments(pool: &PgPool, message_id: &MessageId, attachments: &[Attachment]) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM attachments WHERE message_id = $1")
        .bind(&message_id.0)
        .execute(&mut *tx)
        .await?;
    for att in attachments {
        sqlx::query(
            r#"
            INSERT INTO attachments
                (id, message_id, filename, content_type, size_bytes, inline, content_id,
                 blob_key, scan_status, scan_result)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            "#,
        )
        .bind(&att.id.0)
        .bind(&message_id.0)
        .bind(&att.filename)
        .bind(&att.content_type)
        .bind(att.size_bytes as i64)
        .bind(att.inline)
        .bind(&att.content_id)
        .bind(&att.blob_key)
        .bind(scan_status_to_str(att.scan_status))
        .bind(&att.scan_result)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn list_attachments(pool: &PgPool, message_id: &MessageId) -> Result<Vec<Attachment>> {
    let rows = sqlx::query(
        r#"
        SELECT id, message_id, filename, content_type, size_bytes, inline, content_id,
               blob_key, scan_status, scan_result
        FROM attachments WHERE message_id = $1
        "#,
    )
    .bind(&message_id.0)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(Attachment {
                id: AttachmentId(row.try_get("id")?),
                message_id: MessageId(row.try_get("message_id")?),
                filename: row.try_get("filename")?,
                content_type: row.try_get("content_type")?,
                size_bytes: row.try_get::<i64, _>("size_bytes")? as u64,
                inline: row.try_get("inline")?,
                content_id: row.try_get("content_id")?,
                blob_key: row.try_get("blob_key")?,
                scan_status: scan_status_from_str(row.try_get::<String, _>("scan_status")?.as_str()),
                scan_result: row.try_get("scan_result")?,
            })
        })
        .collect()
}

pub async fn set_attachment_scan_status(
    pool: &PgPool,
    id: &AttachmentId,
    status: ScanStatus,
    result: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE attachments SET scan_status = $1, scan_result = $2 WHERE id = $3")
        .bind(scan_status_to_str(status))
        .bind(result)
        .bind(&id.0)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_status_round_trips_through_str() {
        for s in [
            ScanStatus::Pending,
            ScanStatus::Processing,
            ScanStatus::Clean,
            ScanStatus::Infected,
            ScanStatus::SizeSkipped,
            ScanStatus::Disabled,
            ScanStatus::Failed,
            ScanStatus::Missing,
            ScanStatus::Error,
        ] {
            assert_eq!(scan_status_from_str(scan_status_to_str(s)), s);
        }
    }
}
