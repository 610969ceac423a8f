//! IMAP sync driver (§4.H), grounded on `gmail::sync::run_gmail_mailbox_sync`
//! for the claim/heartbeat/cancellation/event-emission skeleton and on the
//! teacher's `providers/email/imap.rs` for the raw IMAP command shapes,
//! generalized from the teacher's single always-`ALL`-search pass into the
//! spec's UIDVALIDITY-reset / MODSEQ-incremental / tail-window / full-reconcile
//! branches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::collaborators::{BlobStore, MessageParser, ThreadingCollaborator};
use crate::config::IntervalSettings;
use crate::domain::{
    Address, AuthConfig, IncomingConnector, IncomingConnectorId, Message, MessageId, ProviderMeta,
    SyncEventType, SyncProgress, SyncState, SyncStatePatch, SyncStatus,
};
use crate::error::{ServiceError, SyncOutcome};
use crate::events::EventBus;
use crate::gmail::path::{normalize_gmail_mailbox_path, MailboxDirectory};
use crate::imap::client::{login_password, login_xoauth2, FetchedMessage, ImapClient, ImapEndpoint};
use crate::jobs::JobQueue;
use crate::oauth::token_manager::{
    ensure_valid_google_access_token, GoogleTokenClient, TokenManagerError, TokenRefreshOutcome,
};
use crate::storage::queries::{connectors, messages, sync_states};

const CANCEL_CHECK_INTERVAL: u64 = 25;

pub struct ImapSyncDeps {
    pub pool: sqlx::PgPool,
    pub event_bus: Arc<EventBus>,
    pub job_queue: Arc<JobQueue>,
    pub token_client: Arc<dyn GoogleTokenClient>,
    pub message_parser: Arc<dyn MessageParser>,
    pub blob_store: Arc<dyn BlobStore>,
    pub threader: Arc<dyn ThreadingCollaborator>,
    pub intervals: IntervalSettings,
    pub source_fetch_batch_size: u32,
}

struct HeartbeatGuard {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn spawn_heartbeat(
    pool: sqlx::PgPool,
    connector_id: IncomingConnectorId,
    mailbox: String,
    interval: std::time::Duration,
) -> HeartbeatGuard {
    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if sync_states::set_sync_state(&pool, &connector_id, &mailbox, &SyncStatePatch::default())
                .await
                .is_err()
            {
                warn!(mailbox = %mailbox, "heartbeat update failed");
            }
        }
    });
    HeartbeatGuard { handle }
}

async fn should_cancel(
    pool: &sqlx::PgPool,
    connector_id: &IncomingConnectorId,
    mailbox: &str,
    processed: &AtomicU64,
) -> Result<bool, ServiceError> {
    let count = processed.fetch_add(1, Ordering::Relaxed) + 1;
    if count % CANCEL_CHECK_INTERVAL != 0 {
        return Ok(false);
    }
    let state = sync_states::get(pool, connector_id, mailbox)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?;
    Ok(matches!(state.map(|s| s.status), Some(SyncStatus::CancelRequested)))
}

/// `runMailboxSync(connector, mailbox)`.
pub async fn run_mailbox_sync(
    deps: &ImapSyncDeps,
    connector: &IncomingConnector,
    mailbox: &str,
) -> Result<SyncOutcome, ServiceError> {
    let canonical = if connector.is_gmail_like() {
        normalize_gmail_mailbox_path(mailbox)
    } else {
        mailbox.to_string()
    };
    let connector_id = connector.id.clone();

    sync_states::ensure_exists(&deps.pool, &connector_id, &canonical)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?;
    let state = sync_states::get(&deps.pool, &connector_id, &canonical)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?
        .unwrap_or_else(|| SyncState::fresh(connector_id.clone(), canonical.clone()));

    let conn_params = resolve_connection_params(&deps.pool, deps.token_client.as_ref(), connector).await?;

    let claimed = sync_states::try_claim_mailbox_sync(
        &deps.pool,
        &connector_id,
        &canonical,
        &state.sync_progress,
        state.last_seen_uid,
        state.highest_uid,
        deps.intervals.heartbeat_stale.as_secs() as i64,
        deps.intervals.claim_stale.as_secs() as i64,
    )
    .await
    .map_err(|e| ServiceError::Other(e.into()))?;
    if !claimed {
        return Ok(SyncOutcome::AlreadyRunning);
    }

    let _heartbeat = spawn_heartbeat(
        deps.pool.clone(),
        connector_id.clone(),
        canonical.clone(),
        deps.intervals.heartbeat_refresh_interval(),
    );

    let result = run_claimed(deps, connector, &canonical, &state, &conn_params).await;

    match &result {
        Ok(SyncOutcome::Completed {
            inserted,
            updated,
            reconciled_removed,
            metadata_refreshed,
        }) => {
            deps.event_bus
                .emit_sync_event(
                    &connector.user_id,
                    &connector_id,
                    SyncEventType::SyncCompleted,
                    serde_json::json!({
                        "mailbox": canonical,
                        "inserted": inserted,
                        "updated": updated,
                        "reconciledRemoved": reconciled_removed,
                        "metadataRefreshed": metadata_refreshed,
                    }),
                )
                .await
                .ok();
        }
        Ok(SyncOutcome::Cancelled { .. }) => {
            deps.event_bus
                .emit_sync_event(
                    &connector.user_id,
                    &connector_id,
                    SyncEventType::SyncCancelled,
                    serde_json::json!({ "mailbox": canonical }),
                )
                .await
                .ok();
        }
        Ok(SyncOutcome::AlreadyRunning) => {}
        Err(err) => {
            let patch = SyncStatePatch {
                status: Some(SyncStatus::Error),
                sync_error: Some(Some(err.to_string())),
                sync_completed_at: Some(Some(chrono::Utc::now())),
                ..Default::default()
            };
            sync_states::set_sync_state(&deps.pool, &connector_id, &canonical, &patch).await.ok();
            deps.event_bus
                .emit_sync_event(
                    &connector.user_id,
                    &connector_id,
                    SyncEventType::SyncError,
                    serde_json::json!({ "mailbox": canonical, "message": err.to_string() }),
                )
                .await
                .ok();
        }
    }

    result
}

pub(crate) struct ConnParams {
    pub(crate) endpoint: ImapEndpoint,
    pub(crate) username: String,
    pub(crate) secret: String,
    pub(crate) use_xoauth2: bool,
}

/// Resolves connection parameters, refreshing and persisting the OAuth
/// token first when the connector's auth is OAuth2 (Gmail-IMAP or any other
/// XOAUTH2-capable IMAP server). Shared with the action executor, which
/// needs the same login path without running a full sync.
pub(crate) async fn resolve_connection_params(
    pool: &sqlx::PgPool,
    token_client: &dyn GoogleTokenClient,
    connector: &IncomingConnector,
) -> Result<ConnParams, ServiceError> {
    let host = connector
        .host
        .clone()
        .ok_or_else(|| ServiceError::validation("incoming connector missing host"))?;
    let port = connector.port.unwrap_or(if connector.tls { 993 } else { 143 });
    let endpoint = ImapEndpoint { host, port };

    match &connector.auth_config {
        AuthConfig::Password { user, pass } => Ok(ConnParams {
            endpoint,
            username: user.clone(),
            secret: pass.clone(),
            use_xoauth2: false,
        }),
        AuthConfig::OAuth2 { .. } => {
            let refreshed =
                match ensure_valid_google_access_token(token_client, connector.auth_config.clone(), false).await {
                    Ok(outcome) => outcome,
                    Err(TokenManagerError::MustReconnect(detail, Some(revoked))) => {
                        connectors::update_incoming_auth_config(pool, &connector.id, &revoked)
                            .await
                            .map_err(|e| ServiceError::Other(e.into()))?;
                        return Err(ServiceError::reconnect_required(detail));
                    }
                    Err(e) => return Err(ServiceError::reconnect_required(e.to_string())),
                };

            if let TokenRefreshOutcome::Refreshed(ref cfg) = refreshed {
                connectors::update_incoming_auth_config(pool, &connector.id, cfg)
                    .await
                    .map_err(|e| ServiceError::Other(e.into()))?;
            }

            let access_token = match refreshed.into_auth_config() {
                AuthConfig::OAuth2 { access_token: Some(tok), .. } => tok,
                _ => return Err(ServiceError::reconnect_required("no access token available after refresh")),
            };

            Ok(ConnParams {
                endpoint,
                username: connector.email_address.clone(),
                secret: access_token,
                use_xoauth2: true,
            })
        }
    }
}

async fn run_claimed(
    deps: &ImapSyncDeps,
    connector: &IncomingConnector,
    canonical: &str,
    state: &SyncState,
    conn: &ConnParams,
) -> Result<SyncOutcome, ServiceError> {
    let connector_id = connector.id.clone();
    let session = if conn.use_xoauth2 {
        login_xoauth2(&conn.endpoint, &conn.username, &conn.secret).await?
    } else {
        login_password(&conn.endpoint, &conn.username, &conn.secret).await?
    };
    let imap = ImapClient::new(session);

    let server_path = if connector.is_gmail_like() {
        let rows = imap.list().await?;
        let directory = MailboxDirectory::build(&rows);
        directory.server_path_for(canonical)
    } else {
        canonical.to_string()
    };

    let meta = imap.select(&server_path).await?;

    let mut reset_local_state = false;
    if let (Some(stored), Some(server)) = (state.uid_validity, meta.uid_validity) {
        if stored != server {
            messages::purge_folder(&deps.pool, &connector_id, canonical)
                .await
                .map_err(|e| ServiceError::Other(e.into()))?;
            reset_local_state = true;
        }
    }

    let effective_last_seen_uid = if reset_local_state { 0 } else { state.last_seen_uid };
    let effective_highest_uid = if reset_local_state { 0 } else { state.highest_uid };
    let effective_modseq = if reset_local_state { None } else { state.modseq };
    let effective_last_full_reconcile_at = if reset_local_state { None } else { state.last_full_reconcile_at };

    let mut progress = if reset_local_state {
        SyncProgress::default()
    } else {
        state.sync_progress.clone()
    };
    let processed = AtomicU64::new(0);
    let mut needs_source: Vec<u32> = Vec::new();
    let mut highest_modseq = effective_modseq;
    let mut cancelled = false;

    if let Some(modseq) = effective_modseq {
        let rows = imap.fetch_metadata("1:*", Some(modseq)).await?;
        for row in &rows {
            upsert_row(deps, &connector_id, canonical, row, &mut progress, &mut needs_source).await?;
            highest_modseq = max_opt(highest_modseq, row.modseq);
            if should_cancel(&deps.pool, &connector_id, canonical, &processed).await? {
                cancelled = true;
                break;
            }
        }
    } else {
        let start = effective_last_seen_uid as u64 + 1;
        let rows = imap.fetch_metadata(&format!("{start}:*"), None).await?;
        for row in &rows {
            upsert_row(deps, &connector_id, canonical, row, &mut progress, &mut needs_source).await?;
            highest_modseq = max_opt(highest_modseq, row.modseq);
            if should_cancel(&deps.pool, &connector_id, canonical, &processed).await? {
                cancelled = true;
                break;
            }
        }

        if !cancelled && effective_highest_uid > 0 {
            let window_start = (effective_highest_uid as i64 - deps.intervals.flag_sync_window as i64 + 1).max(1) as u64;
            let tail_rows = imap.fetch_metadata(&format!("{window_start}:*"), None).await?;
            for row in &tail_rows {
                upsert_row(deps, &connector_id, canonical, row, &mut progress, &mut needs_source).await?;
                highest_modseq = max_opt(highest_modseq, row.modseq);
                if should_cancel(&deps.pool, &connector_id, canonical, &processed).await? {
                    cancelled = true;
                    break;
                }
            }
        }
    }

    let reconcile_due = effective_last_full_reconcile_at
        .map(|at| chrono::Utc::now() - at >= deps.intervals.full_reconcile_interval_chrono())
        .unwrap_or(true);

    let mut did_full_reconcile = false;
    if !cancelled {
        if reconcile_due {
            let seen_uids = imap.search_all_uids().await?;
            let seen_i64: Vec<i64> = seen_uids.iter().map(|u| i64::from(*u)).collect();
            let deleted = messages::delete_imap_rows_not_in(&deps.pool, &connector_id, canonical, &seen_i64)
                .await
                .map_err(|e| ServiceError::Other(e.into()))?;
            progress.reconciled_removed += deleted.len() as u64;
            did_full_reconcile = true;
        } else {
            let window = deps.intervals.recent_reconcile_uid_window as i64;
            let window_start = (effective_highest_uid as i64 - window + 1).max(1) as u64;
            let rows = imap.fetch_metadata(&format!("{window_start}:*"), None).await?;
            for row in &rows {
                upsert_row(deps, &connector_id, canonical, row, &mut progress, &mut needs_source).await?;
                highest_modseq = max_opt(highest_modseq, row.modseq);
                if should_cancel(&deps.pool, &connector_id, canonical, &processed).await? {
                    cancelled = true;
                    break;
                }
            }
        }
    }

    if !cancelled {
        needs_source.sort_unstable();
        needs_source.dedup();
        for chunk in needs_source.chunks(deps.source_fetch_batch_size.max(1) as usize) {
            hydrate_chunk(deps, &connector_id, canonical, &imap, chunk).await?;
            let max_uid = chunk.iter().copied().max().unwrap_or(0);
            let patch = SyncStatePatch {
                last_seen_uid: Some(effective_last_seen_uid.max(max_uid)),
                sync_progress: Some(progress.clone()),
                ..Default::default()
            };
            sync_states::set_sync_state(&deps.pool, &connector_id, canonical, &patch)
                .await
                .map_err(|e| ServiceError::Other(e.into()))?;
            if should_cancel(&deps.pool, &connector_id, canonical, &processed).await? {
                cancelled = true;
                break;
            }
        }
    }

    imap.logout().await.ok();

    let highest_uid = meta.uid_next.saturating_sub(1);

    let patch = SyncStatePatch {
        status: Some(if cancelled { SyncStatus::Cancelled } else { SyncStatus::Completed }),
        uid_validity: Some(meta.uid_validity),
        last_seen_uid: Some(highest_uid),
        highest_uid: Some(highest_uid),
        modseq: Some(highest_modseq),
        last_full_reconcile_at: if did_full_reconcile { Some(Some(chrono::Utc::now())) } else { None },
        sync_completed_at: Some(Some(chrono::Utc::now())),
        sync_progress: Some(progress.clone()),
        ..Default::default()
    };
    sync_states::set_sync_state(&deps.pool, &connector_id, canonical, &patch)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?;

    if cancelled {
        Ok(SyncOutcome::Cancelled {
            inserted: progress.inserted,
            updated: progress.updated,
            reconciled_removed: progress.reconciled_removed,
            metadata_refreshed: progress.metadata_refreshed,
        })
    } else {
        Ok(SyncOutcome::Completed {
            inserted: progress.inserted,
            updated: progress.updated,
            reconciled_removed: progress.reconciled_removed,
            metadata_refreshed: progress.metadata_refreshed,
        })
    }
}

fn max_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// Create-vs-update upsert for one IMAP row (§4.H "Per-row state cache").
async fn upsert_row(
    deps: &ImapSyncDeps,
    connector_id: &IncomingConnectorId,
    canonical: &str,
    row: &FetchedMessage,
    progress: &mut SyncProgress,
    needs_source: &mut Vec<u32>,
) -> Result<(), ServiceError> {
    let existing = messages::find_by_uid(&deps.pool, connector_id, canonical, row.uid)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?;

    let subject = row.subject.clone().unwrap_or_default();
    let from_header = row.from.clone().unwrap_or_else(|| Address::new(""));
    let to_header = row.to.clone();
    let message_id_header = row
        .message_id
        .clone()
        .unwrap_or_else(|| format!("<{canonical}-{}>", row.uid));
    let received_at = row.internal_date.unwrap_or_else(chrono::Utc::now);

    match existing {
        None => {
            let mut message = Message {
                id: MessageId(uuid::Uuid::new_v4().to_string()),
                incoming_connector_id: connector_id.clone(),
                folder_path: canonical.to_string(),
                uid: Some(row.uid),
                gmail_message_id: None,
                gmail_thread_id: None,
                thread_id: None,
                message_id: message_id_header,
                in_reply_to: row.in_reply_to.clone(),
                references_header: row.references.clone(),
                subject,
                from_header,
                to_header,
                snippet: String::new(),
                received_at,
                is_read: row.is_read,
                is_starred: row.is_starred,
                flags: Vec::new(),
                mailbox_uid_validity: None,
                raw_blob_key: None,
                body_text: None,
                body_html: None,
                provider_meta: ProviderMeta::default(),
            };
            message.thread_id = Some(deps.threader.compute_thread_id(&message, &[]));
            messages::insert(&deps.pool, &message).await.map_err(|e| ServiceError::Other(e.into()))?;
            progress.inserted += 1;
            needs_source.push(row.uid);
        }
        Some(mut message) => {
            message.subject = subject;
            message.from_header = from_header;
            message.to_header = to_header;
            message.received_at = received_at;
            message.is_read = row.is_read;
            message.is_starred = row.is_starred;
            message.in_reply_to = row.in_reply_to.clone().or(message.in_reply_to);
            message.references_header = row.references.clone().or(message.references_header);
            messages::update_metadata(&deps.pool, &message)
                .await
                .map_err(|e| ServiceError::Other(e.into()))?;

            let new_thread_id = deps.threader.compute_thread_id(&message, &[]);
            if message.thread_id.as_deref() != Some(new_thread_id.as_str()) {
                messages::set_thread_id(&deps.pool, &message.id, &new_thread_id)
                    .await
                    .map_err(|e| ServiceError::Other(e.into()))?;
            }
            progress.updated += 1;
            progress.metadata_refreshed += 1;

            if !message.has_body() || !message.has_raw() {
                needs_source.push(row.uid);
            }
        }
    }

    Ok(())
}

/// Fetches raw source for a batch of UIDs, uploads to blob storage, parses,
/// and persists (§4.H "Create vs rehydrate").
async fn hydrate_chunk(
    deps: &ImapSyncDeps,
    connector_id: &IncomingConnectorId,
    canonical: &str,
    imap: &ImapClient,
    uids: &[u32],
) -> Result<(), ServiceError> {
    for &uid in uids {
        let Some(message) = messages::find_by_uid(&deps.pool, connector_id, canonical, uid)
            .await
            .map_err(|e| ServiceError::Other(e.into()))?
        else {
            continue;
        };
        let raw = match imap.fetch_source(uid).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(uid, error = %err, "imap source fetch failed, will retry on next pass");
                continue;
            }
        };

        let blob_key = format!("imap/{}/{}/{}", connector_id.0, canonical, uid);
        if deps
            .blob_store
            .put(&blob_key, bytes::Bytes::from(raw.clone()))
            .await
            .is_err()
        {
            // Leaves `raw_blob_key` null so the next pass retries (§4.H).
            continue;
        }
        messages::set_raw_blob_key(&deps.pool, &message.id, &blob_key)
            .await
            .map_err(|e| ServiceError::Other(e.into()))?;

        match deps.message_parser.parse(&raw) {
            Ok(parsed) => {
                messages::set_parsed_body(&deps.pool, &message.id, parsed.body_text.as_deref(), parsed.body_html.as_deref())
                    .await
                    .map_err(|e| ServiceError::Other(e.into()))?;
                if !parsed.attachments.is_empty() {
                    messages::replace_attachments(&deps.pool, &message.id, &parsed.attachments)
                        .await
                        .map_err(|e| ServiceError::Other(e.into()))?;
                }
                let mut refreshed = message.clone();
                refreshed.body_text = parsed.body_text;
                refreshed.body_html = parsed.body_html;
                refreshed.in_reply_to = parsed.in_reply_to.or(refreshed.in_reply_to);
                refreshed.references_header = parsed.references.or(refreshed.references_header);
                let new_thread_id = deps.threader.compute_thread_id(&refreshed, &[]);
                if refreshed.thread_id.as_deref() != Some(new_thread_id.as_str()) {
                    messages::set_thread_id(&deps.pool, &message.id, &new_thread_id)
                        .await
                        .map_err(|e| ServiceError::Other(e.into()))?;
                }
            }
            Err(err) => {
                warn!(uid, error = %err, "message parse failed during imap hydrate");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_opt_picks_larger_or_present_value() {
        assert_eq!(max_opt(Some(5), Some(9)), Some(9));
        assert_eq!(max_opt(Some(5), None), Some(5));
        assert_eq!(max_opt(None, Some(3)), Some(3));
        assert_eq!(max_opt(None, None), None);
    }
}
