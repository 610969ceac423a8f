//! Gmail sync driver (§4.G), grounded on the teacher's
//! `providers/email/gmail.rs` `sync_gmail_account` loop (claim -> fetch ->
//! upsert -> persist watermark) generalized from the teacher's single
//! hardcoded INBOX pass into the spec's bootstrap/incremental/full-reconcile
//! branches over an arbitrary canonical mailbox.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tracing::{info, warn};

use crate::collaborators::{BlobStore, MessageParser, ThreadingCollaborator};
use crate::config::IntervalSettings;
use crate::domain::{
    Address, Attachment, IncomingConnector, IncomingConnectorId, Message, MessageId, ProviderMeta,
    SyncEventType, SyncProgress, SyncStatePatch, SyncStatus,
};
use crate::error::{ServiceError, SyncOutcome};
use crate::events::EventBus;
use crate::gmail::api::{GmailApiClient, GmailApiError, GmailMessage};
use crate::gmail::path::normalize_gmail_mailbox_path;
use crate::jobs::JobQueue;
use crate::oauth::token_manager::{
    ensure_valid_google_access_token, GoogleTokenClient, TokenManagerError, TokenRefreshOutcome,
};
use crate::storage::queries::{connectors, messages, sync_states};

/// Messages processed between cancellation checks (§4.G).
const CANCEL_CHECK_INTERVAL: u64 = 25;

pub struct GmailSyncDeps {
    pub pool: sqlx::PgPool,
    pub event_bus: Arc<EventBus>,
    pub job_queue: Arc<JobQueue>,
    pub gmail_api: Arc<GmailApiClient>,
    pub token_client: Arc<dyn GoogleTokenClient>,
    pub message_parser: Arc<dyn MessageParser>,
    pub blob_store: Arc<dyn BlobStore>,
    pub threader: Arc<dyn ThreadingCollaborator>,
    pub intervals: IntervalSettings,
    pub bootstrap_metadata_only: bool,
}

/// Refreshes (and, if rotated, persists) the connector's Google access
/// token. Shared by the sync driver, the background hydrator, and the
/// action executor's Gmail-API path — all three need a live bearer token
/// and none should duplicate the refresh-then-persist dance.
pub(crate) async fn resolve_access_token(
    pool: &sqlx::PgPool,
    token_client: &dyn GoogleTokenClient,
    connector: &IncomingConnector,
) -> Result<String, ServiceError> {
    let refreshed = match ensure_valid_google_access_token(token_client, connector.auth_config.clone(), false).await {
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

    match refreshed.into_auth_config() {
        crate::domain::AuthConfig::OAuth2 { access_token: Some(tok), .. } => Ok(tok),
        _ => Err(ServiceError::reconnect_required("no access token available after refresh")),
    }
}

fn label_derived_flags(label_ids: &[String]) -> (bool, bool) {
    let is_read = !label_ids.iter().any(|l| l == "UNREAD");
    let is_starred = label_ids.iter().any(|l| l == "STARRED");
    (is_read, is_starred)
}

/// Splits a raw `From`/`To` header value on top-level commas and parses each
/// `"Name <addr>"` or bare-address entry. Only the header-level display
/// shaping the spec needs for the metadata-only path; full MIME parsing is
/// the `MessageParser` collaborator's job.
fn parse_address_list(raw: &str) -> Vec<Address> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_one_address)
        .collect()
}

fn parse_one_address(raw: &str) -> Address {
    if let (Some(open), Some(close)) = (raw.find('<'), raw.rfind('>')) {
        if open < close {
            let email = raw[open + 1..close].trim().to_string();
            let name = raw[..open].trim().trim_matches('"').to_string();
            return Address {
                email,
                name: if name.is_empty() { None } else { Some(name) },
            };
        }
    }
    Address::new(raw.trim())
}

/// Numeric max of two Gmail history-id strings (they're decimal, but not
/// fixed-width, so a plain string compare would be wrong).
fn max_history_id(a: Option<&str>, b: Option<&str>) -> Option<String> {
    let parse = |s: &str| s.parse::<u64>().ok();
    match (a.and_then(parse), b.and_then(parse)) {
        (Some(x), Some(y)) => Some(x.max(y).to_string()),
        (Some(x), None) => Some(x.to_string()),
        (None, Some(y)) => Some(y.to_string()),
        (None, None) => None,
    }
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

/// `runGmailMailboxSync(connector, mailbox, {gmailHistoryIdHint?})`.
pub async fn run_gmail_mailbox_sync(
    deps: &GmailSyncDeps,
    connector: &IncomingConnector,
    mailbox: &str,
    gmail_history_id_hint: Option<&str>,
) -> Result<SyncOutcome, ServiceError> {
    let canonical = normalize_gmail_mailbox_path(mailbox);
    let connector_id = connector.id.clone();

    sync_states::ensure_exists(&deps.pool, &connector_id, &canonical)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?;

    let state = sync_states::get(&deps.pool, &connector_id, &canonical)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?
        .unwrap_or_else(|| crate::domain::SyncState::fresh(connector_id.clone(), canonical.clone()));

    let access_token = resolve_access_token(&deps.pool, deps.token_client.as_ref(), connector).await?;

    let heartbeat_stale_secs = deps.intervals.heartbeat_stale.as_secs() as i64;
    let claim_stale_secs = deps.intervals.claim_stale.as_secs() as i64;

    let claimed = sync_states::try_claim_mailbox_sync(
        &deps.pool,
        &connector_id,
        &canonical,
        &state.sync_progress,
        state.last_seen_uid,
        state.highest_uid,
        heartbeat_stale_secs,
        claim_stale_secs,
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

    let result = run_claimed(deps, connector, &canonical, &state, gmail_history_id_hint, &access_token).await;

    match &result {
        Ok(SyncOutcome::Completed { inserted, updated, reconciled_removed, metadata_refreshed }) => {
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

async fn run_claimed(
    deps: &GmailSyncDeps,
    connector: &IncomingConnector,
    canonical: &str,
    state: &crate::domain::SyncState,
    gmail_history_id_hint: Option<&str>,
    access_token: &str,
) -> Result<SyncOutcome, ServiceError> {
    let connector_id = connector.id.clone();
    let label_id = canonical.to_string();

    let local_count = messages::count_in_folder(&deps.pool, &connector_id, canonical)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?;

    let mut progress = state.sync_progress.clone();
    let mut latest_history_id = state.modseq.map(|m| m.to_string());
    let mut full_reconcile_ran = false;
    let processed = AtomicU64::new(0);
    let mut cancelled = false;
    let mut seen_ids: HashSet<String> = HashSet::new();

    let needs_bootstrap = state.modseq.is_none() && local_count == 0;
    let mut needs_full_reconcile = false;

    if needs_bootstrap {
        info!(mailbox = %canonical, "gmail bootstrap starting");
        let ids = list_all_message_ids(deps, access_token, &label_id).await?;
        for id in &ids {
            seen_ids.insert(id.clone());
            process_one(deps, connector, canonical, &label_id, id, access_token, &mut progress, &mut latest_history_id).await?;
            if should_cancel(deps, &connector_id, canonical, &processed).await? {
                cancelled = true;
                break;
            }
        }
    } else {
        match fetch_history(deps, access_token, state.modseq.unwrap_or(0)).await {
            Ok((changed, deleted, history_latest)) => {
                latest_history_id = max_history_id(latest_history_id.as_deref(), history_latest.as_deref());
                for id in deleted {
                    if let Some(existing) =
                        messages::find_by_gmail_message_id(&deps.pool, &connector_id, canonical, &id, &id)
                            .await
                            .map_err(|e| ServiceError::Other(e.into()))?
                    {
                        messages::delete(&deps.pool, &existing.id).await.map_err(|e| ServiceError::Other(e.into()))?;
                        progress.reconciled_removed += 1;
                    }
                }
                if !cancelled {
                    for id in changed {
                        process_one(deps, connector, canonical, &label_id, &id, access_token, &mut progress, &mut latest_history_id).await?;
                        if should_cancel(deps, &connector_id, canonical, &processed).await? {
                            cancelled = true;
                            break;
                        }
                    }
                }
            }
            Err(err) if err.is_history_fallback_trigger() => {
                deps.event_bus
                    .emit_sync_event(
                        &connector.user_id,
                        &connector_id,
                        SyncEventType::SyncError,
                        serde_json::json!({ "mailbox": canonical, "phase": "gmail-history-fallback", "message": err.to_string() }),
                    )
                    .await
                    .ok();
                needs_full_reconcile = true;
            }
            Err(err) => return Err(ServiceError::Transient(err.to_string())),
        }
    }

    let reconcile_due = state
        .last_full_reconcile_at
        .map(|t| (chrono::Utc::now() - t) >= deps.intervals.full_reconcile_interval_chrono())
        .unwrap_or(true);

    if !cancelled && !needs_bootstrap && (needs_full_reconcile || reconcile_due) {
        full_reconcile_ran = true;
        let ids = list_all_message_ids(deps, access_token, &label_id).await?;
        let removed = messages::delete_gmail_rows_not_in(&deps.pool, &connector_id, canonical, &ids)
            .await
            .map_err(|e| ServiceError::Other(e.into()))?;
        progress.reconciled_removed += removed.len() as u64;
        for id in &ids {
            if seen_ids.contains(id) {
                continue;
            }
            process_one(deps, connector, canonical, &label_id, id, access_token, &mut progress, &mut latest_history_id).await?;
            if should_cancel(deps, &connector_id, canonical, &processed).await? {
                cancelled = true;
                break;
            }
        }
    } else if needs_bootstrap {
        // The bootstrap listing already enumerated the whole label; a
        // separate reconcile pass in the same run would be redundant.
        full_reconcile_ran = true;
    }

    if let Some(hint) = gmail_history_id_hint {
        latest_history_id = max_history_id(latest_history_id.as_deref(), Some(hint));
    }

    let patch = SyncStatePatch {
        status: Some(if cancelled { SyncStatus::Cancelled } else { SyncStatus::Completed }),
        modseq: Some(latest_history_id.as_deref().and_then(|s| s.parse::<u64>().ok())),
        sync_progress: Some(progress.clone()),
        last_full_reconcile_at: if full_reconcile_ran { Some(Some(chrono::Utc::now())) } else { None },
        sync_completed_at: Some(Some(chrono::Utc::now())),
        ..Default::default()
    };
    sync_states::set_sync_state(&deps.pool, &connector_id, canonical, &patch)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?;

    if cancelled {
        return Ok(SyncOutcome::Cancelled {
            inserted: progress.inserted,
            updated: progress.updated,
            reconciled_removed: progress.reconciled_removed,
            metadata_refreshed: progress.metadata_refreshed,
        });
    }

    if deps.bootstrap_metadata_only && needs_bootstrap {
        deps.job_queue
            .enqueue_gmail_hydration(&connector.user_id, &connector_id, canonical)
            .await
            .ok();
    }

    Ok(SyncOutcome::Completed {
        inserted: progress.inserted,
        updated: progress.updated,
        reconciled_removed: progress.reconciled_removed,
        metadata_refreshed: progress.metadata_refreshed,
    })
}

/// Checks `SyncState.status` every `CANCEL_CHECK_INTERVAL`th call (§4.G).
async fn should_cancel(
    deps: &GmailSyncDeps,
    connector_id: &IncomingConnectorId,
    mailbox: &str,
    processed: &AtomicU64,
) -> Result<bool, ServiceError> {
    let count = processed.fetch_add(1, Ordering::Relaxed) + 1;
    if count % CANCEL_CHECK_INTERVAL != 0 {
        return Ok(false);
    }
    let state = sync_states::get(&deps.pool, connector_id, mailbox)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?;
    Ok(matches!(state.map(|s| s.status), Some(SyncStatus::CancelRequested)))
}

async fn list_all_message_ids(
    deps: &GmailSyncDeps,
    access_token: &str,
    label_id: &str,
) -> Result<Vec<String>, ServiceError> {
    let mut ids = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let page = deps
            .gmail_api
            .list_message_ids(access_token, label_id, page_token.as_deref())
            .await
            .map_err(|e| ServiceError::Transient(e.to_string()))?;
        ids.extend(page.messages.into_iter().map(|m| m.id));
        page_token = page.next_page_token;
        if page_token.is_none() {
            break;
        }
    }
    Ok(ids)
}

/// Collects `(changed, deleted, historyId)` across `/history` pagination.
async fn fetch_history(
    deps: &GmailSyncDeps,
    access_token: &str,
    start_history_id: u64,
) -> Result<(Vec<String>, Vec<String>, Option<String>), GmailApiError> {
    let mut changed = HashSet::new();
    let mut deleted = HashSet::new();
    let mut latest: Option<String> = None;
    let mut page_token: Option<String> = None;
    let start = start_history_id.to_string();

    loop {
        let page = deps.gmail_api.list_history(access_token, &start, page_token.as_deref()).await?;
        latest = max_history_id(latest.as_deref(), page.history_id.as_deref());
        for record in &page.history {
            latest = max_history_id(latest.as_deref(), Some(record.id.as_str()));
            for added in &record.messages_added {
                changed.insert(added.message.id.clone());
            }
            for removed in &record.messages_deleted {
                deleted.insert(removed.message.id.clone());
            }
            for labeled in record.labels_added.iter().chain(record.labels_removed.iter()) {
                changed.insert(labeled.message.id.clone());
            }
        }
        page_token = page.next_page_token;
        if page_token.is_none() {
            break;
        }
    }

    for id in &deleted {
        changed.remove(id);
    }

    Ok((changed.into_iter().collect(), deleted.into_iter().collect(), latest))
}

/// Per-message upsert (§4.G steps 1-7).
async fn process_one(
    deps: &GmailSyncDeps,
    connector: &IncomingConnector,
    canonical: &str,
    label_id: &str,
    gmail_message_id: &str,
    access_token: &str,
    progress: &mut SyncProgress,
    latest_history_id: &mut Option<String>,
) -> Result<(), ServiceError> {
    let connector_id = connector.id.clone();

    let meta = deps
        .gmail_api
        .get_message_metadata(access_token, gmail_message_id)
        .await
        .map_err(|e| ServiceError::Transient(e.to_string()))?;

    *latest_history_id = max_history_id(latest_history_id.as_deref(), meta.history_id.as_deref());

    // Step 2: target label no longer present -> reconcile this row away.
    if !meta.label_ids.iter().any(|l| l == label_id) {
        if let Some(existing) =
            messages::find_by_gmail_message_id(&deps.pool, &connector_id, canonical, gmail_message_id, gmail_message_id)
                .await
                .map_err(|e| ServiceError::Other(e.into()))?
        {
            messages::delete(&deps.pool, &existing.id).await.map_err(|e| ServiceError::Other(e.into()))?;
            progress.reconciled_removed += 1;
        }
        return Ok(());
    }

    let message_id_header = meta.header("Message-ID").unwrap_or(gmail_message_id).to_string();
    let existing = messages::find_by_gmail_message_id(
        &deps.pool,
        &connector_id,
        canonical,
        gmail_message_id,
        &message_id_header,
    )
    .await
    .map_err(|e| ServiceError::Other(e.into()))?;

    let (is_read, is_starred) = label_derived_flags(&meta.label_ids);
    let from_header = meta
        .header("From")
        .map(parse_one_address)
        .unwrap_or_else(|| Address::new(""));
    let to_header = meta.header("To").map(parse_address_list).unwrap_or_default();
    let subject = meta.header("Subject").unwrap_or("").to_string();
    let in_reply_to = meta.header("In-Reply-To").map(str::to_string);
    let references_header = meta.header("References").map(str::to_string);

    match existing {
        None => {
            let id = MessageId(uuid::Uuid::new_v4().to_string());
            let mut message = Message {
                id: id.clone(),
                incoming_connector_id: connector_id.clone(),
                folder_path: canonical.to_string(),
                uid: None,
                gmail_message_id: Some(gmail_message_id.to_string()),
                gmail_thread_id: Some(meta.thread_id.clone()),
                thread_id: None,
                message_id: message_id_header,
                in_reply_to,
                references_header,
                subject,
                from_header,
                to_header,
                snippet: meta.snippet.clone(),
                received_at: meta.received_at(),
                is_read,
                is_starred,
                flags: meta.label_ids.clone(),
                mailbox_uid_validity: None,
                raw_blob_key: None,
                body_text: None,
                body_html: None,
                provider_meta: ProviderMeta {
                    gmail_label_ids: meta.label_ids.clone(),
                    gmail_history_id: meta.history_id.clone(),
                },
            };

            let mut attachments: Vec<Attachment> = Vec::new();
            if !deps.bootstrap_metadata_only {
                if let Ok(raw_msg) = deps.gmail_api.get_message_raw(access_token, gmail_message_id).await {
                    if let Some(raw_b64) = raw_msg.raw {
                        if let Ok(raw_bytes) = URL_SAFE_NO_PAD.decode(raw_b64.as_bytes()) {
                            let blob_key = format!("gmail/{}/{}", connector_id.0, gmail_message_id);
                            if deps.blob_store.put(&blob_key, bytes::Bytes::from(raw_bytes.clone())).await.is_ok() {
                                message.raw_blob_key = Some(blob_key);
                            }
                            if let Ok(parsed) = deps.message_parser.parse(&raw_bytes) {
                                message.body_text = parsed.body_text;
                                message.body_html = parsed.body_html;
                                attachments = parsed
                                    .attachments
                                    .into_iter()
                                    .map(|mut att| {
                                        att.message_id = id.clone();
                                        att
                                    })
                                    .collect();
                            }
                        }
                    }
                }
            }

            message.thread_id = Some(deps.threader.compute_thread_id(&message, &[]));

            messages::insert(&deps.pool, &message).await.map_err(|e| ServiceError::Other(e.into()))?;
            if !attachments.is_empty() {
                messages::replace_attachments(&deps.pool, &id, &attachments)
                    .await
                    .map_err(|e| ServiceError::Other(e.into()))?;
            }
            progress.inserted += 1;
        }
        Some(mut message) => {
            message.gmail_thread_id = Some(meta.thread_id.clone());
            message.subject = subject;
            message.from_header = from_header;
            message.to_header = to_header;
            message.snippet = meta.snippet.clone();
            message.received_at = meta.received_at();
            message.is_read = is_read;
            message.is_starred = is_starred;
            message.flags = meta.label_ids.clone();
            message.in_reply_to = in_reply_to;
            message.references_header = references_header;
            message.provider_meta = ProviderMeta {
                gmail_label_ids: meta.label_ids.clone(),
                gmail_history_id: meta.history_id.clone(),
            };

            messages::update_metadata(&deps.pool, &message).await.map_err(|e| ServiceError::Other(e.into()))?;

            let new_thread_id = deps.threader.compute_thread_id(&message, &[]);
            if message.thread_id.as_deref() != Some(new_thread_id.as_str()) {
                messages::set_thread_id(&deps.pool, &message.id, &new_thread_id)
                    .await
                    .map_err(|e| ServiceError::Other(e.into()))?;
            }

            progress.updated += 1;
            progress.metadata_refreshed += 1;
        }
    }

    Ok(())
}

/// §4.G background hydration batch.
pub struct HydrationResult {
    pub processed: u64,
    pub failed: u64,
    pub remaining: bool,
}

pub async fn hydrate_gmail_mailbox_content_batch(
    deps: &GmailSyncDeps,
    connector: &IncomingConnector,
    mailbox: &str,
    batch_size: u32,
) -> Result<HydrationResult, ServiceError> {
    let canonical = normalize_gmail_mailbox_path(mailbox);
    let connector_id = connector.id.clone();

    let access_token = resolve_access_token(&deps.pool, deps.token_client.as_ref(), connector).await?;

    let rows = messages::find_missing_body_or_raw(&deps.pool, &connector_id, &canonical, batch_size)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?;

    let mut processed = 0u64;
    let mut failed = 0u64;
    let remaining = rows.len() as u32 == batch_size;

    for mut message in rows {
        let Some(gmail_message_id) = message.gmail_message_id.clone() else {
            failed += 1;
            continue;
        };
        match deps.gmail_api.get_message_raw(&access_token, &gmail_message_id).await {
            Ok(raw_msg) => {
                let Some(raw_b64) = raw_msg.raw else {
                    failed += 1;
                    continue;
                };
                let Ok(raw_bytes) = URL_SAFE_NO_PAD.decode(raw_b64.as_bytes()) else {
                    failed += 1;
                    continue;
                };
                let blob_key = format!("gmail/{}/{}", connector_id.0, gmail_message_id);
                if deps.blob_store.put(&blob_key, bytes::Bytes::from(raw_bytes.clone())).await.is_ok() {
                    messages::set_raw_blob_key(&deps.pool, &message.id, &blob_key)
                        .await
                        .map_err(|e| ServiceError::Other(e.into()))?;
                    message.raw_blob_key = Some(blob_key);
                }
                if let Ok(parsed) = deps.message_parser.parse(&raw_bytes) {
                    messages::set_parsed_body(&deps.pool, &message.id, parsed.body_text.as_deref(), parsed.body_html.as_deref())
                        .await
                        .map_err(|e| ServiceError::Other(e.into()))?;
                    if !parsed.attachments.is_empty() {
                        let attachments: Vec<Attachment> = parsed
                            .attachments
                            .into_iter()
                            .map(|mut att| {
                                att.message_id = message.id.clone();
                                att
                            })
                            .collect();
                        messages::replace_attachments(&deps.pool, &message.id, &attachments)
                            .await
                            .map_err(|e| ServiceError::Other(e.into()))?;
                    }
                    message.body_text = parsed.body_text;
                    message.body_html = parsed.body_html;
                    let new_thread_id = deps.threader.compute_thread_id(&message, &[]);
                    if message.thread_id.as_deref() != Some(new_thread_id.as_str()) {
                        messages::set_thread_id(&deps.pool, &message.id, &new_thread_id)
                            .await
                            .map_err(|e| ServiceError::Other(e.into()))?;
                    }
                }
                processed += 1;
            }
            Err(_) => failed += 1,
        }
    }

    Ok(HydrationResult { processed, failed, remaining })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_list_splits_on_comma() {
        let addrs = parse_address_list("Alice <a@example.com>, b@example.com");
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].email, "a@example.com");
        assert_eq!(addrs[0].name.as_deref(), Some("Alice"));
        assert_eq!(addrs[1].email, "b@example.com");
        assert!(addrs[1].name.is_none());
    }

    #[test]
    fn bare_address_has_no_name() {
        let addr = parse_one_address("plain@example.com");
        assert_eq!(addr.email, "plain@example.com");
        assert!(addr.name.is_none());
    }

    #[test]
    fn max_history_id_picks_larger_numeric_value() {
        assert_eq!(max_history_id(Some("9"), Some("10")), Some("10".to_string()));
        assert_eq!(max_history_id(None, Some("5")), Some("5".to_string()));
        assert_eq!(max_history_id(None, None), None);
    }

    #[test]
    fn label_derived_flags_detect_unread_and_starred() {
        let (is_read, is_starred) = label_derived_flags(&["INBOX".to_string(), "STARRED".to_string()]);
        assert!(is_read);
        assert!(is_starred);

        let (is_read, is_starred) = label_derived_flags(&["INBOX".to_string(), "UNREAD".to_string()]);
        assert!(!is_read);
        assert!(!is_starred);
    }
}
