//! Per-mailbox IDLE watcher (§4.I), grounded on `gmail::sync::run_gmail_mailbox_sync`
//! / `imap::sync::run_mailbox_sync` for the actual sync work and on the
//! teacher's claim/heartbeat loop shape for the reconnect/backoff skeleton,
//! generalized into a long-lived in-process watcher the teacher's one-shot
//! CLI sync never needed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::IntervalSettings;
use crate::domain::{
    GmailPushStatus, IncomingConnector, IncomingConnectorId, IncomingProvider, SyncEventType, UserId,
    MAX_WATCH_MAILBOXES,
};
use crate::error::ServiceError;
use crate::events::EventBus;
use crate::gmail::path::normalize_gmail_mailbox_path;
use crate::gmail::sync::{run_gmail_mailbox_sync, GmailSyncDeps};
use crate::imap::client::{login_password, login_xoauth2, ImapClient};
use crate::imap::sync::{resolve_connection_params, run_mailbox_sync, ImapSyncDeps};
use crate::oauth::token_manager::{
    ensure_valid_google_access_token, GoogleTokenClient, TokenManagerError, TokenRefreshOutcome,
};
use crate::storage::queries::connectors;

/// Consecutive watch errors without an intervening success before the
/// circuit breaker trips and the loop ends (§4.I).
pub const MAX_CONSECUTIVE_ERRORS: u32 = 20;

pub struct IdleWatcherDeps {
    pub pool: sqlx::PgPool,
    pub event_bus: Arc<EventBus>,
    pub token_client: Arc<dyn GoogleTokenClient>,
    pub gmail_deps: Arc<GmailSyncDeps>,
    pub imap_deps: Arc<ImapSyncDeps>,
    pub intervals: IntervalSettings,
}

fn is_pure_gmail_api(connector: &IncomingConnector) -> bool {
    matches!(connector.provider, IncomingProvider::Gmail) && !connector.sync_settings.gmail_imap
}

struct WatcherShared {
    user_id: UserId,
    connector_id: IncomingConnectorId,
    mailbox: String,
    started_at: DateTime<Utc>,
    last_activity_at: Mutex<DateTime<Utc>>,
    reconnect_count: AtomicU32,
    error_count: AtomicU32,
    last_error: Mutex<Option<String>>,
    stop: AtomicBool,
    stopped: AtomicBool,
}

impl WatcherShared {
    fn new(user_id: UserId, connector_id: IncomingConnectorId, mailbox: String) -> Self {
        Self {
            user_id,
            connector_id,
            mailbox,
            started_at: Utc::now(),
            last_activity_at: Mutex::new(Utc::now()),
            reconnect_count: AtomicU32::new(0),
            error_count: AtomicU32::new(0),
            last_error: Mutex::new(None),
            stop: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    async fn touch(&self) {
        *self.last_activity_at.lock().await = Utc::now();
    }

    async fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity_at.lock().await
    }
}

struct WatcherEntry {
    shared: Arc<WatcherShared>,
    handle: tokio::task::JoinHandle<()>,
}

/// `connectorId:mailbox` -> running watcher. A second `start` for the same
/// key is a no-op (§4.I).
#[derive(Default)]
pub struct IdleWatcherMap {
    entries: Mutex<HashMap<String, WatcherEntry>>,
}

fn watch_key(connector_id: &IncomingConnectorId, mailbox: &str) -> String {
    format!("{}:{mailbox}", connector_id.0)
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_ms = 1000u64.saturating_mul(1u64 << attempt.min(10));
    let capped_ms = base_ms.clamp(8_000, 120_000);
    let jitter_ms = rand::thread_rng().gen_range(0..=(capped_ms / 5));
    Duration::from_millis(capped_ms + jitter_ms)
}

impl IdleWatcherMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_running(&self, connector_id: &IncomingConnectorId, mailbox: &str) -> bool {
        self.entries.lock().await.contains_key(&watch_key(connector_id, mailbox))
    }

    /// Starts a watcher for `(connector, mailbox)`. No-op if one is already
    /// running for that key.
    pub async fn start(&self, deps: Arc<IdleWatcherDeps>, connector: IncomingConnector, mailbox: String) {
        let key = watch_key(&connector.id, &mailbox);
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&key) {
            return;
        }

        if is_pure_gmail_api(&connector) {
            let push = &connector.sync_settings.gmail_push;
            if push.enabled && push.status == GmailPushStatus::Watching {
                deps.event_bus
                    .emit_sync_event(
                        &connector.user_id,
                        &connector.id,
                        SyncEventType::SyncInfo,
                        serde_json::json!({ "event": "watch_skipped_push_active", "mailbox": mailbox }),
                    )
                    .await
                    .ok();
                return;
            }
        }

        let shared = Arc::new(WatcherShared::new(connector.user_id.clone(), connector.id.clone(), mailbox.clone()));
        let loop_shared = shared.clone();
        let loop_deps = deps.clone();
        let loop_connector = connector.clone();
        let loop_mailbox = mailbox.clone();

        let handle = tokio::spawn(async move {
            if is_pure_gmail_api(&loop_connector) {
                run_gmail_api_loop(loop_deps, loop_connector, loop_mailbox, loop_shared).await;
            } else {
                run_imap_loop(loop_deps, loop_connector, loop_mailbox, loop_shared).await;
            }
        });

        entries.insert(key, WatcherEntry { shared, handle });
    }

    /// Sets `stop`, waits for the loop to observe it and mark `stopped`,
    /// then removes the entry (§4.I).
    pub async fn stop(&self, connector_id: &IncomingConnectorId, mailbox: &str) -> bool {
        let key = watch_key(connector_id, mailbox);
        let entry = { self.entries.lock().await.remove(&key) };
        let Some(entry) = entry else { return false };

        entry.shared.stop.store(true, Ordering::SeqCst);
        let _ = entry.handle.await;
        true
    }

    pub async fn stop_all(&self) {
        let keys: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        for key in keys {
            if let Some((connector_id, mailbox)) = key.split_once(':') {
                self.stop(&IncomingConnectorId(connector_id.to_string()), mailbox).await;
            }
        }
    }

    /// `runIdleWatchdog()` (§4.I): restarts any watcher whose
    /// `lastActivityAt` has gone stale.
    pub async fn run_watchdog(&self, deps: &Arc<IdleWatcherDeps>, connectors_by_id: &HashMap<String, IncomingConnector>) {
        let threshold = deps.intervals.idle_watchdog_threshold();
        let stale: Vec<(IncomingConnectorId, String)> = {
            let entries = self.entries.lock().await;
            let mut out = Vec::new();
            for entry in entries.values() {
                let age = Utc::now().signed_duration_since(entry.shared.last_activity().await);
                if age.to_std().map(|d| d > threshold).unwrap_or(false) {
                    out.push((entry.shared.connector_id.clone(), entry.shared.mailbox.clone()));
                }
            }
            out
        };

        for (connector_id, mailbox) in stale {
            warn!(connector_id = %connector_id.0, mailbox = %mailbox, "idle-watchdog-stale");
            self.stop(&connector_id, &mailbox).await;
            match connectors_by_id.get(&connector_id.0) {
                Some(connector) => {
                    self.start(deps.clone(), connector.clone(), mailbox.clone()).await;
                    info!(connector_id = %connector_id.0, mailbox = %mailbox, "idle-watchdog-restarted");
                }
                None => {
                    warn!(connector_id = %connector_id.0, mailbox = %mailbox, "idle-watchdog-restart-failed");
                }
            }
        }
    }
}

async fn run_gmail_api_loop(deps: Arc<IdleWatcherDeps>, connector: IncomingConnector, mailbox: String, shared: Arc<WatcherShared>) {
    let poll_interval = deps.intervals.idle_interval.max(Duration::from_secs(2));
    let mut consecutive_errors = 0u32;

    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        match run_gmail_mailbox_sync(&deps.gmail_deps, &connector, &mailbox, None).await {
            Ok(_) => {
                shared.touch().await;
                if consecutive_errors > 0 {
                    consecutive_errors = 0;
                    shared.error_count.store(0, Ordering::SeqCst);
                }
            }
            Err(err) => {
                consecutive_errors += 1;
                shared.error_count.fetch_add(1, Ordering::SeqCst);
                *shared.last_error.lock().await = Some(err.to_string());
                deps.event_bus
                    .emit_sync_event(
                        &shared.user_id,
                        &shared.connector_id,
                        SyncEventType::SyncError,
                        serde_json::json!({ "mailbox": mailbox, "message": err.to_string() }),
                    )
                    .await
                    .ok();

                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    deps.event_bus
                        .emit_sync_event(
                            &shared.user_id,
                            &shared.connector_id,
                            SyncEventType::SyncError,
                            serde_json::json!({ "mailbox": mailbox, "event": "watch_circuit_breaker_tripped" }),
                        )
                        .await
                        .ok();
                    break;
                }
            }
        }

        tokio::time::sleep(poll_interval).await;
    }

    shared.stopped.store(true, Ordering::SeqCst);
}

/// Forces an access-token refresh ahead of a reconnect attempt when the
/// error looks auth-related and the connector is Gmail-OAuth (§4.I).
/// Persists a rotated (or nulled, on revocation) token and updates
/// `connector` in place so the caller's next reconnect attempt actually
/// uses it instead of retrying with the same stale credentials.
async fn maybe_force_refresh(deps: &IdleWatcherDeps, connector: &mut IncomingConnector, err: &ServiceError) {
    if !connector.is_gmail_like() {
        return;
    }
    let looks_auth_like = matches!(err, ServiceError::ReconnectRequired(_)) || err.to_string().to_ascii_lowercase().contains("auth");
    if !looks_auth_like {
        return;
    }

    let next_config = match ensure_valid_google_access_token(deps.token_client.as_ref(), connector.auth_config.clone(), true).await {
        Ok(TokenRefreshOutcome::Refreshed(cfg)) => Some(cfg),
        Ok(TokenRefreshOutcome::Unchanged(_)) => None,
        Err(TokenManagerError::MustReconnect(_, Some(revoked))) => Some(revoked),
        Err(_) => None,
    };

    if let Some(cfg) = next_config {
        if connectors::update_incoming_auth_config(&deps.pool, &connector.id, &cfg).await.is_ok() {
            connector.auth_config = cfg;
        }
    }
}

async fn run_imap_loop(deps: Arc<IdleWatcherDeps>, mut connector: IncomingConnector, mailbox: String, shared: Arc<WatcherShared>) {
    let canonical = if connector.is_gmail_like() {
        normalize_gmail_mailbox_path(&mailbox)
    } else {
        mailbox.clone()
    };

    let idle_timeout = deps.intervals.idle_interval.max(Duration::from_secs(2));
    let safety_net = deps.intervals.idle_safety_net_interval();
    let mut consecutive_errors = 0u32;

    'outer: loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        let session_result = imap_watch_session(&deps, &connector, &canonical, &shared, idle_timeout, safety_net).await;

        match session_result {
            Ok(()) => break,
            Err(err) => {
                consecutive_errors += 1;
                shared.error_count.fetch_add(1, Ordering::SeqCst);
                *shared.last_error.lock().await = Some(err.to_string());
                deps.event_bus
                    .emit_sync_event(
                        &shared.user_id,
                        &shared.connector_id,
                        SyncEventType::SyncError,
                        serde_json::json!({ "mailbox": canonical, "message": err.to_string() }),
                    )
                    .await
                    .ok();

                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    deps.event_bus
                        .emit_sync_event(
                            &shared.user_id,
                            &shared.connector_id,
                            SyncEventType::SyncError,
                            serde_json::json!({ "mailbox": canonical, "event": "watch_circuit_breaker_tripped" }),
                        )
                        .await
                        .ok();
                    break 'outer;
                }

                maybe_force_refresh(&deps, &mut connector, &err).await;

                let attempt = shared.reconnect_count.fetch_add(1, Ordering::SeqCst);
                let backoff = backoff_with_jitter(attempt);
                tokio::time::sleep(backoff).await;

                deps.event_bus
                    .emit_sync_event(
                        &shared.user_id,
                        &shared.connector_id,
                        SyncEventType::SyncInfo,
                        serde_json::json!({
                            "event": "watch_reconnected",
                            "mailbox": canonical,
                            "reconnectCount": attempt + 1,
                            "backoffMs": backoff.as_millis() as u64,
                        }),
                    )
                    .await
                    .ok();
                continue;
            }
        }
    }

    shared.error_count.store(0, Ordering::SeqCst);
    shared.stopped.store(true, Ordering::SeqCst);
}

/// One long-lived IMAP connection: initial sync, then alternate `IDLE` with
/// conditional follow-up syncs, with an independent safety-net ticker that
/// syncs regardless of what `IDLE` returns (§4.I). Returns `Ok(())` only
/// when `stop` was observed; any IMAP error returns `Err` so the caller can
/// reconnect with backoff.
async fn imap_watch_session(
    deps: &IdleWatcherDeps,
    connector: &IncomingConnector,
    canonical: &str,
    shared: &Arc<WatcherShared>,
    idle_timeout: Duration,
    safety_net: Duration,
) -> Result<(), ServiceError> {
    let conn = resolve_connection_params(&deps.pool, deps.token_client.as_ref(), connector).await?;
    let session = if conn.use_xoauth2 {
        login_xoauth2(&conn.endpoint, &conn.username, &conn.secret).await?
    } else {
        login_password(&conn.endpoint, &conn.username, &conn.secret).await?
    };
    let imap = ImapClient::new(session);
    imap.select(canonical).await?;

    run_mailbox_sync(&deps.imap_deps, connector, canonical).await?;
    shared.touch().await;

    let mut last_safety_net = tokio::time::Instant::now();
    let mut sync_in_flight = false;

    loop {
        if shared.stop.load(Ordering::SeqCst) {
            let _ = imap.logout().await;
            return Ok(());
        }

        let has_changes = imap.idle_wait(idle_timeout).await?;
        shared.touch().await;

        let due_for_safety_net = last_safety_net.elapsed() >= safety_net;

        if (has_changes || due_for_safety_net) && !sync_in_flight {
            sync_in_flight = true;
            let outcome = run_mailbox_sync(&deps.imap_deps, connector, canonical).await;
            sync_in_flight = false;
            outcome?;
            shared.touch().await;
            if due_for_safety_net {
                last_safety_net = tokio::time::Instant::now();
            }
        }
    }
}

/// Sanitizes `syncSettings.watchMailboxes` (§4.I): trim, drop empty, drop
/// control characters, dedupe, cap to `MAX_WATCH_MAILBOXES`, canonicalize
/// for Gmail-like connectors.
pub fn sanitize_watch_mailboxes(raw: &[String], is_gmail_like: bool) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for entry in raw {
        let trimmed = entry.trim();
        if trimmed.is_empty() || trimmed.chars().any(|c| c.is_control()) {
            continue;
        }
        let canonical = if is_gmail_like {
            normalize_gmail_mailbox_path(trimmed)
        } else {
            trimmed.to_string()
        };
        if seen.insert(canonical.clone()) {
            out.push(canonical);
        }
        if out.len() >= MAX_WATCH_MAILBOXES {
            break;
        }
    }

    out
}

/// `resumeConfiguredIdleWatches()` (§4.I): for every active connector,
/// sanitize its configured mailboxes and start a watcher per entry. No-op
/// for a connector whose `syncSettings.useIdle` is `false`.
pub async fn resume_configured_idle_watches(deps: Arc<IdleWatcherDeps>, map: &IdleWatcherMap) -> Result<usize, ServiceError> {
    let active = connectors::list_all_active_incoming(&deps.pool)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?;

    let mut started = 0;
    for connector in active {
        if !connector.sync_settings.use_idle {
            continue;
        }
        let mailboxes = sanitize_watch_mailboxes(&connector.sync_settings.watch_mailboxes, connector.is_gmail_like());
        for mailbox in mailboxes {
            map.start(deps.clone(), connector.clone(), mailbox).await;
            started += 1;
        }
    }

    Ok(started)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_trims_dedupes_and_caps() {
        let raw = vec![
            "  INBOX ".to_string(),
            "INBOX".to_string(),
            "".to_string(),
            "work\u{0007}".to_string(),
            "Archive".to_string(),
        ];
        let out = sanitize_watch_mailboxes(&raw, false);
        assert_eq!(out, vec!["INBOX".to_string(), "Archive".to_string()]);
    }

    #[test]
    fn sanitize_caps_at_max_watch_mailboxes() {
        let raw: Vec<String> = (0..40).map(|i| format!("box-{i}")).collect();
        let out = sanitize_watch_mailboxes(&raw, false);
        assert_eq!(out.len(), MAX_WATCH_MAILBOXES);
    }

    #[test]
    fn sanitize_canonicalizes_gmail_aliases() {
        let raw = vec!["[Gmail]/All Mail".to_string()];
        let out = sanitize_watch_mailboxes(&raw, true);
        assert_eq!(out, vec!["ALL".to_string()]);
    }

    #[test]
    fn backoff_is_clamped_and_grows() {
        let small = backoff_with_jitter(0);
        let large = backoff_with_jitter(10);
        assert!(small.as_millis() >= 8_000);
        assert!(large.as_millis() <= 144_000);
    }
}
