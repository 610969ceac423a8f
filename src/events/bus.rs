//! `emitSyncEvent`/`listSyncEvents`/`waitForSyncEventSignal` (§4.D) plus
//! the shared `LISTEN` client that fans notifications out to in-process
//! waiters across a single worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::collaborators::PushFanout;
use crate::domain::{IncomingConnectorId, SyncEventId, SyncEventType, UserId};
use crate::storage::queries::events;
use crate::storage::Result;

/// Listener reconnect backoff (§4.D: "~200 ms test / ~1 s prod").
pub const LISTENER_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Default `waitForSyncEventSignal` timeout when the caller passes a
/// non-finite value (§4.D).
pub const WAIT_DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

const NOTIFY_CHANNEL: &str = "sync_events";

struct Notification {
    user_id: String,
    event_id: i64,
}

fn parse_notification(payload: &str) -> Option<Notification> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let user_id = value.get("userId")?.as_str()?.to_string();
    let event_id = value.get("eventId")?.as_i64()?;
    if event_id <= 0 {
        return None;
    }
    Some(Notification { user_id, event_id })
}

#[derive(Default)]
struct BusState {
    latest: HashMap<String, i64>,
    waiters: HashMap<String, Vec<oneshot::Sender<Option<i64>>>>,
}

impl BusState {
    fn record(&mut self, user_id: &str, event_id: i64) {
        let entry = self.latest.entry(user_id.to_string()).or_insert(0);
        if event_id > *entry {
            *entry = event_id;
        }
        if let Some(waiters) = self.waiters.remove(user_id) {
            for waiter in waiters {
                let _ = waiter.send(Some(event_id));
            }
        }
    }

    fn resolve_all_with_none(&mut self) {
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(None);
            }
        }
    }
}

pub struct EventBus {
    pool: PgPool,
    state: Arc<Mutex<BusState>>,
    push_fanout: Option<Arc<dyn PushFanout>>,
}

impl EventBus {
    pub fn new(pool: PgPool, push_fanout: Option<Arc<dyn PushFanout>>) -> Self {
        Self {
            pool,
            state: Arc::new(Mutex::new(BusState::default())),
            push_fanout,
        }
    }

    /// Spawns the shared `LISTEN` client. One per process; reconnects with
    /// bounded backoff and resolves all current waiters with `None` on
    /// disconnect (§4.D).
    pub fn spawn_listener(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.pool.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            loop {
                match PgListener::connect_with(&pool).await {
                    Ok(mut listener) => {
                        if let Err(err) = listener.listen(NOTIFY_CHANNEL).await {
                            warn!(error = %err, "failed to LISTEN on sync_events channel");
                            state.lock().await.resolve_all_with_none();
                            tokio::time::sleep(LISTENER_RECONNECT_BACKOFF).await;
                            continue;
                        }
                        loop {
                            match listener.recv().await {
                                Ok(notification) => {
                                    let Some(parsed) = parse_notification(notification.payload()) else {
                                        debug!("ignoring malformed sync_events notification");
                                        continue;
                                    };
                                    state.lock().await.record(&parsed.user_id, parsed.event_id);
                                }
                                Err(err) => {
                                    warn!(error = %err, "sync_events listener dropped");
                                    break;
                                }
                            }
                        }
                        state.lock().await.resolve_all_with_none();
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to connect sync_events listener");
                        state.lock().await.resolve_all_with_none();
                    }
                }
                tokio::time::sleep(LISTENER_RECONNECT_BACKOFF).await;
            }
        })
    }

    /// Inserts a row, updates `latest[userId]`, wakes in-process waiters,
    /// and best-effort fans out to push subscribers for push-eligible
    /// event types.
    pub async fn emit_sync_event(
        &self,
        user_id: &UserId,
        connector_id: &IncomingConnectorId,
        event_type: SyncEventType,
        payload: serde_json::Value,
    ) -> Result<SyncEventId> {
        let (id, _) = events::insert(&self.pool, user_id, connector_id, event_type, payload.clone()).await?;

        {
            let mut state = self.state.lock().await;
            state.record(&user_id.0, id.0);
        }

        if event_type.is_push_eligible() {
            if let Some(fanout) = &self.push_fanout {
                let event = crate::domain::SyncEvent {
                    id,
                    user_id: user_id.clone(),
                    incoming_connector_id: connector_id.clone(),
                    event_type,
                    payload,
                    created_at: chrono::Utc::now(),
                };
                fanout.notify(&user_id.0, &event).await;
            }
        }

        Ok(id)
    }

    pub async fn list_sync_events(
        &self,
        user_id: &UserId,
        since: i64,
        limit: u32,
    ) -> Result<Vec<crate::domain::SyncEvent>> {
        events::list_since(&self.pool, user_id, since, limit).await
    }

    /// Returns the first `eventId > since` observed, or `None` after
    /// `timeout` (defaulting to `WAIT_DEFAULT_TIMEOUT` when `timeout` is
    /// `None`, modeling the spec's "non-finite → ~1s fallback").
    pub async fn wait_for_sync_event_signal(
        &self,
        user_id: &UserId,
        since: i64,
        timeout: Option<Duration>,
    ) -> Option<i64> {
        let timeout = timeout.unwrap_or(WAIT_DEFAULT_TIMEOUT);

        let receiver = {
            let mut state = self.state.lock().await;
            if let Some(&latest) = state.latest.get(&user_id.0) {
                if latest > since {
                    return Some(latest);
                }
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(user_id.0.clone()).or_default().push(tx);
            rx
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => None,
            Err(_) => None,
        }
    }

    pub async fn prune_sync_events(&self, retention_days: i64, batch_size: i64, max_batches: u32) -> Result<u64> {
        events::prune_sync_events(&self.pool, retention_days, batch_size, max_batches).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_notifications_are_ignored() {
        assert!(parse_notification("not json").is_none());
        assert!(parse_notification(r#"{"userId":"u1"}"#).is_none());
        assert!(parse_notification(r#"{"userId":"u1","eventId":0}"#).is_none());
        assert!(parse_notification(r#"{"userId":"u1","eventId":-1}"#).is_none());
    }

    #[test]
    fn well_formed_notification_parses() {
        let n = parse_notification(r#"{"userId":"u1","eventId":42}"#).unwrap();
        assert_eq!(n.user_id, "u1");
        assert_eq!(n.event_id, 42);
    }

    #[tokio::test]
    async fn record_resolves_waiters_with_new_event_id() {
        let state = Arc::new(Mutex::new(BusState::default()));
        let (tx, rx) = oneshot::channel();
        state.lock().await.waiters.entry("u1".to_string()).or_default().push(tx);
        state.lock().await.record("u1", 7);
        assert_eq!(rx.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn resolve_all_with_none_drains_waiters() {
        let state = Arc::new(Mutex::new(BusState::default()));
        let (tx, rx) = oneshot::channel();
        state.lock().await.waiters.entry("u1".to_string()).or_default().push(tx);
        state.lock().await.resolve_all_with_none();
        assert_eq!(rx.await.unwrap(), None);
    }
}
