//! Enqueue helpers (§4.E), grounded on the teacher's `services` modules'
//! thin-wrapper-over-storage shape, adapted to build SQL against the
//! opaque `jobs`/`worker_heartbeats` tables instead of the teacher's
//! client-local email actions.

use chrono::Utc;
use sqlx::{PgPool, Row};

use crate::domain::{IncomingConnectorId, SyncStatus, UserId};
use crate::storage::queries::sync_states;
use crate::storage::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKeyMode {
    PreserveRunAt,
    UnsafeDedupe,
}

impl JobKeyMode {
    fn as_str(self) -> &'static str {
        match self {
            JobKeyMode::PreserveRunAt => "preserve_run_at",
            JobKeyMode::UnsafeDedupe => "unsafe_dedupe",
        }
    }
}

/// Maps `{low,normal,high}` to numeric buckets; higher priority is a more
/// negative number, matching the spec's ordering ("sends use -100,
/// high-priority sync -50").
fn priority_bucket(priority: Priority) -> i32 {
    match priority {
        Priority::Low => 10,
        Priority::Normal => 0,
        Priority::High => -50,
    }
}

pub const SEND_PRIORITY: i32 = -100;

pub struct JobQueue {
    pool: PgPool,
}

impl JobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `enqueue(task, payload, {jobKey, jobKeyMode, priority, maxAttempts})`.
    pub async fn enqueue(
        &self,
        task: &str,
        payload: serde_json::Value,
        job_key: Option<&str>,
        job_key_mode: JobKeyMode,
        priority: i32,
        max_attempts: i32,
    ) -> Result<i64> {
        match job_key {
            Some(key) if job_key_mode == JobKeyMode::UnsafeDedupe => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO jobs (task_identifier, payload, priority, max_attempts, job_key, job_key_mode)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (job_key) WHERE job_key IS NOT NULL
                    DO UPDATE SET payload = EXCLUDED.payload, priority = EXCLUDED.priority,
                                  run_at = now(), attempts = 0
                    RETURNING id
                    "#,
                )
                .bind(task)
                .bind(payload)
                .bind(priority)
                .bind(max_attempts)
                .bind(key)
                .bind(job_key_mode.as_str())
                .fetch_one(&self.pool)
                .await?;
                Ok(row.try_get("id")?)
            }
            Some(key) => {
                // preserve_run_at: leave `run_at` untouched on conflict so an
                // already-scheduled job isn't pushed back.
                let row = sqlx::query(
                    r#"
                    INSERT INTO jobs (task_identifier, payload, priority, max_attempts, job_key, job_key_mode)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (job_key) WHERE job_key IS NOT NULL
                    DO UPDATE SET payload = EXCLUDED.payload, priority = EXCLUDED.priority
                    RETURNING id
                    "#,
                )
                .bind(task)
                .bind(payload)
                .bind(priority)
                .bind(max_attempts)
                .bind(key)
                .bind(job_key_mode.as_str())
                .fetch_one(&self.pool)
                .await?;
                Ok(row.try_get("id")?)
            }
            None => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO jobs (task_identifier, payload, priority, max_attempts)
                    VALUES ($1, $2, $3, $4)
                    RETURNING id
                    "#,
                )
                .bind(task)
                .bind(payload)
                .bind(priority)
                .bind(max_attempts)
                .fetch_one(&self.pool)
                .await?;
                Ok(row.try_get("id")?)
            }
        }
    }

    async fn delete_job_key(&self, job_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE job_key = $1")
            .bind(job_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Row-count in the worker-heartbeat table within the last 30s; falls
    /// back to "has locked job rows recently" if that table doesn't exist
    /// yet (`42P01`, undefined_table).
    async fn has_active_worker(&self) -> Result<bool> {
        match sqlx::query("SELECT COUNT(*) AS n FROM worker_heartbeats WHERE last_seen_at > NOW() - interval '30 seconds'")
            .fetch_one(&self.pool)
            .await
        {
            Ok(row) => {
                let n: i64 = row.try_get("n")?;
                Ok(n > 0)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("42P01") => {
                let row = sqlx::query(
                    "SELECT COUNT(*) AS n FROM jobs WHERE locked_at > NOW() - interval '30 seconds'",
                )
                .fetch_one(&self.pool)
                .await?;
                let n: i64 = row.try_get("n")?;
                Ok(n > 0)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// `enqueueSyncWithOptions` (§4.E). Returns `false` when the guard
    /// suppresses the enqueue (already syncing within lease, or no active
    /// worker observed).
    pub async fn enqueue_sync_with_options(
        &self,
        user_id: &UserId,
        connector_id: &IncomingConnectorId,
        mailbox: &str,
        priority: Priority,
        gmail_history_id_hint: Option<&str>,
        claim_stale_secs: i64,
        heartbeat_stale_secs: i64,
    ) -> Result<bool> {
        let job_key = format!("sync:{}:{mailbox}", connector_id.0);
        self.delete_job_key(&job_key).await?;

        if let Some(state) = sync_states::get(&self.pool, connector_id, mailbox).await? {
            if state.status == SyncStatus::Syncing {
                let started_fresh = state
                    .sync_started_at
                    .map(|t| (Utc::now() - t).num_seconds() < claim_stale_secs)
                    .unwrap_or(false);
                let updated_fresh = (Utc::now() - state.updated_at).num_seconds() < heartbeat_stale_secs;
                if started_fresh && updated_fresh {
                    return Ok(false);
                }
            }
        }

        if !self.has_active_worker().await? {
            return Ok(false);
        }

        let payload = serde_json::json!({
            "userId": user_id.0,
            "connectorId": connector_id.0,
            "mailbox": mailbox,
            "gmailHistoryIdHint": gmail_history_id_hint,
        });

        self.enqueue(
            "sync",
            payload,
            Some(&job_key),
            JobKeyMode::PreserveRunAt,
            priority_bucket(priority),
            25,
        )
        .await?;
        Ok(true)
    }

    pub async fn enqueue_send(&self, user_id: &UserId, idempotency_key: &str, payload: serde_json::Value) -> Result<i64> {
        let job_key = format!("send:{}:{idempotency_key}", user_id.0);
        self.enqueue("send", payload, Some(&job_key), JobKeyMode::UnsafeDedupe, SEND_PRIORITY, 3)
            .await
    }

    pub async fn enqueue_attachment_scan(&self, message_id: &str, attachment_id: &str) -> Result<i64> {
        let job_key = format!("scan:{message_id}:{attachment_id}");
        let payload = serde_json::json!({ "messageId": message_id, "attachmentId": attachment_id });
        self.enqueue("attachment_scan", payload, Some(&job_key), JobKeyMode::UnsafeDedupe, 0, 25)
            .await
    }

    pub async fn enqueue_rules_replay(
        &self,
        user_id: &UserId,
        connector_id: &IncomingConnectorId,
        rule_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<i64> {
        let job_key = format!("rules:{}:{}:{}", user_id.0, connector_id.0, rule_id.unwrap_or("*"));
        let payload = serde_json::json!({
            "userId": user_id.0,
            "incomingConnectorId": connector_id.0,
            "ruleId": rule_id,
            "limit": limit,
            "offset": offset,
        });
        self.enqueue("rules_replay", payload, Some(&job_key), JobKeyMode::PreserveRunAt, 0, 1)
            .await
    }

    pub async fn enqueue_gmail_hydration(&self, user_id: &UserId, connector_id: &IncomingConnectorId, mailbox: &str) -> Result<i64> {
        let job_key = format!("gmail-hydrate:{}:{mailbox}", connector_id.0);
        let payload = serde_json::json!({
            "userId": user_id.0,
            "connectorId": connector_id.0,
            "mailbox": mailbox,
        });
        self.enqueue("gmail_hydrate", payload, Some(&job_key), JobKeyMode::PreserveRunAt, 0, 5)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_buckets_match_spec_ordering() {
        assert_eq!(priority_bucket(Priority::High), -50);
        assert_eq!(priority_bucket(Priority::Normal), 0);
        assert!(priority_bucket(Priority::Low) > priority_bucket(Priority::Normal));
        assert!(SEND_PRIORITY < priority_bucket(Priority::High));
    }

    #[test]
    fn job_key_mode_strings_match_spec_vocabulary() {
        assert_eq!(JobKeyMode::PreserveRunAt.as_str(), "preserve_run_at");
        assert_eq!(JobKeyMode::UnsafeDedupe.as_str(), "unsafe_dedupe");
    }
}
