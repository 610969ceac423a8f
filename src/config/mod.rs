//! Operational configuration.
//!
//! Re-scoped from the teacher's `config::settings` UI/AI-preference tree
//! (Appearance/Ai/Notifications/Sync/Keybindings/Privacy) to the knobs
//! SPEC_FULL.md §5/§9 actually name for a headless worker process. Loaded
//! from environment variables the way the teacher's settings module loads
//! from a typed struct with `Default` impls per section.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub google: GoogleOAuthSettings,
    pub concurrency: ConcurrencySettings,
    pub intervals: IntervalSettings,
    pub push: PushSettings,
    pub allow_private_network_targets: bool,
    pub allow_insecure_mail_transport: bool,
    /// §4.G bootstrap mode: fetch metadata only at high concurrency and
    /// defer raw-body hydration to the background batch job.
    pub gmail_bootstrap_metadata_only: bool,
}

#[derive(Debug, Clone)]
pub struct GoogleOAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

impl Default for GoogleOAuthSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
        }
    }
}

/// §5 per-account bounded concurrency pools.
#[derive(Debug, Clone)]
pub struct ConcurrencySettings {
    pub gmail_bootstrap_concurrency: usize,
    pub gmail_sync_concurrency: usize,
    pub gmail_background_hydrate_concurrency: usize,
    pub source_fetch_batch_size: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            gmail_bootstrap_concurrency: 10,
            gmail_sync_concurrency: 4,
            gmail_background_hydrate_concurrency: 4,
            source_fetch_batch_size: 50,
        }
    }
}

fn clamp_concurrency(value: usize, default: usize) -> usize {
    if value == 0 {
        default
    } else {
        value.min(64)
    }
}

impl ConcurrencySettings {
    pub fn clamped(mut self) -> Self {
        self.gmail_bootstrap_concurrency = clamp_concurrency(self.gmail_bootstrap_concurrency, 10);
        self.gmail_sync_concurrency = clamp_concurrency(self.gmail_sync_concurrency, 4);
        self.gmail_background_hydrate_concurrency =
            clamp_concurrency(self.gmail_background_hydrate_concurrency, 4);
        self
    }
}

/// Claim/heartbeat/reconcile/timeout intervals (§4.F, §4.G, §4.H, §5).
#[derive(Debug, Clone)]
pub struct IntervalSettings {
    pub claim_stale: Duration,
    pub heartbeat_stale: Duration,
    pub full_reconcile_interval: Duration,
    pub operation_timeout: Duration,
    pub idle_interval: Duration,
    pub recent_reconcile_uid_window: u32,
    pub flag_sync_window: u32,
}

impl Default for IntervalSettings {
    fn default() -> Self {
        Self {
            claim_stale: Duration::from_secs(15 * 60),
            heartbeat_stale: Duration::from_secs(60),
            full_reconcile_interval: Duration::from_secs(6 * 60 * 60),
            operation_timeout: Duration::from_secs(120),
            idle_interval: Duration::from_secs(20 * 60),
            recent_reconcile_uid_window: 500,
            flag_sync_window: 200,
        }
    }
}

impl IntervalSettings {
    /// Heartbeat refresh cadence used by the background claim-keepalive
    /// task (§4.G): ~5-15s, clamped from a third of the stale threshold.
    pub fn heartbeat_refresh_interval(&self) -> Duration {
        let third = self.heartbeat_stale / 3;
        third.clamp(Duration::from_secs(5), Duration::from_secs(15))
    }

    /// IDLE safety-net interval: `max(idleInterval*3, 6s)` (§4.I).
    pub fn idle_safety_net_interval(&self) -> Duration {
        (self.idle_interval * 3).max(Duration::from_secs(6))
    }

    /// Watchdog staleness threshold (§4.I).
    pub fn idle_watchdog_threshold(&self) -> Duration {
        (self.idle_interval * 6)
            .max(self.claim_stale + self.heartbeat_stale)
            .max(Duration::from_secs(120))
    }

    /// `full_reconcile_interval` as a `chrono::Duration` for comparison
    /// against stored `DateTime<Utc>` watermarks (§4.G, §4.H).
    pub fn full_reconcile_interval_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.full_reconcile_interval)
            .unwrap_or_else(|_| chrono::Duration::hours(6))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PushSettings {
    pub webhook_audience: String,
    pub push_service_account_email: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            google: GoogleOAuthSettings::default(),
            concurrency: ConcurrencySettings::default(),
            intervals: IntervalSettings::default(),
            push: PushSettings::default(),
            allow_private_network_targets: false,
            allow_insecure_mail_transport: false,
            gmail_bootstrap_metadata_only: false,
        }
    }
}

impl Settings {
    /// Loads settings from environment variables, falling back to defaults
    /// for anything unset. Mirrors the teacher's pattern of a typed
    /// struct with sensible `Default`s rather than failing hard on missing
    /// optional knobs; `database_url` is the one field a real deployment
    /// must supply.
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("missing DATABASE_URL environment variable"))?;

        let mut settings = Settings {
            database_url,
            ..Settings::default()
        };

        if let Ok(id) = std::env::var("GOOGLE_CLIENT_ID") {
            settings.google.client_id = id;
        }
        if let Ok(secret) = std::env::var("GOOGLE_CLIENT_SECRET") {
            settings.google.client_secret = secret;
        }
        if let Ok(audience) = std::env::var("GMAIL_PUSH_WEBHOOK_AUDIENCE") {
            settings.push.webhook_audience = audience;
        }
        settings.allow_private_network_targets =
            std::env::var("ALLOW_PRIVATE_NETWORK_TARGETS").is_ok();
        settings.allow_insecure_mail_transport =
            std::env::var("ALLOW_INSECURE_MAIL_TRANSPORT").is_ok();
        settings.gmail_bootstrap_metadata_only =
            std::env::var("GMAIL_BOOTSTRAP_METADATA_ONLY").is_ok();
        settings.concurrency = settings.concurrency.clamped();

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_clamps_zero_to_default() {
        let s = ConcurrencySettings {
            gmail_bootstrap_concurrency: 0,
            ..ConcurrencySettings::default()
        }
        .clamped();
        assert_eq!(s.gmail_bootstrap_concurrency, 10);
    }

    #[test]
    fn heartbeat_refresh_interval_clamps_to_5_15s() {
        let intervals = IntervalSettings {
            heartbeat_stale: Duration::from_secs(3),
            ..IntervalSettings::default()
        };
        assert_eq!(intervals.heartbeat_refresh_interval(), Duration::from_secs(5));

        let intervals = IntervalSettings {
            heartbeat_stale: Duration::from_secs(300),
            ..IntervalSettings::default()
        };
        assert_eq!(intervals.heartbeat_refresh_interval(), Duration::from_secs(15));
    }

    #[test]
    fn idle_safety_net_is_at_least_6s() {
        let intervals = IntervalSettings {
            idle_interval: Duration::from_millis(500),
            ..IntervalSettings::default()
        };
        assert_eq!(intervals.idle_safety_net_interval(), Duration::from_secs(6));
    }
}
