//! Incoming/outgoing connector domain types.
//!
//! Grounded on the teacher's `domain/account.rs` tagged-`ProviderConfig`
//! pattern, generalized from a single account entity into the spec's split
//! incoming/outgoing connectors with a typed `AuthConfig` sum type in place
//! of the original's `any`-typed auth blob.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{IncomingConnectorId, OutgoingConnectorId, UserId};

/// Provider family for an incoming connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncomingProvider {
    Imap,
    Gmail,
}

/// Provider family for an outgoing connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutgoingProvider {
    Smtp,
    Gmail,
}

/// Replaces the original's `authConfig: any` (see SPEC_FULL.md §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    Password {
        user: String,
        pass: String,
    },
    #[serde(rename = "oauth2")]
    OAuth2 {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_secret: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        access_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
    },
}

impl AuthConfig {
    pub fn is_oauth2(&self) -> bool {
        matches!(self, AuthConfig::OAuth2 { .. })
    }
}

/// TLS mode for an outgoing SMTP connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    Ssl,
    Starttls,
    None,
}

/// `[Gmail]/...` push-watch configuration, nested in `SyncSettings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailPush {
    pub enabled: bool,
    pub status: GmailPushStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    pub topic_name: String,
    pub webhook_audience: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GmailPushStatus {
    Disabled,
    Watching,
    Expired,
    Error,
}

impl Default for GmailPush {
    fn default() -> Self {
        Self {
            enabled: false,
            status: GmailPushStatus::Disabled,
            history_id: None,
            expiration: None,
            topic_name: String::new(),
            webhook_audience: String::new(),
        }
    }
}

/// Maximum number of mailboxes a connector may watch (§4.I).
pub const MAX_WATCH_MAILBOXES: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub watch_mailboxes: Vec<String>,
    #[serde(default)]
    pub gmail_imap: bool,
    #[serde(default)]
    pub gmail_push: GmailPush,
    #[serde(default)]
    pub gmail_api_bootstrapped: bool,
    /// Whether `resumeConfiguredIdleWatches` should start watchers for this
    /// connector at all (§4.I). Defaults on; a connector synced purely by
    /// periodic polling sets this to `false`.
    #[serde(default = "default_use_idle")]
    pub use_idle: bool,
}

fn default_use_idle() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            watch_mailboxes: Vec::new(),
            gmail_imap: false,
            gmail_push: GmailPush::default(),
            gmail_api_bootstrapped: false,
            use_idle: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorStatus {
    Active,
    Disabled,
    NeedsReconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingConnector {
    pub id: IncomingConnectorId,
    pub user_id: UserId,
    pub provider: IncomingProvider,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: bool,
    pub email_address: String,
    pub auth_config: AuthConfig,
    pub sync_settings: SyncSettings,
    pub status: ConnectorStatus,
}

impl IncomingConnector {
    /// A Gmail-like connector's `watchMailboxes` must contain only canonical
    /// labels (§3 invariant). Non-Gmail connectors are unconstrained here;
    /// canonicalization is the caller's job via `gmail::path`.
    pub fn is_gmail_like(&self) -> bool {
        matches!(self.provider, IncomingProvider::Gmail) || self.sync_settings.gmail_imap
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SentCopyMode {
    #[serde(rename = "imap_append")]
    ImapAppend,
    #[serde(rename = "imap_append_preferred")]
    ImapAppendPreferred,
    #[serde(rename = "none")]
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentCopyBehavior {
    pub mode: SentCopyMode,
    pub mailbox: Option<String>,
}

impl Default for SentCopyBehavior {
    fn default() -> Self {
        Self {
            mode: SentCopyMode::None,
            mailbox: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FromEnvelopeDefaults {
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingConnector {
    pub id: OutgoingConnectorId,
    pub user_id: UserId,
    pub provider: OutgoingProvider,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls_mode: TlsMode,
    pub from_address: String,
    pub auth_config: AuthConfig,
    pub from_envelope_defaults: FromEnvelopeDefaults,
    pub sent_copy_behavior: SentCopyBehavior,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_config_oauth2_roundtrips() {
        let cfg = AuthConfig::OAuth2 {
            client_id: Some("cid".into()),
            client_secret: None,
            access_token: Some("tok".into()),
            refresh_token: Some("ref".into()),
            expires_at: Some(Utc::now()),
            scope: None,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"type\":\"oauth2\""));
        let back: AuthConfig = serde_json::from_str(&json).unwrap();
        assert!(back.is_oauth2());
    }

    #[test]
    fn auth_config_password_roundtrips() {
        let cfg = AuthConfig::Password {
            user: "u".into(),
            pass: "p".into(),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: AuthConfig = serde_json::from_str(&json).unwrap();
        assert!(!back.is_oauth2());
    }

    #[test]
    fn gmail_like_detects_native_and_gmail_imap() {
        let base = IncomingConnector {
            id: "c1".into(),
            user_id: "u1".into(),
            provider: IncomingProvider::Imap,
            host: Some("imap.gmail.com".into()),
            port: Some(993),
            tls: true,
            email_address: "a@example.com".into(),
            auth_config: AuthConfig::Password {
                user: "a".into(),
                pass: "b".into(),
            },
            sync_settings: SyncSettings {
                gmail_imap: true,
                ..Default::default()
            },
            status: ConnectorStatus::Active,
        };
        assert!(base.is_gmail_like());
    }
}
