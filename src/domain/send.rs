//! Send payload, result, and idempotency ledger row (§3 `SendIdempotency`,
//! §4.K, §4.L).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{IdentityId, SendIdempotencyKey, UserId};
use super::message::Address;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingAttachment {
    pub filename: String,
    pub content_type: String,
    #[serde(with = "base64_serde")]
    pub data: Vec<u8>,
    pub inline: bool,
    pub content_id: Option<String>,
}

mod base64_serde {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendPayload {
    pub to: Vec<Address>,
    #[serde(default)]
    pub cc: Vec<Address>,
    #[serde(default)]
    pub bcc: Vec<Address>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    #[serde(default)]
    pub attachments: Vec<OutgoingAttachment>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResult {
    pub accepted: bool,
    pub message_id: String,
    pub thread_tag: Option<String>,
    pub sent_copy_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendIdempotency {
    pub user_id: UserId,
    pub idempotency_key: SendIdempotencyKey,
    pub identity_id: IdentityId,
    pub request_hash: String,
    pub status: SendStatus,
    pub attempts: u32,
    pub result: Option<SendResult>,
    pub error_message: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// §4.L: non-empty trimmed value, or a fresh UUID if absent/blank.
pub fn normalize_send_idempotency_key(v: Option<&str>) -> String {
    match v.map(str::trim) {
        Some(trimmed) if !trimmed.is_empty() => trimmed.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

/// §6 input limits relevant to sends.
pub const MAX_RECIPIENTS: usize = 100;
pub const MAX_LABELS_PER_MUTATION: usize = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_key_trims_and_keeps_nonblank() {
        assert_eq!(normalize_send_idempotency_key(Some("  abc  ")), "abc");
    }

    #[test]
    fn normalize_key_generates_uuid_when_blank() {
        let a = normalize_send_idempotency_key(Some("   "));
        let b = normalize_send_idempotency_key(None);
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
        assert!(uuid::Uuid::parse_str(&b).is_ok());
    }

    #[test]
    fn outgoing_attachment_base64_roundtrips() {
        let att = OutgoingAttachment {
            filename: "a.txt".into(),
            content_type: "text/plain".into(),
            data: vec![1, 2, 3, 4],
            inline: false,
            content_id: None,
        };
        let json = serde_json::to_string(&att).unwrap();
        let back: OutgoingAttachment = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, vec![1, 2, 3, 4]);
    }
}
