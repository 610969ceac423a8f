//! Message and attachment domain types (§3 `Message`, `Attachment`).
//!
//! Extends the teacher's `domain/email.rs` `Email`/`Attachment` pair with
//! the provider-bookkeeping fields (`uid`, `gmailMessageId`, `gmailThreadId`,
//! `mailboxUidValidity`, `providerMeta`) and the attachment scan-verdict
//! fields the teacher's client-only model never needed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AttachmentId, IncomingConnectorId, MessageId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub email: String,
    pub name: Option<String>,
}

impl Address {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    pub fn display(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => format!("{name} <{}>", self.email),
            _ => self.email.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderMeta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gmail_label_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gmail_history_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub incoming_connector_id: IncomingConnectorId,
    pub folder_path: String,
    pub uid: Option<u32>,
    pub gmail_message_id: Option<String>,
    pub gmail_thread_id: Option<String>,
    pub thread_id: Option<String>,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references_header: Option<String>,
    pub subject: String,
    pub from_header: Address,
    pub to_header: Vec<Address>,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_starred: bool,
    pub flags: Vec<String>,
    pub mailbox_uid_validity: Option<u32>,
    pub raw_blob_key: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub provider_meta: ProviderMeta,
}

impl Message {
    pub fn has_body(&self) -> bool {
        self.body_text.is_some() || self.body_html.is_some()
    }

    pub fn has_raw(&self) -> bool {
        self.raw_blob_key.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Processing,
    Clean,
    Infected,
    SizeSkipped,
    Disabled,
    Failed,
    Missing,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub message_id: MessageId,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub inline: bool,
    pub content_id: Option<String>,
    pub blob_key: Option<String>,
    pub scan_status: ScanStatus,
    pub scan_result: Option<String>,
}

/// Limits from §6's input-limits table.
pub const MAX_SUBJECT_LEN: usize = 998;
pub const MAX_BODY_TEXT_LEN: usize = 200_000;
pub const MAX_BODY_HTML_LEN: usize = 500_000;
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;
pub const MAX_TOTAL_ATTACHMENT_BYTES: u64 = 25 * 1024 * 1024;
pub const MAX_ATTACHMENTS: usize = 20;
pub const MAX_MAILBOX_PATH_LEN: usize = 512;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_prefers_name() {
        let a = Address {
            email: "a@example.com".into(),
            name: Some("Alice".into()),
        };
        assert_eq!(a.display(), "Alice <a@example.com>");
    }

    #[test]
    fn address_display_falls_back_to_email() {
        assert_eq!(Address::new("a@example.com").display(), "a@example.com");
    }
}
