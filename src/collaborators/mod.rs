//! Narrow trait seams for the out-of-scope external collaborators named in
//! SPEC_FULL.md §10: RFC-822 message parsing, blob storage, browser push
//! fan-out, and message threading. Real deployments wire a production
//! implementation from outside this crate; `mockall`-generated fakes back
//! the unit tests in the modules that consume these traits.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

use crate::domain::{Address, Attachment, Message};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Structured fields extracted from a raw RFC-822 byte stream. The parser
/// itself is out of scope (§1); this crate only consumes its output shape.
/// Grounded on the field set the teacher's `mail-parser`/`mailparse` calls
/// in `providers/email/imap.rs` and `gmail.rs` extract.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub subject: String,
    pub from: Address,
    pub to: Vec<Address>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[cfg_attr(test, mockall::automock)]
pub trait MessageParser: Send + Sync {
    fn parse(&self, raw: &[u8]) -> Result<ParsedMessage, ParseError>;
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob store error: {0}")]
    Other(String),
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BlobError>> + Send>>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError>;
    async fn get_stream(&self, key: &str) -> Result<ByteStream, BlobError>;
    /// Best-effort (§7): failures are logged, never propagated to callers
    /// that are mid-sync.
    async fn delete(&self, key: &str) -> Result<(), BlobError>;
}

#[async_trait]
pub trait PushFanout: Send + Sync {
    async fn notify(&self, user_id: &str, event: &crate::domain::SyncEvent);
}

/// Local label assignment (§1: "labels ... CRUD" is out of scope). The
/// action executor calls this when `applyThreadMessageActions` carries
/// `addLabelKeys`/`removeLabelKeys`; a real deployment wires a label store
/// that also feeds saved-search matching.
#[async_trait]
pub trait LabelCollaborator: Send + Sync {
    async fn apply_label_keys(&self, message_id: &crate::domain::MessageId, add: &[String], remove: &[String]);
}

/// Overrides Gmail's subject-greedy `threadId` with header-chain truth
/// (§4.G step 6, §4.H "re-thread if headers changed").
pub trait ThreadingCollaborator: Send + Sync {
    fn compute_thread_id(&self, message: &Message, related: &[Message]) -> String;
}

/// A header-chain threading fake good enough for unit tests: groups by
/// `in_reply_to`/`references` chain, falling back to the message's own id.
pub struct NaiveHeaderChainThreader;

impl ThreadingCollaborator for NaiveHeaderChainThreader {
    fn compute_thread_id(&self, message: &Message, related: &[Message]) -> String {
        if let Some(parent_id) = message.in_reply_to.as_deref() {
            if let Some(parent) = related.iter().find(|m| m.message_id == parent_id) {
                if let Some(tid) = &parent.thread_id {
                    return tid.clone();
                }
            }
        }
        message.thread_id.clone().unwrap_or_else(|| message.message_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProviderMeta;
    use chrono::Utc;

    fn msg(id: &str, in_reply_to: Option<&str>, thread_id: Option<&str>) -> Message {
        Message {
            id: id.into(),
            incoming_connector_id: "c1".into(),
            folder_path: "INBOX".into(),
            uid: None,
            gmail_message_id: None,
            gmail_thread_id: None,
            thread_id: thread_id.map(String::from),
            message_id: id.to_string(),
            in_reply_to: in_reply_to.map(String::from),
            references_header: None,
            subject: "s".into(),
            from_header: Address::new("a@example.com"),
            to_header: vec![],
            snippet: String::new(),
            received_at: Utc::now(),
            is_read: false,
            is_starred: false,
            flags: vec![],
            mailbox_uid_validity: None,
            raw_blob_key: None,
            body_text: None,
            body_html: None,
            provider_meta: ProviderMeta::default(),
        }
    }

    #[test]
    fn threader_inherits_parent_thread_id() {
        let parent = msg("parent", None, Some("thread-1"));
        let child = msg("child", Some("parent"), None);
        let threader = NaiveHeaderChainThreader;
        assert_eq!(threader.compute_thread_id(&child, &[parent]), "thread-1");
    }

    #[test]
    fn threader_falls_back_to_own_message_id() {
        let child = msg("child", None, None);
        let threader = NaiveHeaderChainThreader;
        assert_eq!(threader.compute_thread_id(&child, &[]), "child");
    }
}
