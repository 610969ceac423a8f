//! Integration tests for cross-module behavior that doesn't need a running
//! Postgres instance. Each module carries its own `#[cfg(test)]` unit tests
//! for single-function logic; these exercise a few seams where two modules'
//! outputs have to agree with each other.

use inletd::domain::{IncomingConnectorId, MessageId, UserId};
use inletd::gmail::path::normalize_gmail_mailbox_path;
use inletd::idle::sanitize_watch_mailboxes;
use pretty_assertions::assert_eq;

// ============================================================================
// Domain ID newtypes
// ============================================================================

#[test]
fn id_newtypes_compare_by_inner_string() {
    let a = MessageId::from("msg-1");
    let b = MessageId::from("msg-1".to_string());
    let c = MessageId::from("msg-2");

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.to_string(), "msg-1");
}

#[test]
fn different_id_kinds_are_distinct_types() {
    // These would not compile if `UserId` and `IncomingConnectorId` were
    // the same type, which is the point of the newtype wrappers.
    let user = UserId::from("u1");
    let connector = IncomingConnectorId::from("u1");

    assert_eq!(user.0, connector.0);
}

// ============================================================================
// Gmail path canonicalization <-> mailbox sanitization
// ============================================================================

#[test]
fn sanitize_watch_mailboxes_canonicalizes_gmail_aliases_consistently() {
    let raw = vec!["[Gmail]/Sent Mail".to_string(), "SENT MESSAGES".to_string()];
    let sanitized = sanitize_watch_mailboxes(&raw, true);

    // Both aliases canonicalize to the same target, so sanitizing for a
    // Gmail-like connector collapses them into one watch entry, matching
    // what `normalize_gmail_mailbox_path` would produce for either alias
    // on its own.
    assert_eq!(sanitized, vec![normalize_gmail_mailbox_path("[Gmail]/Sent Mail")]);
    assert_eq!(sanitized.len(), 1);
}

#[test]
fn sanitize_watch_mailboxes_leaves_plain_imap_paths_uncanonicalized() {
    let raw = vec!["INBOX.Work".to_string(), "inbox.work".to_string()];
    let sanitized = sanitize_watch_mailboxes(&raw, false);

    // Non-Gmail connectors get no case-folding, so these are kept distinct.
    assert_eq!(sanitized, vec!["INBOX.Work".to_string(), "inbox.work".to_string()]);
}

#[test]
fn sanitize_watch_mailboxes_drops_blank_and_control_entries() {
    let raw = vec!["  ".to_string(), "INBOX".to_string(), "bad\u{0007}mailbox".to_string()];
    let sanitized = sanitize_watch_mailboxes(&raw, false);

    assert_eq!(sanitized, vec!["INBOX".to_string()]);
}
