//! `makeSendRequestHash` (§4.L): a SHA-256 digest over a canonicalized
//! JSON view of the send request, so retries with the same logical
//! payload collide in the idempotency ledger even if field order differs.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::domain::{IdentityId, SendPayload};

/// Recipients are order-independent for hashing purposes (§4.K dedupes
/// them case-insensitively before this point); everything else is taken
/// verbatim from the payload that's about to be sent.
pub fn make_send_request_hash(identity_id: &IdentityId, payload: &SendPayload) -> String {
    let canonical = serde_json::json!({
        "identityId": identity_id.0,
        "to": sorted_addresses(&payload.to),
        "cc": sorted_addresses(&payload.cc),
        "bcc": sorted_addresses(&payload.bcc),
        "subject": payload.subject,
        "bodyText": payload.body_text,
        "bodyHtml": payload.body_html,
        "attachments": payload.attachments.iter().map(|a| serde_json::json!({
            "filename": a.filename,
            "contentType": a.content_type,
            "inline": a.inline,
            "contentId": a.content_id,
            "size": a.data.len(),
        })).collect::<Vec<_>>(),
        "inReplyTo": payload.in_reply_to,
        "references": payload.references,
        "threadId": payload.thread_id,
    });

    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    STANDARD.encode(digest)
}

fn sorted_addresses(addrs: &[crate::domain::Address]) -> Vec<String> {
    let mut out: Vec<String> = addrs.iter().map(|a| a.email.to_lowercase()).collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Address;

    fn payload() -> SendPayload {
        SendPayload {
            to: vec![Address::new("a@example.com")],
            cc: vec![],
            bcc: vec![],
            subject: "hi".into(),
            body_text: Some("hello".into()),
            body_html: None,
            attachments: vec![],
            in_reply_to: None,
            references: None,
            thread_id: None,
        }
    }

    #[test]
    fn identical_payloads_hash_identically() {
        let id: IdentityId = "identity-1".into();
        assert_eq!(make_send_request_hash(&id, &payload()), make_send_request_hash(&id, &payload()));
    }

    #[test]
    fn different_subjects_hash_differently() {
        let id: IdentityId = "identity-1".into();
        let mut other = payload();
        other.subject = "bye".into();
        assert_ne!(make_send_request_hash(&id, &payload()), make_send_request_hash(&id, &other));
    }

    #[test]
    fn recipient_order_does_not_affect_hash() {
        let id: IdentityId = "identity-1".into();
        let mut a = payload();
        a.to = vec![Address::new("z@example.com"), Address::new("a@example.com")];
        let mut b = payload();
        b.to = vec![Address::new("a@example.com"), Address::new("z@example.com")];
        assert_eq!(make_send_request_hash(&id, &a), make_send_request_hash(&id, &b));
    }
}
