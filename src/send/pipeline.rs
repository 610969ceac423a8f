//! Outbound send pipeline (§4.K), grounded on the teacher's
//! `providers/email/imap.rs::send_email`/`build_message` for RFC-822
//! composition and SMTP transport selection, generalized to also dispatch
//! through the Gmail API and to integrate with the idempotency ledger
//! (§4.L) the teacher's single-shot send never needed.

use std::sync::Arc;

use lettre::message::{header::ContentType, Attachment as LettreAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::{Credentials as SmtpCredentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as MimeMessage, Tokio1Executor};

use crate::config::Settings;
use crate::domain::{
    Address, AuthConfig, IdentityId, OutgoingConnector, OutgoingProvider, SendPayload, SendResult,
    SendStatus, SentCopyMode, TlsMode, UserId, MAX_RECIPIENTS,
};
use crate::error::ServiceError;
use crate::gmail::api::GmailApiClient;
use crate::imap::client::{login_password, login_xoauth2, ImapClient, ImapEndpoint};
use crate::jobs::queue::{JobQueue, Priority};
use crate::oauth::token_manager::{ensure_valid_google_access_token, GoogleTokenClient, TokenManagerError, TokenRefreshOutcome};
use crate::send::idempotency::make_send_request_hash;
use crate::storage::queries::{connectors, identities, send_idempotency};

const MAX_SEND_ATTEMPTS: u32 = 4;

pub struct SendPipelineDeps {
    pub pool: sqlx::PgPool,
    pub token_client: Arc<dyn GoogleTokenClient>,
    pub gmail_api: Arc<GmailApiClient>,
    pub jobs: Arc<JobQueue>,
    pub settings: Arc<Settings>,
}

fn dedupe_case_insensitive(addrs: &[Address]) -> Vec<Address> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for addr in addrs {
        let key = addr.email.to_lowercase();
        if seen.insert(key) {
            out.push(addr.clone());
        }
    }
    out
}

/// §4.K recipient validation: normalized, deduped, non-empty.
fn parse_envelope_recipients(payload: &SendPayload) -> Result<(Vec<Address>, Vec<Address>, Vec<Address>), ServiceError> {
    let to = dedupe_case_insensitive(&payload.to);
    let cc = dedupe_case_insensitive(&payload.cc);
    let bcc = dedupe_case_insensitive(&payload.bcc);

    if to.is_empty() && cc.is_empty() && bcc.is_empty() {
        return Err(ServiceError::validation("at least one recipient is required"));
    }

    let total = to.len() + cc.len() + bcc.len();
    if total > MAX_RECIPIENTS {
        return Err(ServiceError::validation(format!("too many recipients (max {MAX_RECIPIENTS})")));
    }

    Ok((to, cc, bcc))
}

fn to_mailbox(addr: &Address) -> Result<Mailbox, ServiceError> {
    let rendered = match &addr.name {
        Some(name) if !name.is_empty() => format!("{name} <{}>", addr.email),
        _ => addr.email.clone(),
    };
    rendered.parse().map_err(|e| ServiceError::validation(format!("invalid address {}: {e}", addr.email)))
}

/// Composes the RFC-822 MIME message. Inline attachments carry a
/// `Content-ID` and go in a `multipart/related` body alongside the text
/// part; regular attachments are siblings in a `multipart/mixed` envelope.
fn compose_message(
    from: &Address,
    reply_to: Option<&Address>,
    payload: &SendPayload,
    to: &[Address],
    cc: &[Address],
    bcc: &[Address],
) -> Result<MimeMessage, ServiceError> {
    let mut builder = MimeMessage::builder().from(to_mailbox(from)?).subject(&payload.subject);

    for addr in to {
        builder = builder.to(to_mailbox(addr)?);
    }
    for addr in cc {
        builder = builder.cc(to_mailbox(addr)?);
    }
    for addr in bcc {
        builder = builder.bcc(to_mailbox(addr)?);
    }
    if let Some(reply_to) = reply_to {
        builder = builder.reply_to(to_mailbox(reply_to)?);
    }
    if let Some(in_reply_to) = &payload.in_reply_to {
        builder = builder.in_reply_to(in_reply_to.clone());
    }
    if let Some(references) = &payload.references {
        builder = builder.references(references.clone());
    }

    let body_text = payload.body_text.clone().unwrap_or_default();
    let text_body = match &payload.body_html {
        Some(html) => MultiPart::alternative()
            .singlepart(SinglePart::plain(body_text))
            .singlepart(SinglePart::html(html.clone())),
        None => MultiPart::mixed().singlepart(SinglePart::plain(body_text)),
    };

    let (inline, regular): (Vec<_>, Vec<_>) = payload.attachments.iter().partition(|a| a.inline);

    let mut root = if inline.is_empty() {
        text_body
    } else {
        let mut related = MultiPart::related().multipart(text_body);
        for att in &inline {
            let content_type = ContentType::parse(&att.content_type).unwrap_or(ContentType::TEXT_PLAIN);
            let part = LettreAttachment::new_inline(att.content_id.clone().unwrap_or_else(|| att.filename.clone()))
                .body(att.data.clone(), content_type);
            related = related.singlepart(part);
        }
        related
    };

    if !regular.is_empty() {
        let mut mixed = MultiPart::mixed().multipart(root);
        for att in &regular {
            let content_type = ContentType::parse(&att.content_type).unwrap_or(ContentType::TEXT_PLAIN);
            let part = LettreAttachment::new(att.filename.clone()).body(att.data.clone(), content_type);
            mixed = mixed.singlepart(part);
        }
        root = mixed;
    }

    builder.multipart(root).map_err(|e| ServiceError::validation(format!("failed to build message: {e}")))
}

/// Resolves a usable access token for an SMTP+XOAUTH2 outgoing connector
/// (§4.K point 4), refreshing and persisting it the same way the incoming
/// sync drivers do for IMAP/Gmail-API connectors.
async fn resolve_outgoing_access_token(
    deps: &SendPipelineDeps,
    connector: &OutgoingConnector,
) -> Result<String, ServiceError> {
    let refreshed = match ensure_valid_google_access_token(deps.token_client.as_ref(), connector.auth_config.clone(), false).await {
        Ok(outcome) => outcome,
        Err(TokenManagerError::MustReconnect(detail, Some(revoked))) => {
            connectors::update_outgoing_auth_config(&deps.pool, &connector.id, &revoked)
                .await
                .map_err(|e| ServiceError::Other(e.into()))?;
            return Err(ServiceError::reconnect_required(detail));
        }
        Err(e) => return Err(ServiceError::reconnect_required(e.to_string())),
    };

    if let TokenRefreshOutcome::Refreshed(ref cfg) = refreshed {
        connectors::update_outgoing_auth_config(&deps.pool, &connector.id, cfg)
            .await
            .map_err(|e| ServiceError::Other(e.into()))?;
    }

    match refreshed.into_auth_config() {
        AuthConfig::OAuth2 { access_token: Some(tok), .. } => Ok(tok),
        _ => Err(ServiceError::reconnect_required("no access token available after refresh")),
    }
}

async fn smtp_send(
    deps: &SendPipelineDeps,
    connector: &OutgoingConnector,
    message: MimeMessage,
) -> Result<String, ServiceError> {
    let host = connector.host.as_deref().ok_or_else(|| ServiceError::validation("outgoing connector missing host"))?;
    let port = connector.port.unwrap_or(587);

    let (credentials, mechanism) = match &connector.auth_config {
        AuthConfig::Password { user, pass } => (SmtpCredentials::new(user.clone(), pass.clone()), None),
        AuthConfig::OAuth2 { .. } => {
            let access_token = resolve_outgoing_access_token(deps, connector).await?;
            (SmtpCredentials::new(connector.from_address.clone(), access_token), Some(Mechanism::Xoauth2))
        }
    };

    let builder = match connector.tls_mode {
        TlsMode::Ssl => AsyncSmtpTransport::<Tokio1Executor>::relay(host),
        TlsMode::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host),
        TlsMode::None => {
            if !deps.settings.allow_insecure_mail_transport {
                return Err(ServiceError::validation("insecure mail transport is disabled"));
            }
            Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host))
        }
    }
    .map_err(|e| ServiceError::Transient(format!("smtp relay setup failed: {e}")))?;

    let mut builder = builder.credentials(credentials).port(port);
    if let Some(mechanism) = mechanism {
        builder = builder.authentication(vec![mechanism]);
    }
    let mailer = builder.build();

    let response = mailer.send(message).await.map_err(|e| {
        if ServiceError::is_transient_message(&e.to_string()) {
            ServiceError::Transient(e.to_string())
        } else {
            ServiceError::ReconnectRequired(e.to_string())
        }
    })?;

    Ok(response.message().next().map(|s| s.to_string()).unwrap_or_else(|| format!("<sent-{}>", uuid::Uuid::new_v4())))
}

async fn gmail_send(
    deps: &SendPipelineDeps,
    incoming_connector_id: Option<&crate::domain::IncomingConnectorId>,
    connector: &OutgoingConnector,
    raw_message: &[u8],
    thread_id: Option<&str>,
) -> Result<(String, Option<String>), ServiceError> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let incoming_id = incoming_connector_id
        .ok_or_else(|| ServiceError::validation("gmail outgoing connector requires a linked incoming connector"))?;
    let incoming = connectors::get_incoming(&deps.pool, incoming_id)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?
        .ok_or_else(|| ServiceError::validation("linked incoming connector not found"))?;

    let access_token = crate::gmail::resolve_access_token(&deps.pool, deps.token_client.as_ref(), &incoming).await?;
    let raw_b64 = URL_SAFE_NO_PAD.encode(raw_message);

    let sent = deps.gmail_api.send_message(&access_token, &raw_b64, thread_id).await.map_err(|e| {
        if is_auth_like_gmail_error(&e) {
            ServiceError::reconnect_required(e.to_string())
        } else {
            ServiceError::Transient(e.to_string())
        }
    })?;

    let _ = connector;
    Ok((sent.id, Some(sent.thread_id)))
}

/// 401s and `invalid_grant` responses mean the stored access token is dead,
/// not that the request should simply be retried as-is (§4.K point 6).
fn is_auth_like_gmail_error(err: &crate::gmail::api::GmailApiError) -> bool {
    match err {
        crate::gmail::api::GmailApiError::Status { status, message } => {
            *status == 401 || message.to_ascii_lowercase().contains("invalid_grant")
        }
        _ => false,
    }
}

/// §4.K's thread resolution is Gmail-API only: `inReplyTo` against a
/// known message, falling back to the `references` tail, falling back to
/// the caller-supplied `threadId`.
async fn resolve_gmail_thread_id(pool: &sqlx::PgPool, payload: &SendPayload) -> Option<String> {
    if let Some(in_reply_to) = &payload.in_reply_to {
        if let Ok(Some(msg)) = crate::storage::queries::messages::find_by_message_id(pool, in_reply_to).await {
            if let Some(tid) = msg.gmail_thread_id {
                return Some(tid);
            }
        }
    }
    if let Some(refs) = &payload.references {
        if let Some(last) = refs.split_whitespace().last() {
            if let Ok(Some(msg)) = crate::storage::queries::messages::find_by_message_id(pool, last).await {
                if let Some(tid) = msg.gmail_thread_id {
                    return Some(tid);
                }
            }
        }
    }
    payload.thread_id.clone()
}

async fn append_sent_copy(
    deps: &SendPipelineDeps,
    incoming_connector: &crate::domain::IncomingConnector,
    mailbox: &str,
    raw_message: &[u8],
) -> Result<(), ServiceError> {
    let conn = crate::imap::sync::resolve_connection_params(&deps.pool, deps.token_client.as_ref(), incoming_connector).await?;
    let imap_endpoint: ImapEndpoint = conn.endpoint;
    let session = if conn.use_xoauth2 {
        login_xoauth2(&imap_endpoint, &conn.username, &conn.secret).await?
    } else {
        login_password(&imap_endpoint, &conn.username, &conn.secret).await?
    };
    let imap = ImapClient::new(session);
    let result = imap.append(mailbox, raw_message).await;
    let _ = imap.logout().await;
    result
}

/// `sendThroughConnector` (§4.K): validates ownership, composes, picks a
/// transport, retries transient failures up to `MAX_SEND_ATTEMPTS`, records
/// a best-effort sent copy, and finalizes the idempotency ledger row.
pub async fn send_through_connector(
    deps: &SendPipelineDeps,
    user_id: &UserId,
    identity_id: &IdentityId,
    idempotency_key: &str,
    payload: SendPayload,
) -> Result<SendResult, ServiceError> {
    let normalized_key = crate::domain::normalize_send_idempotency_key(Some(idempotency_key));
    let key: crate::domain::SendIdempotencyKey = normalized_key.into();

    let identity = identities::get_owned_by_user(&deps.pool, identity_id, user_id)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?
        .ok_or(ServiceError::NotFound)?;

    let outgoing = connectors::get_outgoing(&deps.pool, &identity.outgoing_connector_id)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?
        .ok_or_else(|| ServiceError::validation("identity has no usable outgoing connector"))?;
    if outgoing.user_id != *user_id {
        return Err(ServiceError::NotFound);
    }

    let request_hash = make_send_request_hash(identity_id, &payload);

    match send_idempotency::get_or_create(&deps.pool, user_id, &key, identity_id, &request_hash)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?
    {
        send_idempotency::GetOrCreateOutcome::IdentityMismatch => {
            return Err(ServiceError::conflict("idempotency key already used with a different identity"))
        }
        send_idempotency::GetOrCreateOutcome::RequestHashMismatch => {
            return Err(ServiceError::conflict("idempotency key already used with a different request body"))
        }
        send_idempotency::GetOrCreateOutcome::Existing { status: SendStatus::Succeeded, result: Some(result) } => {
            return Ok(result)
        }
        send_idempotency::GetOrCreateOutcome::Created
        | send_idempotency::GetOrCreateOutcome::Existing { .. } => {}
    }

    // `claim_processing` is the single CAS gate for `pending`/`failed`/
    // stale `processing` rows (§4.L, stale threshold 30s); a fresh
    // `processing` row simply fails to match and this call returns false.
    if !send_idempotency::claim_processing(&deps.pool, user_id, &key, identity_id)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?
    {
        return Err(ServiceError::conflict("send already in progress"));
    }

    let outcome = attempt_send(deps, &identity, &outgoing, &payload).await;

    match outcome {
        Ok(result) => {
            send_idempotency::finalize_success(&deps.pool, user_id, &key, &result)
                .await
                .map_err(|e| ServiceError::Other(e.into()))?;
            Ok(result)
        }
        Err(e) => {
            send_idempotency::finalize_failure(&deps.pool, user_id, &key, &e.to_string())
                .await
                .map_err(|e2| ServiceError::Other(e2.into()))?;
            Err(e)
        }
    }
}

/// Forces a token refresh ahead of the next retry after an auth-like send
/// failure (§4.K point 6), so the retry doesn't resubmit with the same
/// stale credential. For Gmail-API sends the live credential lives on the
/// linked incoming connector; for SMTP+XOAUTH2 it lives on `outgoing`
/// itself, which is updated in place so the caller's next attempt picks it
/// up without re-reading the database.
async fn force_refresh_before_retry(
    deps: &SendPipelineDeps,
    identity: &crate::domain::Identity,
    outgoing: &mut OutgoingConnector,
) -> Result<(), ServiceError> {
    match outgoing.provider {
        OutgoingProvider::Gmail => {
            let incoming_id = identity
                .sent_to_incoming_connector_id
                .as_ref()
                .ok_or_else(|| ServiceError::validation("gmail outgoing connector requires a linked incoming connector"))?;
            let incoming = connectors::get_incoming(&deps.pool, incoming_id)
                .await
                .map_err(|e| ServiceError::Other(e.into()))?
                .ok_or_else(|| ServiceError::validation("linked incoming connector not found"))?;
            match ensure_valid_google_access_token(deps.token_client.as_ref(), incoming.auth_config.clone(), true).await {
                Ok(outcome) => {
                    let cfg = outcome.into_auth_config();
                    connectors::update_incoming_auth_config(&deps.pool, &incoming.id, &cfg)
                        .await
                        .map_err(|e| ServiceError::Other(e.into()))?;
                    Ok(())
                }
                Err(TokenManagerError::MustReconnect(detail, Some(revoked))) => {
                    connectors::update_incoming_auth_config(&deps.pool, &incoming.id, &revoked)
                        .await
                        .map_err(|e| ServiceError::Other(e.into()))?;
                    Err(ServiceError::reconnect_required(detail))
                }
                Err(e) => Err(ServiceError::reconnect_required(e.to_string())),
            }
        }
        OutgoingProvider::Smtp => match &outgoing.auth_config {
            AuthConfig::OAuth2 { .. } => {
                match ensure_valid_google_access_token(deps.token_client.as_ref(), outgoing.auth_config.clone(), true).await {
                    Ok(outcome) => {
                        let cfg = outcome.into_auth_config();
                        connectors::update_outgoing_auth_config(&deps.pool, &outgoing.id, &cfg)
                            .await
                            .map_err(|e| ServiceError::Other(e.into()))?;
                        outgoing.auth_config = cfg;
                        Ok(())
                    }
                    Err(TokenManagerError::MustReconnect(detail, Some(revoked))) => {
                        connectors::update_outgoing_auth_config(&deps.pool, &outgoing.id, &revoked)
                            .await
                            .map_err(|e| ServiceError::Other(e.into()))?;
                        outgoing.auth_config = revoked;
                        Err(ServiceError::reconnect_required(detail))
                    }
                    Err(e) => Err(ServiceError::reconnect_required(e.to_string())),
                }
            }
            AuthConfig::Password { .. } => Err(ServiceError::reconnect_required("smtp password auth cannot be force-refreshed")),
        },
    }
}

async fn attempt_send(
    deps: &SendPipelineDeps,
    identity: &crate::domain::Identity,
    outgoing: &OutgoingConnector,
    payload: &SendPayload,
) -> Result<SendResult, ServiceError> {
    let mut outgoing = outgoing.clone();
    let (to, cc, bcc) = parse_envelope_recipients(payload)?;

    let from = Address { email: identity.email_address.clone(), name: Some(identity.display_name.clone()) };
    let reply_to = identity
        .reply_to
        .clone()
        .or_else(|| outgoing.from_envelope_defaults.reply_to.clone())
        .map(Address::new);

    let mut last_err = None;
    for attempt in 0..MAX_SEND_ATTEMPTS {
        let message = compose_message(&from, reply_to.as_ref(), payload, &to, &cc, &bcc)?;
        let raw_bytes = message.formatted();

        let send_result = match outgoing.provider {
            OutgoingProvider::Smtp => smtp_send(deps, &outgoing, message).await.map(|id| (id, None)),
            OutgoingProvider::Gmail => {
                let thread_id = resolve_gmail_thread_id(&deps.pool, payload).await;
                gmail_send(deps, identity.sent_to_incoming_connector_id.as_ref(), &outgoing, &raw_bytes, thread_id.as_deref())
                    .await
            }
        };

        match send_result {
            Ok((message_id, thread_tag)) => {
                let sent_copy_error = record_sent_copy(deps, identity, &outgoing, &raw_bytes).await.err();
                maybe_enqueue_sent_sync(deps, identity).await;
                return Ok(SendResult {
                    accepted: true,
                    message_id,
                    thread_tag,
                    sent_copy_error: sent_copy_error.map(|e| e.to_string()),
                });
            }
            Err(ServiceError::ReconnectRequired(msg)) if attempt + 1 < MAX_SEND_ATTEMPTS => {
                last_err = Some(ServiceError::ReconnectRequired(msg));
                if force_refresh_before_retry(deps, identity, &mut outgoing).await.is_err() {
                    break;
                }
                continue;
            }
            Err(ServiceError::ReconnectRequired(msg)) => {
                last_err = Some(ServiceError::ReconnectRequired(msg));
                break;
            }
            Err(e @ ServiceError::Transient(_)) if attempt + 1 < MAX_SEND_ATTEMPTS => {
                last_err = Some(e);
                tokio::time::sleep(std::time::Duration::from_millis(250 * 2u64.pow(attempt))).await;
                continue;
            }
            Err(e) => {
                last_err = Some(e);
                break;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| ServiceError::Transient("send failed with no recorded error".into())))
}

async fn record_sent_copy(
    deps: &SendPipelineDeps,
    identity: &crate::domain::Identity,
    outgoing: &OutgoingConnector,
    raw_message: &[u8],
) -> Result<(), ServiceError> {
    let mode = outgoing.sent_copy_behavior.mode;
    if mode == SentCopyMode::None {
        return Ok(());
    }

    let Some(incoming_id) = &identity.sent_to_incoming_connector_id else {
        return if mode == SentCopyMode::ImapAppend {
            Err(ServiceError::validation("sent-copy requires a linked incoming connector"))
        } else {
            Ok(())
        };
    };

    let incoming = connectors::get_incoming(&deps.pool, incoming_id)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?;
    let Some(incoming) = incoming else {
        return if mode == SentCopyMode::ImapAppend { Err(ServiceError::validation("linked incoming connector not found")) } else { Ok(()) };
    };

    let mailbox = outgoing.sent_copy_behavior.mailbox.clone().unwrap_or_else(|| "Sent".to_string());
    match append_sent_copy(deps, &incoming, &mailbox, raw_message).await {
        Ok(()) => Ok(()),
        Err(e) if mode == SentCopyMode::ImapAppendPreferred => {
            tracing::warn!(error = %e, "best-effort sent-copy append failed");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn maybe_enqueue_sent_sync(deps: &SendPipelineDeps, identity: &crate::domain::Identity) {
    let Some(incoming_id) = &identity.sent_to_incoming_connector_id else { return };
    let Ok(Some(incoming)) = connectors::get_incoming(&deps.pool, incoming_id).await else { return };
    let _ = deps
        .jobs
        .enqueue_sync_with_options(
            &identity.user_id,
            incoming_id,
            "SENT",
            Priority::Low,
            None,
            deps.settings.intervals.claim_stale.as_secs() as i64,
            deps.settings.intervals.heartbeat_stale.as_secs() as i64,
        )
        .await;
    let _ = incoming;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_is_case_insensitive() {
        let addrs = vec![Address::new("A@Example.com"), Address::new("a@example.com")];
        assert_eq!(dedupe_case_insensitive(&addrs).len(), 1);
    }

    #[test]
    fn rejects_when_no_recipients() {
        let payload = SendPayload {
            to: vec![],
            cc: vec![],
            bcc: vec![],
            subject: "s".into(),
            body_text: None,
            body_html: None,
            attachments: vec![],
            in_reply_to: None,
            references: None,
            thread_id: None,
        };
        assert!(parse_envelope_recipients(&payload).is_err());
    }
}
