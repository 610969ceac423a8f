//! IMAP connection wrapper (§4.H, §6), grounded on the teacher's
//! `providers/email/imap.rs` `connect_tls`/`get_session`/`drain_stream`
//! plumbing, generalized to carry CONDSTORE `MODSEQ` fetch and a Gmail-IMAP
//! `XOAUTH2` login path the teacher's password-only client never needed.

use std::sync::Arc;

use async_imap::types::{Fetch, Flag, Name};
use async_imap::Authenticator;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::domain::Address;
use crate::error::ServiceError;

pub type ImapSession = async_imap::Session<Compat<TlsStream<TcpStream>>>;

#[derive(Debug, Clone)]
pub struct ImapEndpoint {
    pub host: String,
    pub port: u16,
}

struct XOAuth2 {
    user: String,
    access_token: String,
}

impl Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!("user={}\x01auth=Bearer {}\x01\x01", self.user, self.access_token)
    }
}

async fn connect_tls(endpoint: &ImapEndpoint) -> Result<Compat<TlsStream<TcpStream>>, ServiceError> {
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| ServiceError::Transient(format!("imap tcp connect failed: {e}")))?;

    let tls_config = ClientConfig::builder()
        .with_root_certificates(tokio_rustls::rustls::RootCertStore::from_iter(
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
        ))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = ServerName::try_from(endpoint.host.clone())
        .map_err(|e| ServiceError::validation(format!("invalid imap host: {e}")))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ServiceError::Transient(format!("imap tls handshake failed: {e}")))?;
    Ok(stream.compat())
}

/// Password/PLAIN login, for non-Gmail IMAP connectors (§6).
pub async fn login_password(endpoint: &ImapEndpoint, user: &str, pass: &str) -> Result<ImapSession, ServiceError> {
    let stream = connect_tls(endpoint).await?;
    let client = async_imap::Client::new(stream);
    client
        .login(user, pass)
        .await
        .map_err(|(e, _)| ServiceError::reconnect_required(format!("imap login failed: {e}")))
}

/// `XOAUTH2` login, Gmail-IMAP only (§6).
pub async fn login_xoauth2(endpoint: &ImapEndpoint, user: &str, access_token: &str) -> Result<ImapSession, ServiceError> {
    let stream = connect_tls(endpoint).await?;
    let client = async_imap::Client::new(stream);
    let auth = XOAuth2 {
        user: user.to_string(),
        access_token: access_token.to_string(),
    };
    client
        .authenticate("XOAUTH2", auth)
        .await
        .map_err(|(e, _)| ServiceError::reconnect_required(format!("imap xoauth2 auth failed: {e}")))
}

#[derive(Debug, Clone, Default)]
pub struct MailboxMeta {
    pub uid_validity: Option<u32>,
    pub uid_next: u32,
    pub exists: u32,
}

#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    pub modseq: Option<u64>,
    pub is_read: bool,
    pub is_starred: bool,
    pub internal_date: Option<DateTime<Utc>>,
    pub subject: Option<String>,
    pub from: Option<Address>,
    pub to: Vec<Address>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
}

fn parse_flags(fetch: &Fetch) -> (bool, bool) {
    let mut is_read = false;
    let mut is_starred = false;
    for flag in fetch.flags() {
        match flag {
            Flag::Seen => is_read = true,
            Flag::Flagged => is_starred = true,
            _ => {}
        }
    }
    (is_read, is_starred)
}

fn bytes_to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).to_string()
}

fn build_email_from_parts(mailbox: Option<&std::borrow::Cow<'_, [u8]>>, host: Option<&std::borrow::Cow<'_, [u8]>>) -> String {
    match (mailbox, host) {
        (Some(m), Some(h)) => format!("{}@{}", String::from_utf8_lossy(m), String::from_utf8_lossy(h)),
        (Some(m), None) => String::from_utf8_lossy(m).to_string(),
        _ => String::new(),
    }
}

fn envelope_addresses(addrs: Option<&Vec<async_imap::types::Address<'_>>>) -> Vec<Address> {
    addrs
        .map(|list| {
            list.iter()
                .map(|a| Address {
                    email: build_email_from_parts(a.mailbox.as_ref(), a.host.as_ref()),
                    name: a.name.as_ref().map(|n| bytes_to_string(n)),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn fetch_to_message(fetch: &Fetch) -> Option<FetchedMessage> {
    let uid = fetch.uid?;
    let envelope = fetch.envelope();
    let (is_read, is_starred) = parse_flags(fetch);

    let internal_date = fetch.internal_date().map(|d| d.with_timezone(&Utc));

    let mut from_list = envelope_addresses(envelope.and_then(|e| e.from.as_ref()));
    let to = envelope_addresses(envelope.and_then(|e| e.to.as_ref()));
    let subject = envelope.and_then(|e| e.subject.as_ref()).map(|s| bytes_to_string(s));
    let message_id = envelope.and_then(|e| e.message_id.as_ref()).map(|s| bytes_to_string(s));
    let in_reply_to = envelope.and_then(|e| e.in_reply_to.as_ref()).map(|s| bytes_to_string(s));

    Some(FetchedMessage {
        uid,
        modseq: fetch.modseq(),
        is_read,
        is_starred,
        internal_date,
        subject,
        from: if from_list.is_empty() { None } else { Some(from_list.remove(0)) },
        to,
        message_id,
        in_reply_to,
        references: None,
    })
}

/// Thin session wrapper. One connection per sync run (§4.H, §5).
pub struct ImapClient {
    session: Arc<Mutex<ImapSession>>,
}

impl ImapClient {
    pub fn new(session: ImapSession) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
        }
    }

    pub async fn select(&self, mailbox: &str) -> Result<MailboxMeta, ServiceError> {
        let mut session = self.session.lock().await;
        let mb = session
            .select(mailbox)
            .await
            .map_err(|e| ServiceError::Transient(format!("imap SELECT failed: {e}")))?;
        Ok(MailboxMeta {
            uid_validity: mb.uid_validity,
            uid_next: mb.uid_next.unwrap_or(0),
            exists: mb.exists,
        })
    }

    pub async fn search_all_uids(&self) -> Result<Vec<u32>, ServiceError> {
        let mut session = self.session.lock().await;
        let uids = session
            .uid_search("ALL")
            .await
            .map_err(|e| ServiceError::Transient(format!("imap SEARCH failed: {e}")))?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// `UID FETCH <range> (FLAGS INTERNALDATE ENVELOPE) [(CHANGEDSINCE n)]`.
    /// The `CHANGEDSINCE` modifier implicitly enables CONDSTORE on a server
    /// that supports it (RFC 7162 §3.1) without a prior explicit `ENABLE`.
    pub async fn fetch_metadata(&self, range: &str, changed_since: Option<u64>) -> Result<Vec<FetchedMessage>, ServiceError> {
        let items = match changed_since {
            Some(modseq) => format!("(FLAGS INTERNALDATE ENVELOPE) (CHANGEDSINCE {modseq})"),
            None => "(FLAGS INTERNALDATE ENVELOPE)".to_string(),
        };
        let mut session = self.session.lock().await;
        let stream = session
            .uid_fetch(range, &items)
            .await
            .map_err(|e| ServiceError::Transient(format!("imap FETCH failed: {e}")))?;
        let mut out = Vec::new();
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            let fetch = item.map_err(|e| ServiceError::Transient(format!("imap fetch stream error: {e}")))?;
            if let Some(msg) = fetch_to_message(&fetch) {
                out.push(msg);
            }
        }
        Ok(out)
    }

    pub async fn fetch_source(&self, uid: u32) -> Result<Vec<u8>, ServiceError> {
        let mut session = self.session.lock().await;
        let stream = session
            .uid_fetch(uid.to_string(), "(BODY[])")
            .await
            .map_err(|e| ServiceError::Transient(format!("imap FETCH BODY[] failed: {e}")))?;
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            let fetch = item.map_err(|e| ServiceError::Transient(format!("imap fetch stream error: {e}")))?;
            if let Some(body) = fetch.body() {
                return Ok(body.to_vec());
            }
        }
        Err(ServiceError::NotFound)
    }

    pub async fn list(&self) -> Result<Vec<(String, Vec<String>)>, ServiceError> {
        let mut session = self.session.lock().await;
        let stream = session
            .list(Some(""), Some("*"))
            .await
            .map_err(|e| ServiceError::Transient(format!("imap LIST failed: {e}")))?;
        let mut out = Vec::new();
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            let name: Name = item.map_err(|e| ServiceError::Transient(format!("imap LIST stream error: {e}")))?;
            let flags: Vec<String> = name.attributes().iter().map(|a| format!("{a:?}")).collect();
            out.push((name.name().to_string(), flags));
        }
        Ok(out)
    }

    /// `MOVE`, falling back to `COPY` + `STORE \Deleted` + `EXPUNGE` (same
    /// fallback order as the teacher's `archive`/`trash`).
    pub async fn uid_move(&self, uid: u32, dest: &str) -> Result<(), ServiceError> {
        let mut session = self.session.lock().await;
        let uid_str = uid.to_string();
        if session.uid_mv(&uid_str, dest).await.is_ok() {
            return Ok(());
        }
        session
            .uid_copy(&uid_str, dest)
            .await
            .map_err(|e| ServiceError::Transient(format!("imap COPY failed: {e}")))?;
        drain_store(&mut session, &uid_str, "+FLAGS (\\Deleted)").await?;
        drain_expunge(&mut session).await
    }

    pub async fn uid_store_flags(&self, uid: u32, flag_cmd: &str) -> Result<(), ServiceError> {
        let mut session = self.session.lock().await;
        drain_store(&mut session, &uid.to_string(), flag_cmd).await
    }

    pub async fn uid_delete(&self, uid: u32) -> Result<(), ServiceError> {
        let mut session = self.session.lock().await;
        let uid_str = uid.to_string();
        drain_store(&mut session, &uid_str, "+FLAGS (\\Deleted)").await?;
        drain_expunge(&mut session).await
    }

    pub async fn append(&self, mailbox: &str, data: &[u8]) -> Result<(), ServiceError> {
        let mut session = self.session.lock().await;
        session
            .append(mailbox, data)
            .await
            .map_err(|e| ServiceError::Transient(format!("imap APPEND failed: {e}")))?;
        Ok(())
    }

    /// `IDLE` for up to `timeout`, returning whether the server pushed new
    /// data before the timeout elapsed (§4.I). A `false` result is not an
    /// error: the caller's safety-net interval covers servers that never
    /// push during the window.
    pub async fn idle_wait(&self, timeout: std::time::Duration) -> Result<bool, ServiceError> {
        let mut session = self.session.lock().await;
        let mut idle = session.idle();
        idle.init().await.map_err(|e| ServiceError::Transient(format!("imap IDLE init failed: {e}")))?;
        let (idle_wait, _interrupt) = idle.wait_with_timeout(timeout);
        match idle_wait.await {
            Ok(async_imap::extensions::idle::IdleResponse::NewData(_)) => Ok(true),
            Ok(_) => Ok(false),
            Err(e) => Err(ServiceError::Transient(format!("imap IDLE failed: {e}"))),
        }
    }

    pub async fn logout(&self) -> Result<(), ServiceError> {
        let mut session = self.session.lock().await;
        session
            .logout()
            .await
            .map_err(|e| ServiceError::Transient(format!("imap LOGOUT failed: {e}")))
    }
}

async fn drain_store(session: &mut ImapSession, uid_seq: &str, flag_cmd: &str) -> Result<(), ServiceError> {
    let stream = session
        .uid_store(uid_seq, flag_cmd)
        .await
        .map_err(|e| ServiceError::Transient(format!("imap STORE failed: {e}")))?;
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        item.map_err(|e| ServiceError::Transient(format!("imap store stream error: {e}")))?;
    }
    Ok(())
}

async fn drain_expunge(session: &mut ImapSession) -> Result<(), ServiceError> {
    let stream = session
        .expunge()
        .await
        .map_err(|e| ServiceError::Transient(format!("imap EXPUNGE failed: {e}")))?;
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        item.map_err(|e| ServiceError::Transient(format!("imap expunge stream error: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xoauth2_initial_response_shape() {
        let mut auth = XOAuth2 {
            user: "a@example.com".into(),
            access_token: "tok".into(),
        };
        let resp = auth.process(b"");
        assert_eq!(resp, "user=a@example.com\x01auth=Bearer tok\x01\x01");
    }
}
