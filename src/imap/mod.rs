//! Generic (non-Gmail) IMAP transport and sync driver (§4.H).

pub mod client;
pub mod sync;

pub use client::{login_password, login_xoauth2, FetchedMessage, ImapClient, ImapEndpoint, ImapSession, MailboxMeta};
pub use sync::{run_mailbox_sync, ImapSyncDeps};
