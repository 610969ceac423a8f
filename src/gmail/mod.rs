//! Gmail-specific components: path canonicalizer (§4.C), REST API client,
//! sync driver (§4.G), and push-webhook token verification (§6).

pub mod api;
pub mod path;
pub mod push_verify;
pub mod sync;

pub use path::{
    get_gmail_mailbox_path_aliases, normalize_gmail_mailbox_path, MailboxDirectory,
};
pub use push_verify::{decode_push_notification, verify_push_webhook_token, PushNotification, PushVerifyError};
pub use sync::{
    hydrate_gmail_mailbox_content_batch, resolve_access_token, run_gmail_mailbox_sync, GmailSyncDeps,
    HydrationResult,
};
