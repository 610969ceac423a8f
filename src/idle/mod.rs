//! Long-lived per-mailbox IDLE watchers (§4.I).

pub mod watcher;

pub use watcher::{
    resume_configured_idle_watches, sanitize_watch_mailboxes, IdleWatcherDeps, IdleWatcherMap,
    MAX_CONSECUTIVE_ERRORS,
};
