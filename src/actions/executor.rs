//! Action executor (§4.J), grounded on the teacher's `providers/email/imap.rs`
//! `archive`/`trash`/`mark_read` methods for the IMAP optimistic-update/
//! rollback shape, generalized to also cover the Gmail-API label-modify
//! path the teacher's IMAP-only client never needed.

use std::sync::Arc;

use crate::collaborators::LabelCollaborator;
use crate::domain::{IncomingConnector, IncomingProvider, Message, MessageId, UserId};
use crate::error::ServiceError;
use crate::gmail::api::GmailApiClient;
use crate::gmail::path::{normalize_gmail_mailbox_path, MailboxDirectory};
use crate::imap::client::{login_password, login_xoauth2, ImapClient};
use crate::imap::sync::resolve_connection_params;
use crate::oauth::token_manager::GoogleTokenClient;
use crate::storage::queries::{connectors, messages};

pub struct ActionExecutorDeps {
    pub pool: sqlx::PgPool,
    pub token_client: Arc<dyn GoogleTokenClient>,
    pub gmail_api: Arc<GmailApiClient>,
    pub label_collaborator: Arc<dyn LabelCollaborator>,
}

/// System label ids a folder/starred change always resyncs (§4.J last
/// paragraph). `Label_*` custom ids and anything else already on the row
/// are left alone.
const SYSTEM_LABELS: &[&str] = &[
    "INBOX", "SENT", "DRAFT", "SPAM", "TRASH", "ALL", "IMPORTANT", "STARRED", "UNREAD",
];

fn sync_system_labels(existing: &[String], folder_canonical: &str, is_starred: bool) -> Vec<String> {
    let mut out: Vec<String> = existing
        .iter()
        .filter(|l| !SYSTEM_LABELS.contains(&l.as_str()))
        .cloned()
        .collect();
    out.push(folder_canonical.to_string());
    if is_starred {
        out.push("STARRED".to_string());
    }
    out.dedup();
    out
}

async fn load_owned(
    deps: &ActionExecutorDeps,
    user_id: &UserId,
    message_id: &MessageId,
) -> Result<(Message, IncomingConnector), ServiceError> {
    let message = messages::find_by_id_owned_by_user(&deps.pool, message_id, user_id)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?
        .ok_or(ServiceError::NotFound)?;

    let connector = connectors::get_incoming(&deps.pool, &message.incoming_connector_id)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?
        .ok_or(ServiceError::NotFound)?;

    Ok((message, connector))
}

async fn gmail_modify(
    deps: &ActionExecutorDeps,
    connector: &IncomingConnector,
    gmail_message_id: &str,
    add: &[String],
    remove: &[String],
) -> Result<Vec<String>, ServiceError> {
    let access_token = crate::gmail::resolve_access_token(&deps.pool, deps.token_client.as_ref(), connector).await?;
    let updated = deps
        .gmail_api
        .modify_message(&access_token, gmail_message_id, add, remove)
        .await
        .map_err(|e| ServiceError::Transient(e.to_string()))?;
    Ok(updated.label_ids)
}

async fn imap_session_for(
    deps: &ActionExecutorDeps,
    connector: &IncomingConnector,
) -> Result<ImapClient, ServiceError> {
    let conn = resolve_connection_params(&deps.pool, deps.token_client.as_ref(), connector).await?;
    let session = if conn.use_xoauth2 {
        login_xoauth2(&conn.endpoint, &conn.username, &conn.secret).await?
    } else {
        login_password(&conn.endpoint, &conn.username, &conn.secret).await?
    };
    Ok(ImapClient::new(session))
}

/// Resolves `canonical` to the server-side mailbox name for a Gmail-IMAP
/// connector, or returns it unchanged for a plain IMAP one (§4.C).
async fn server_path_for(imap: &ImapClient, connector: &IncomingConnector, canonical: &str) -> Result<String, ServiceError> {
    if !connector.is_gmail_like() {
        return Ok(canonical.to_string());
    }
    let rows = imap.list().await?;
    Ok(MailboxDirectory::build(&rows).server_path_for(canonical))
}

pub async fn set_message_read_state(
    deps: &ActionExecutorDeps,
    user_id: &UserId,
    message_id: &MessageId,
    is_read: bool,
) -> Result<(), ServiceError> {
    let (message, connector) = load_owned(deps, user_id, message_id).await?;
    if message.is_read == is_read {
        return Ok(());
    }

    messages::set_read_state(&deps.pool, message_id, is_read)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?;

    let result: Result<Vec<String>, ServiceError> = match connector.provider {
        IncomingProvider::Gmail => match message.gmail_message_id.as_deref() {
            Some(gmail_id) => {
                let (add, remove) = if is_read {
                    (vec![], vec!["UNREAD".to_string()])
                } else {
                    (vec!["UNREAD".to_string()], vec![])
                };
                gmail_modify(deps, &connector, gmail_id, &add, &remove)
                    .await
                    .map(|labels| sync_system_labels(&labels, &message.folder_path, message.is_starred))
            }
            None => Err(ServiceError::validation("message missing gmail id")),
        },
        IncomingProvider::Imap => match message.uid {
            Some(uid) => imap_mark(deps, &connector, &message.folder_path, uid, "\\Seen", is_read)
                .await
                .map(|_| message.flags.clone()),
            None => Err(ServiceError::validation("message uid unavailable")),
        },
    };

    match result {
        Ok(flags) => {
            messages::set_flags(&deps.pool, message_id, &flags)
                .await
                .map_err(|e| ServiceError::Other(e.into()))?;
            Ok(())
        }
        Err(e) => {
            messages::set_read_state(&deps.pool, message_id, message.is_read)
                .await
                .map_err(|e| ServiceError::Other(e.into()))?;
            Err(e)
        }
    }
}

pub async fn set_message_starred_state(
    deps: &ActionExecutorDeps,
    user_id: &UserId,
    message_id: &MessageId,
    is_starred: bool,
) -> Result<(), ServiceError> {
    let (message, connector) = load_owned(deps, user_id, message_id).await?;
    if message.is_starred == is_starred {
        return Ok(());
    }

    messages::set_starred_state(&deps.pool, message_id, is_starred)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?;

    let result: Result<Vec<String>, ServiceError> = match connector.provider {
        IncomingProvider::Gmail => match message.gmail_message_id.as_deref() {
            Some(gmail_id) => {
                let (add, remove) = if is_starred {
                    (vec!["STARRED".to_string()], vec![])
                } else {
                    (vec![], vec!["STARRED".to_string()])
                };
                gmail_modify(deps, &connector, gmail_id, &add, &remove)
                    .await
                    .map(|labels| sync_system_labels(&labels, &message.folder_path, is_starred))
            }
            None => Err(ServiceError::validation("message missing gmail id")),
        },
        IncomingProvider::Imap => match message.uid {
            Some(uid) => imap_mark(deps, &connector, &message.folder_path, uid, "\\Flagged", is_starred)
                .await
                .map(|_| sync_system_labels(&message.flags, &message.folder_path, is_starred)),
            None => Err(ServiceError::validation("message uid unavailable")),
        },
    };

    match result {
        Ok(flags) => {
            messages::set_flags(&deps.pool, message_id, &flags)
                .await
                .map_err(|e| ServiceError::Other(e.into()))?;
            Ok(())
        }
        Err(e) => {
            messages::set_starred_state(&deps.pool, message_id, message.is_starred)
                .await
                .map_err(|e| ServiceError::Other(e.into()))?;
            Err(e)
        }
    }
}

async fn imap_mark(
    deps: &ActionExecutorDeps,
    connector: &IncomingConnector,
    folder_canonical: &str,
    uid: u32,
    flag: &str,
    set: bool,
) -> Result<(), ServiceError> {
    let imap = imap_session_for(deps, connector).await?;
    let server_path = server_path_for(&imap, connector, folder_canonical).await?;
    imap.select(&server_path).await?;
    let cmd = if set { format!("+FLAGS ({flag})") } else { format!("-FLAGS ({flag})") };
    let result = imap.uid_store_flags(uid, &cmd).await;
    let _ = imap.logout().await;
    result
}

async fn imap_do_move(
    deps: &ActionExecutorDeps,
    connector: &IncomingConnector,
    original_folder: &str,
    canonical_dest: &str,
    uid: u32,
) -> Result<(), ServiceError> {
    let imap = imap_session_for(deps, connector).await?;
    let source_server_path = server_path_for(&imap, connector, original_folder).await?;
    let dest_server_path = server_path_for(&imap, connector, canonical_dest).await?;
    let moved = match imap.select(&source_server_path).await {
        Ok(_) => imap.uid_move(uid, &dest_server_path).await,
        Err(e) => Err(e),
    };
    let _ = imap.logout().await;
    moved
}

/// Dest values whose canonical is `ARCHIVE`/`ALL` in a non-Gmail context
/// must be rejected upstream (§6); this only enforces the Gmail-specific
/// archive semantics described in §4.J.
fn is_archive_alias(canonical_dest: &str) -> bool {
    canonical_dest == "ALL" || canonical_dest == "ARCHIVE"
}

pub async fn move_message_in_mailbox(
    deps: &ActionExecutorDeps,
    user_id: &UserId,
    message_id: &MessageId,
    dest_folder: &str,
) -> Result<(), ServiceError> {
    let (message, connector) = load_owned(deps, user_id, message_id).await?;
    let original_folder = message.folder_path.clone();

    let canonical_dest = if connector.is_gmail_like() {
        normalize_gmail_mailbox_path(dest_folder)
    } else {
        dest_folder.to_string()
    };

    if !connector.is_gmail_like() && is_archive_alias(&canonical_dest) {
        return Err(ServiceError::validation("archive/all is not a valid destination for a non-Gmail mailbox"));
    }

    let stored_folder = if is_archive_alias(&canonical_dest) { "ALL".to_string() } else { canonical_dest.clone() };

    messages::set_folder_path(&deps.pool, message_id, &stored_folder)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?;

    let result: Result<Vec<String>, ServiceError> = match connector.provider {
        IncomingProvider::Gmail => match message.gmail_message_id.as_deref() {
            Some(gmail_id) => {
                let source_label = normalize_gmail_mailbox_path(&original_folder);
                let (add, remove) = if is_archive_alias(&canonical_dest) {
                    (vec![], vec![source_label])
                } else {
                    (vec![canonical_dest.clone()], vec![source_label])
                };
                gmail_modify(deps, &connector, gmail_id, &add, &remove).await.map(|labels| {
                    let is_starred = labels.iter().any(|l| l == "STARRED");
                    sync_system_labels(&labels, &stored_folder, is_starred)
                })
            }
            None => Err(ServiceError::validation("message missing gmail id")),
        },
        IncomingProvider::Imap => match message.uid {
            Some(uid) => imap_do_move(deps, &connector, &original_folder, &canonical_dest, uid)
                .await
                .map(|_| sync_system_labels(&message.flags, &stored_folder, message.is_starred)),
            None => Err(ServiceError::validation("message uid unavailable")),
        },
    };

    match result {
        Ok(flags) => {
            messages::set_flags(&deps.pool, message_id, &flags)
                .await
                .map_err(|e| ServiceError::Other(e.into()))?;
            Ok(())
        }
        Err(e) => {
            messages::set_folder_path(&deps.pool, message_id, &original_folder)
                .await
                .map_err(|e| ServiceError::Other(e.into()))?;
            Err(e)
        }
    }
}

pub async fn delete_message_from_mailbox(
    deps: &ActionExecutorDeps,
    user_id: &UserId,
    message_id: &MessageId,
) -> Result<(), ServiceError> {
    let (message, connector) = load_owned(deps, user_id, message_id).await?;

    match connector.provider {
        IncomingProvider::Gmail => {
            let Some(gmail_id) = message.gmail_message_id.as_deref() else {
                return Err(ServiceError::validation("message missing gmail id"));
            };
            let access_token = crate::gmail::resolve_access_token(&deps.pool, deps.token_client.as_ref(), &connector).await?;
            deps.gmail_api
                .trash_message(&access_token, gmail_id)
                .await
                .map_err(|e| ServiceError::Transient(e.to_string()))?;
        }
        IncomingProvider::Imap => {
            let Some(uid) = message.uid else {
                return Err(ServiceError::validation("message uid unavailable"));
            };
            let imap = imap_session_for(deps, &connector).await?;
            let server_path = server_path_for(&imap, &connector, &message.folder_path).await?;
            let result = match imap.select(&server_path).await {
                Ok(_) => imap.uid_delete(uid).await,
                Err(e) => Err(e),
            };
            let _ = imap.logout().await;
            result?;
        }
    }

    messages::delete(&deps.pool, message_id).await.map_err(|e| ServiceError::Other(e.into()))?;
    Ok(())
}

/// §4.J `applyThreadMessageActions`: the subset of actions present, applied
/// in order `labels -> read -> star -> move -> delete` to every message in
/// the thread owned by `user_id`.
#[derive(Debug, Clone, Default)]
pub struct ThreadActionRequest {
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub move_to_folder: Option<String>,
    pub delete: bool,
    pub add_label_keys: Vec<String>,
    pub remove_label_keys: Vec<String>,
}

pub async fn apply_thread_message_actions(
    deps: &ActionExecutorDeps,
    user_id: &UserId,
    anchor_message_id: &MessageId,
    actions: &ThreadActionRequest,
) -> Result<Vec<MessageId>, ServiceError> {
    let anchor = messages::find_by_id_owned_by_user(&deps.pool, anchor_message_id, user_id)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?
        .ok_or(ServiceError::NotFound)?;

    let thread_key = anchor.thread_id.clone().unwrap_or_else(|| anchor.message_id.clone());
    let mut thread_messages = messages::find_thread_owned_by_user(&deps.pool, &thread_key, user_id)
        .await
        .map_err(|e| ServiceError::Other(e.into()))?;
    if thread_messages.is_empty() {
        thread_messages.push(anchor);
    }

    let mut affected = Vec::with_capacity(thread_messages.len());
    for message in &thread_messages {
        if !actions.add_label_keys.is_empty() || !actions.remove_label_keys.is_empty() {
            deps.label_collaborator
                .apply_label_keys(&message.id, &actions.add_label_keys, &actions.remove_label_keys)
                .await;
        }
        if let Some(is_read) = actions.is_read {
            set_message_read_state(deps, user_id, &message.id, is_read).await?;
        }
        if let Some(is_starred) = actions.is_starred {
            set_message_starred_state(deps, user_id, &message.id, is_starred).await?;
        }
        if let Some(dest) = &actions.move_to_folder {
            move_message_in_mailbox(deps, user_id, &message.id, dest).await?;
        }
        if actions.delete {
            delete_message_from_mailbox(deps, user_id, &message.id).await?;
        }
        affected.push(message.id.clone());
    }

    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_system_labels_replaces_folder_and_starred_markers() {
        let existing = vec!["SPAM".to_string(), "Label_42".to_string()];
        let out = sync_system_labels(&existing, "INBOX", true);
        assert!(out.contains(&"INBOX".to_string()));
        assert!(out.contains(&"STARRED".to_string()));
        assert!(out.contains(&"Label_42".to_string()));
        assert!(!out.contains(&"SPAM".to_string()));
    }

    #[test]
    fn archive_alias_recognizes_all_and_archive() {
        assert!(is_archive_alias("ALL"));
        assert!(is_archive_alias("ARCHIVE"));
        assert!(!is_archive_alias("INBOX"));
    }
}
