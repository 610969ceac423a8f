//! Gmail mailbox path canonicalization (§4.C).
//!
//! Generalizes the teacher's single-direction `label_id_for_folder`
//! (canonical -> Gmail label id, used only to build a `labelIds=` query
//! param) into the spec's full bidirectional alias table plus a
//! per-connector mailbox directory built from IMAP `LIST`/`SPECIAL-USE`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// `(server alias upper-cased, canonical)` pairs. Order matters only for
/// readability; lookups are by exact upper-cased match.
const ALIAS_TABLE: &[(&str, &str)] = &[
    ("[GMAIL]/SENT MAIL", "SENT"),
    ("[GOOGLE MAIL]/SENT MAIL", "SENT"),
    ("[GMAIL]/ALL MAIL", "ALL"),
    ("[GOOGLE MAIL]/ALL MAIL", "ALL"),
    ("[GMAIL]/JUNK", "SPAM"),
    ("[GOOGLE MAIL]/JUNK", "SPAM"),
    ("[GMAIL]/SPAM", "SPAM"),
    ("[GOOGLE MAIL]/SPAM", "SPAM"),
    ("[GMAIL]/TRASH", "TRASH"),
    ("[GOOGLE MAIL]/TRASH", "TRASH"),
    ("[GMAIL]/BIN", "TRASH"),
    ("[GMAIL]/STARRED", "STARRED"),
    ("[GOOGLE MAIL]/STARRED", "STARRED"),
    ("[GMAIL]/IMPORTANT", "IMPORTANT"),
    ("[GOOGLE MAIL]/IMPORTANT", "IMPORTANT"),
    ("[GMAIL]/DRAFTS", "DRAFT"),
    ("[GOOGLE MAIL]/DRAFTS", "DRAFT"),
    ("SENT MESSAGES", "SENT"),
];

/// Does this string look like a custom Gmail label id (`Label_1234`) rather
/// than a human mailbox path? Preserved verbatim rather than upper-cased.
fn is_custom_label_id(p: &str) -> bool {
    p.starts_with("Label_") && p["Label_".len()..].chars().all(|c| c.is_ascii_digit())
}

/// `normalizeGmailMailboxPath(p)`.
pub fn normalize_gmail_mailbox_path(p: &str) -> String {
    let trimmed = p.trim();
    if trimmed.is_empty() {
        return "INBOX".to_string();
    }
    if is_custom_label_id(trimmed) {
        return trimmed.to_string();
    }
    let upper = trimmed.to_ascii_uppercase();
    for (alias, canonical) in ALIAS_TABLE {
        if *alias == upper {
            return (*canonical).to_string();
        }
    }
    upper
}

/// `getGmailMailboxPathAliases(p)`: canonical + all known server aliases
/// (upper-cased) for matching server folder metadata.
pub fn get_gmail_mailbox_path_aliases(p: &str) -> Vec<String> {
    let canonical = normalize_gmail_mailbox_path(p);
    let mut out = vec![canonical.clone()];
    for (alias, mapped) in ALIAS_TABLE {
        if *mapped == canonical {
            out.push((*alias).to_string());
        }
    }
    out.dedup();
    out
}

/// Infers a canonical path from IMAP `LIST` `SPECIAL-USE` flags, per §4.C.
pub fn canonical_from_special_use(flags: &[String]) -> Option<&'static str> {
    for flag in flags {
        match flag.as_str() {
            "\\All" => return Some("ALL"),
            "\\Inbox" => return Some("INBOX"),
            "\\Sent" => return Some("SENT"),
            "\\Drafts" => return Some("DRAFT"),
            "\\Flagged" => return Some("STARRED"),
            "\\Junk" => return Some("SPAM"),
            "\\Trash" => return Some("TRASH"),
            "\\Important" => return Some("IMPORTANT"),
            _ => continue,
        }
    }
    None
}

/// Non-selectable containers dropped during directory construction
/// (§4.C "Selection filters drop non-selectable containers like `[Gmail]`
/// and duplicate canonical rows").
pub fn is_non_selectable_container(server_path: &str, flags: &[String]) -> bool {
    flags.iter().any(|f| f == "\\Noselect") || server_path.eq_ignore_ascii_case("[Gmail]")
}

/// Per-connector cache mapping canonical <-> server path, invalidated on
/// auth change or append mismatch, cached for 60s (§4.C, §5).
#[derive(Debug)]
pub struct MailboxDirectory {
    canonical_to_server: HashMap<String, String>,
    server_to_canonical: HashMap<String, String>,
    built_at: Instant,
}

const DIRECTORY_TTL: Duration = Duration::from_secs(60);

impl MailboxDirectory {
    /// Builds a directory from raw `(server_path, special_use_flags)` rows
    /// returned by `LIST`. Rows whose container is non-selectable, or
    /// whose canonical id duplicates one already seen, are dropped — the
    /// first upper-cased unique wins (open question in SPEC_FULL.md §9 /
    /// DESIGN.md: whether subscribed rows should be preferred is left
    /// undecided by the source and not guessed here).
    pub fn build(rows: &[(String, Vec<String>)]) -> Self {
        let mut canonical_to_server = HashMap::new();
        let mut server_to_canonical = HashMap::new();

        for (server_path, flags) in rows {
            if is_non_selectable_container(server_path, flags) {
                continue;
            }
            let canonical = canonical_from_special_use(flags)
                .map(str::to_string)
                .unwrap_or_else(|| normalize_gmail_mailbox_path(server_path));

            if canonical_to_server.contains_key(&canonical) {
                continue;
            }
            canonical_to_server.insert(canonical.clone(), server_path.clone());
            server_to_canonical.insert(server_path.to_ascii_uppercase(), canonical);
        }

        Self {
            canonical_to_server,
            server_to_canonical,
            built_at: Instant::now(),
        }
    }

    pub fn is_stale(&self) -> bool {
        self.built_at.elapsed() > DIRECTORY_TTL
    }

    /// `resolveGmailImapMailboxPath`: canonical -> server path. Missing
    /// canonical defaults to `INBOX` when appending (§4.H).
    pub fn server_path_for(&self, canonical: &str) -> String {
        self.canonical_to_server
            .get(canonical)
            .cloned()
            .unwrap_or_else(|| "INBOX".to_string())
    }

    pub fn canonical_for_server_path(&self, server_path: &str) -> Option<&str> {
        self.server_to_canonical
            .get(&server_path.to_ascii_uppercase())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_normalizes_to_inbox() {
        assert_eq!(normalize_gmail_mailbox_path(""), "INBOX");
        assert_eq!(normalize_gmail_mailbox_path("   "), "INBOX");
    }

    #[test]
    fn known_aliases_map_to_canonical() {
        assert_eq!(normalize_gmail_mailbox_path("[Gmail]/Sent Mail"), "SENT");
        assert_eq!(normalize_gmail_mailbox_path("[Google Mail]/All Mail"), "ALL");
        assert_eq!(normalize_gmail_mailbox_path("[Gmail]/Junk"), "SPAM");
    }

    #[test]
    fn custom_label_ids_are_preserved() {
        assert_eq!(normalize_gmail_mailbox_path("Label_1234"), "Label_1234");
    }

    #[test]
    fn unknown_path_is_upper_cased() {
        assert_eq!(normalize_gmail_mailbox_path("Work/Invoices"), "WORK/INVOICES");
    }

    /// Testable property 5: canonical mailboxes round-trip.
    #[test]
    fn canonical_round_trips_through_aliases() {
        for (alias, canonical) in ALIAS_TABLE {
            assert_eq!(normalize_gmail_mailbox_path(alias), *canonical);
            let aliases = get_gmail_mailbox_path_aliases(canonical);
            assert!(aliases.contains(&canonical.to_string()));
        }
    }

    #[test]
    fn special_use_flags_take_priority_over_path_guessing() {
        assert_eq!(
            canonical_from_special_use(&["\\HasNoChildren".into(), "\\All".into()]),
            Some("ALL")
        );
        assert_eq!(canonical_from_special_use(&["\\HasChildren".into()]), None);
    }

    #[test]
    fn directory_drops_noselect_and_gmail_container() {
        let rows = vec![
            ("[Gmail]".to_string(), vec!["\\Noselect".to_string()]),
            ("[Gmail]/All Mail".to_string(), vec!["\\All".to_string()]),
        ];
        let dir = MailboxDirectory::build(&rows);
        assert_eq!(dir.server_path_for("ALL"), "[Gmail]/All Mail");
        assert!(dir.canonical_for_server_path("[Gmail]").is_none());
    }

    #[test]
    fn directory_keeps_first_unique_canonical_on_duplicate() {
        let rows = vec![
            ("[Gmail]/Starred".to_string(), vec!["\\Flagged".to_string()]),
            ("[Google Mail]/Starred".to_string(), vec!["\\Flagged".to_string()]),
        ];
        let dir = MailboxDirectory::build(&rows);
        assert_eq!(dir.server_path_for("STARRED"), "[Gmail]/Starred");
    }

    #[test]
    fn missing_canonical_defaults_to_inbox() {
        let dir = MailboxDirectory::build(&[]);
        assert_eq!(dir.server_path_for("SENT"), "INBOX");
    }
}
