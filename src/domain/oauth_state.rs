//! OAuth authorize/callback correlation state (§3 `OAuthState`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{IncomingConnectorId, OAuthStateId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorType {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthState {
    pub state: OAuthStateId,
    pub user_id: UserId,
    pub connector_type: ConnectorType,
    pub connector_id: Option<IncomingConnectorId>,
    pub connector_payload: Option<Value>,
    pub expires_at: DateTime<Utc>,
}

/// §6 callback-param limits.
pub const MAX_CODE_LEN: usize = 8192;
pub const MAX_STATE_LEN: usize = 200;

/// `code`/`state` must match a header-safe pattern: printable ASCII, no
/// control characters, no CR/LF (header/log injection guard).
pub fn is_header_safe(value: &str) -> bool {
    value.chars().all(|c| c.is_ascii_graphic() || c == ' ') && !value.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_safe_rejects_control_chars() {
        assert!(!is_header_safe("abc\r\ninjected"));
        assert!(!is_header_safe(""));
        assert!(is_header_safe("abc-DEF_123"));
    }
}
