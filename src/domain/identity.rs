//! Sending identity domain type (§3 `Identity`).

use serde::{Deserialize, Serialize};

use super::ids::{IdentityId, IncomingConnectorId, OutgoingConnectorId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub user_id: UserId,
    pub display_name: String,
    pub email_address: String,
    pub signature: Option<String>,
    pub reply_to: Option<String>,
    pub outgoing_connector_id: OutgoingConnectorId,
    pub sent_to_incoming_connector_id: Option<IncomingConnectorId>,
}

/// Limits from §6's input-limits table.
pub const MAX_DISPLAY_NAME_LEN: usize = 180;
pub const MAX_SIGNATURE_LEN: usize = 20_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_limit_matches_spec() {
        assert_eq!(MAX_DISPLAY_NAME_LEN, 180);
    }
}
