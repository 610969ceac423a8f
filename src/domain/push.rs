//! Browser push subscription row (§3 `PushSubscription`).

use serde::{Deserialize, Serialize};

use super::ids::UserId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub user_id: UserId,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub user_agent: Option<String>,
}

impl PushSubscription {
    /// `endpoint` must be `https`-only (§4.A push-endpoint check applies at
    /// registration time, ahead of the SSRF host-guard).
    pub fn has_valid_endpoint_scheme(&self) -> bool {
        self.endpoint.starts_with("https://")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_https_endpoint() {
        let sub = PushSubscription {
            user_id: "u1".into(),
            endpoint: "http://example.com/push".into(),
            p256dh: "k".into(),
            auth: "a".into(),
            user_agent: None,
        };
        assert!(!sub.has_valid_endpoint_scheme());
    }
}
