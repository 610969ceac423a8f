//! Gmail Pub/Sub push-webhook bearer-token verification (§6 "Gmail REST
//! API" / "Pub/Sub push-watch message body"). The webhook HTTP route
//! itself is out of scope (§1: HTTP routing/request validation), but
//! validating the Google-signed OIDC token the delivery carries is a
//! cross-cutting security concern this crate owns, the same way
//! `oauth::token_manager` owns access-token refresh. Grounded on the
//! `jwt::validate_token` seam in the pack's mail-server-api example.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

const GOOGLE_ISSUERS: &[&str] = &["https://accounts.google.com", "accounts.google.com"];

#[derive(Debug, Error)]
pub enum PushVerifyError {
    #[error("invalid bearer token: {0}")]
    InvalidToken(String),
    #[error("token issuer/audience/email mismatch")]
    ClaimMismatch,
    #[error("malformed push message body: {0}")]
    MalformedBody(String),
}

#[derive(Debug, Deserialize)]
pub struct PushTokenClaims {
    pub iss: String,
    pub aud: String,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
    pub exp: i64,
}

/// Decoded `{emailAddress, historyId}` from a push message's base64url
/// `data` field.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotification {
    pub email_address: String,
    pub history_id: String,
}

#[derive(Debug, Deserialize)]
struct PushMessageEnvelope {
    message: PushMessageBody,
}

#[derive(Debug, Deserialize)]
struct PushMessageBody {
    data: String,
}

/// Verifies a push delivery's `Authorization: Bearer <token>` against the
/// connector's configured `webhookAudience` and (if configured) a required
/// sender service-account email. `decoding_key` validates the token's RS256
/// signature against Google's current OIDC signing key for the `kid` in the
/// token header; callers are expected to keep that key fresh from Google's
/// JWKS endpoint (out of scope here — this function only checks claims once
/// a key is supplied).
pub fn verify_push_webhook_token(
    token: &str,
    expected_audience: &str,
    expected_email: Option<&str>,
    decoding_key: &DecodingKey,
) -> Result<PushTokenClaims, PushVerifyError> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[expected_audience]);
    validation.set_issuer(GOOGLE_ISSUERS);

    let data = decode::<PushTokenClaims>(token, decoding_key, &validation)
        .map_err(|e| PushVerifyError::InvalidToken(e.to_string()))?;
    let claims = data.claims;

    if !GOOGLE_ISSUERS.contains(&claims.iss.as_str()) || claims.aud != expected_audience {
        return Err(PushVerifyError::ClaimMismatch);
    }
    if claims.email_verified != Some(true) {
        return Err(PushVerifyError::ClaimMismatch);
    }
    if let Some(required) = expected_email {
        if claims.email.as_deref() != Some(required) {
            return Err(PushVerifyError::ClaimMismatch);
        }
    }

    Ok(claims)
}

/// Decodes a Pub/Sub push delivery body (`{message:{data:<base64url>}}`)
/// into `{emailAddress, historyId}`.
pub fn decode_push_notification(body: &[u8]) -> Result<PushNotification, PushVerifyError> {
    let envelope: PushMessageEnvelope =
        serde_json::from_slice(body).map_err(|e| PushVerifyError::MalformedBody(e.to_string()))?;
    let decoded = URL_SAFE_NO_PAD
        .decode(envelope.message.data.as_bytes())
        .map_err(|e| PushVerifyError::MalformedBody(e.to_string()))?;
    serde_json::from_slice(&decoded).map_err(|e| PushVerifyError::MalformedBody(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_push_notification_parses_nested_base64_json() {
        let inner = serde_json::json!({"emailAddress": "user@example.com", "historyId": "12345"});
        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&inner).unwrap());
        let body = serde_json::json!({"message": {"data": encoded}});

        let decoded = decode_push_notification(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(decoded.email_address, "user@example.com");
        assert_eq!(decoded.history_id, "12345");
    }

    #[test]
    fn decode_push_notification_rejects_malformed_body() {
        let err = decode_push_notification(b"not json").unwrap_err();
        assert!(matches!(err, PushVerifyError::MalformedBody(_)));
    }

    #[test]
    fn decode_push_notification_rejects_bad_base64() {
        let body = serde_json::json!({"message": {"data": "!!!not-base64!!!"}});
        let err = decode_push_notification(&serde_json::to_vec(&body).unwrap()).unwrap_err();
        assert!(matches!(err, PushVerifyError::MalformedBody(_)));
    }
}
