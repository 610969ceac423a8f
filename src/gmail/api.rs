//! Gmail REST API v1 client, grounded on the raw `reqwest` call shape in
//! `other_examples/8d44b3a3_xcorat-araliya-bot`'s `fetch_message_summary`/
//! `list_messages_with` — no Gmail SDK crate is in the pack, so the
//! teacher's "hand-roll the HTTP calls with reqwest" approach carries over.

use serde::Deserialize;
use thiserror::Error;

const API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

#[derive(Debug, Error)]
pub enum GmailApiError {
    #[error("gmail api request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gmail api returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("startHistoryId too old")]
    HistoryIdTooOld,
}

impl GmailApiError {
    /// §4.G: 404 or the specific "startHistoryId is too old" message
    /// triggers the fallback-to-full-list path rather than a hard error.
    pub fn is_history_fallback_trigger(&self) -> bool {
        match self {
            GmailApiError::HistoryIdTooOld => true,
            GmailApiError::Status { status, message } => {
                *status == 404 || message.to_lowercase().contains("starthistoryid")
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessageRef {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMessagesPage {
    #[serde(default)]
    pub messages: Vec<GmailMessageRef>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessagePayload {
    #[serde(default)]
    pub headers: Vec<GmailHeader>,
    #[serde(default)]
    pub parts: Vec<GmailMessagePayload>,
    pub mime_type: Option<String>,
    pub body: Option<GmailBody>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GmailBody {
    pub data: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: String,
    pub history_id: Option<String>,
    /// Epoch milliseconds as a decimal string, as Gmail always returns it
    /// regardless of `format`/`metadataHeaders`.
    pub internal_date: Option<String>,
    pub payload: Option<GmailMessagePayload>,
    pub raw: Option<String>,
}

impl GmailMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.payload
            .as_ref()?
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn received_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.internal_date
            .as_deref()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(chrono::DateTime::from_timestamp_millis)
            .unwrap_or_else(chrono::Utc::now)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    #[serde(default)]
    pub messages_added: Vec<HistoryMessageWrapper>,
    #[serde(default)]
    pub messages_deleted: Vec<HistoryMessageWrapper>,
    #[serde(default)]
    pub labels_added: Vec<HistoryMessageWrapper>,
    #[serde(default)]
    pub labels_removed: Vec<HistoryMessageWrapper>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryMessageWrapper {
    pub message: GmailMessageRef,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    pub next_page_token: Option<String>,
    pub history_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub id: String,
    pub thread_id: String,
}

pub struct GmailApiClient {
    http: reqwest::Client,
}

impl GmailApiClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        access_token: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, GmailApiError> {
        let response = self
            .http
            .get(format!("{API_BASE}{path}"))
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn parse_response<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, GmailApiError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GmailApiError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json::<T>().await?)
    }

    /// `label.id` selects the folder; Gmail's `q` param isn't used here,
    /// only `labelIds`, matching the bootstrap "list all IDs for the
    /// folder's label" behavior (§4.G).
    pub async fn list_message_ids(
        &self,
        access_token: &str,
        label_id: &str,
        page_token: Option<&str>,
    ) -> Result<ListMessagesPage, GmailApiError> {
        let mut query = vec![("labelIds", label_id), ("maxResults", "500")];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }
        self.get_json(access_token, "/messages", &query).await
    }

    pub async fn get_message_metadata(&self, access_token: &str, id: &str) -> Result<GmailMessage, GmailApiError> {
        self.get_json(
            access_token,
            &format!("/messages/{id}"),
            &[
                ("format", "metadata"),
                ("metadataHeaders", "Message-ID"),
                ("metadataHeaders", "Subject"),
                ("metadataHeaders", "From"),
                ("metadataHeaders", "To"),
                ("metadataHeaders", "In-Reply-To"),
                ("metadataHeaders", "References"),
            ],
        )
        .await
    }

    pub async fn get_message_raw(&self, access_token: &str, id: &str) -> Result<GmailMessage, GmailApiError> {
        self.get_json(access_token, &format!("/messages/{id}"), &[("format", "raw")])
            .await
    }

    /// `/history?startHistoryId=…`, deliberately without a `labelId`
    /// filter so label removals are still visible (§4.G).
    pub async fn list_history(
        &self,
        access_token: &str,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, GmailApiError> {
        let mut query = vec![("startHistoryId", start_history_id)];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }
        self.get_json(access_token, "/history", &query).await
    }

    pub async fn modify_message(
        &self,
        access_token: &str,
        id: &str,
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<GmailMessage, GmailApiError> {
        let body = serde_json::json!({
            "addLabelIds": add_label_ids,
            "removeLabelIds": remove_label_ids,
        });
        let response = self
            .http
            .post(format!("{API_BASE}/messages/{id}/modify"))
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    pub async fn trash_message(&self, access_token: &str, id: &str) -> Result<(), GmailApiError> {
        let response = self
            .http
            .post(format!("{API_BASE}/messages/{id}/trash"))
            .bearer_auth(access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GmailApiError::Status { status: status.as_u16(), message });
        }
        Ok(())
    }

    pub async fn send_message(
        &self,
        access_token: &str,
        raw_base64url: &str,
        thread_id: Option<&str>,
    ) -> Result<SendMessageResponse, GmailApiError> {
        let mut body = serde_json::json!({ "raw": raw_base64url });
        if let Some(thread_id) = thread_id {
            body["threadId"] = serde_json::Value::String(thread_id.to_string());
        }
        let response = self
            .http
            .post(format!("{API_BASE}/messages/send"))
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await?;
        Self::parse_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_404_triggers_history_fallback() {
        let err = GmailApiError::Status { status: 404, message: "not found".into() };
        assert!(err.is_history_fallback_trigger());
    }

    #[test]
    fn starthistoryid_message_triggers_fallback() {
        let err = GmailApiError::Status { status: 400, message: "startHistoryId is too old".into() };
        assert!(err.is_history_fallback_trigger());
    }

    #[test]
    fn other_errors_do_not_trigger_fallback() {
        let err = GmailApiError::Status { status: 500, message: "internal".into() };
        assert!(!err.is_history_fallback_trigger());
    }
}
