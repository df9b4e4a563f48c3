//! Gmail REST client.
//!
//! Thin wrapper over `users.messages` and `users.labels`. Messages are
//! fetched in `raw` form and parsed locally so the categorizer sees the body,
//! not just the snippet. The bearer token comes from `GMAIL_ACCESS_TOKEN`;
//! obtaining and refreshing it is out of scope here.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::error::CollaboratorError;
use crate::mail::{MailAction, MailStore};
use crate::pipeline::types::EmailRecord;

const SERVICE: &str = "gmail";
const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
/// Gmail caps `maxResults` per list page.
const MAX_PAGE_SIZE: usize = 500;

/// Gmail's `raw` field is base64url; padding varies between responses.
const RAW_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

pub struct GmailClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
    /// Label name → label id.
    label_cache: Mutex<HashMap<String, String>>,
}

impl GmailClient {
    pub fn new(token: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            token,
            label_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Token from `GMAIL_ACCESS_TOKEN`. A missing token surfaces as an auth
    /// failure on first use, not here.
    pub fn from_env() -> Self {
        let token = std::env::var("GMAIL_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .map(SecretString::from);
        if token.is_none() {
            tracing::warn!("GMAIL_ACCESS_TOKEN not set; mail-store calls will fail");
        }
        Self::new(token)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn bearer(&self) -> Result<&str, CollaboratorError> {
        self.token
            .as_ref()
            .map(|t| t.expose_secret())
            .ok_or_else(|| CollaboratorError::Auth {
                service: SERVICE.into(),
                reason: "GMAIL_ACCESS_TOKEN is not set".into(),
            })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        item_id: Option<&str>,
    ) -> Result<T, CollaboratorError> {
        let resp = self
            .client
            .get(format!("{}/{path}", self.base_url))
            .bearer_auth(self.bearer()?)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        decode(resp, item_id).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
        item_id: Option<&str>,
    ) -> Result<T, CollaboratorError> {
        let resp = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .bearer_auth(self.bearer()?)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        decode(resp, item_id).await
    }

    async fn list_ids(&self, query: &str, max_results: usize) -> Result<Vec<String>, CollaboratorError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while ids.len() < max_results {
            let page_size = (max_results - ids.len()).min(MAX_PAGE_SIZE);
            let mut params = vec![("q", query.to_string()), ("maxResults", page_size.to_string())];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let page: ListResponse = self.get_json("messages", &params, None).await?;
            ids.extend(page.messages.into_iter().map(|m| m.id));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        ids.truncate(max_results);
        Ok(ids)
    }

    /// Label id for `name`, creating the label when allowed.
    async fn label_id(&self, name: &str, create_missing: bool) -> Result<String, CollaboratorError> {
        if let Some(id) = self.label_cache.lock().await.get(name) {
            return Ok(id.clone());
        }

        let labels: LabelList = self.get_json("labels", &[], None).await?;
        let mut cache = self.label_cache.lock().await;
        for label in labels.labels {
            cache.insert(label.name, label.id);
        }
        if let Some(id) = cache.get(name) {
            return Ok(id.clone());
        }
        drop(cache);

        if !create_missing {
            return Err(CollaboratorError::NotFound {
                service: SERVICE.into(),
                id: format!("label '{name}'"),
            });
        }

        let body = serde_json::json!({
            "name": name,
            "labelListVisibility": "labelShow",
            "messageListVisibility": "show",
        });
        let created: Label = self.post_json("labels", &body, None).await?;
        tracing::info!(label = %name, label_id = %created.id, "Created Gmail label");
        self.label_cache
            .lock()
            .await
            .insert(created.name, created.id.clone());
        Ok(created.id)
    }

    async fn modify(
        &self,
        item_id: &str,
        add: &[String],
        remove: &[&str],
    ) -> Result<(), CollaboratorError> {
        let body = serde_json::json!({
            "addLabelIds": add,
            "removeLabelIds": remove,
        });
        let _: serde_json::Value = self
            .post_json(&format!("messages/{item_id}/modify"), &body, Some(item_id))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MailStore for GmailClient {
    async fn fetch(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<EmailRecord>, CollaboratorError> {
        let ids = self.list_ids(query, max_results).await?;
        let listed = ids.len();
        let mut records = Vec::with_capacity(listed);
        for id in ids {
            let fetched: Result<Message, _> = self
                .get_json(
                    &format!("messages/{id}"),
                    &[("format", "raw".to_string())],
                    Some(&id),
                )
                .await;
            match fetched {
                Ok(message) => records.push(message.into_record()),
                // Deleted between list and get.
                Err(CollaboratorError::NotFound { .. }) => {
                    tracing::warn!(email_id = %id, "Listed message is gone, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(
            query,
            listed,
            count = records.len(),
            "Fetched messages from Gmail"
        );
        Ok(records)
    }

    async fn apply_action(
        &self,
        item_id: &str,
        action: &MailAction,
    ) -> Result<(), CollaboratorError> {
        match action {
            MailAction::ApplyLabel {
                label,
                create_missing,
            } => {
                let label_id = self.label_id(label, *create_missing).await?;
                self.modify(item_id, &[label_id], &[]).await
            }
            MailAction::Archive => self.modify(item_id, &[], &["INBOX"]).await,
            MailAction::Star => self.modify(item_id, &["STARRED".to_string()], &[]).await,
            MailAction::MarkAsRead => self.modify(item_id, &[], &["UNREAD"]).await,
        }
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Message {
    id: String,
    #[serde(default)]
    snippet: String,
    /// Full RFC 822 message, base64url (`format=raw`).
    #[serde(default)]
    raw: Option<String>,
    #[serde(default)]
    payload: Payload,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Payload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct Label {
    id: String,
    name: String,
}

impl Message {
    fn header(&self, name: &str) -> Option<&str> {
        self.payload
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    fn into_record(self) -> EmailRecord {
        let bytes = self.raw.as_deref().and_then(|raw| {
            RAW_ENGINE
                .decode(raw.trim())
                .map_err(|e| tracing::warn!(email_id = %self.id, error = %e, "Undecodable raw message"))
                .ok()
        });
        let parsed = bytes
            .as_deref()
            .and_then(|b| MessageParser::default().parse(b));

        let subject = parsed
            .as_ref()
            .and_then(|m| m.subject())
            .or_else(|| self.header("Subject"))
            .unwrap_or("(no subject)")
            .to_string();
        let sender = parsed
            .as_ref()
            .and_then(parsed_sender)
            .or_else(|| self.header("From").map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        let content = parsed
            .as_ref()
            .and_then(body_text)
            .unwrap_or_else(|| self.snippet.clone());
        let received_at = self
            .internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        EmailRecord {
            id: self.id,
            subject,
            sender,
            content,
            received_at,
        }
    }
}

/// `Name <address>`, or the bare address.
fn parsed_sender(message: &mail_parser::Message) -> Option<String> {
    let addr = message.from()?.first()?;
    let address = addr.address()?;
    Some(match addr.name() {
        Some(name) if !name.is_empty() => format!("{name} <{address}>"),
        _ => address.to_string(),
    })
}

/// First text part, else the first HTML part. `None` when neither has content.
fn body_text(message: &mail_parser::Message) -> Option<String> {
    message
        .body_text(0)
        .or_else(|| message.body_html(0))
        .map(|body| body.trim().to_string())
        .filter(|body| !body.is_empty())
}

fn transport_error(e: reqwest::Error) -> CollaboratorError {
    CollaboratorError::Transient {
        service: SERVICE.into(),
        reason: e.to_string(),
    }
}

async fn decode<T: DeserializeOwned>(
    resp: reqwest::Response,
    item_id: Option<&str>,
) -> Result<T, CollaboratorError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(status_error(status, body, item_id));
    }
    resp.json::<T>().await.map_err(|e| CollaboratorError::Rejected {
        service: SERVICE.into(),
        reason: format!("unexpected response body: {e}"),
    })
}

/// 401/403 → auth, 404 → not found, 429/5xx → transient, anything else → rejected.
fn status_error(status: StatusCode, body: String, item_id: Option<&str>) -> CollaboratorError {
    let service = SERVICE.to_string();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CollaboratorError::Auth {
            service,
            reason: format!("{status}: {body}"),
        },
        StatusCode::NOT_FOUND => CollaboratorError::NotFound {
            service,
            id: item_id.unwrap_or("resource").to_string(),
        },
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
            CollaboratorError::Transient {
                service,
                reason: format!("{status}: {body}"),
            }
        }
        _ => CollaboratorError::Rejected {
            service,
            reason: format!("{status}: {body}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(status_error(StatusCode::UNAUTHORIZED, String::new(), None).is_auth());
        assert!(status_error(StatusCode::FORBIDDEN, String::new(), None).is_auth());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, String::new(), None).is_transient());
        assert!(status_error(StatusCode::BAD_GATEWAY, String::new(), None).is_transient());
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, String::new(), Some("m1")),
            CollaboratorError::NotFound { ref id, .. } if id == "m1"
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, "bad".into(), None),
            CollaboratorError::Rejected { .. }
        ));
    }

    #[test]
    fn message_metadata_becomes_record() {
        let raw = serde_json::json!({
            "id": "18c",
            "snippet": "Your invoice is attached",
            "internalDate": "1700000000000",
            "payload": {
                "headers": [
                    {"name": "subject", "value": "Invoice #42"},
                    {"name": "From", "value": "Billing <billing@acme.test>"}
                ]
            }
        });
        let message: Message = serde_json::from_value(raw).unwrap();
        let record = message.into_record();
        assert_eq!(record.id, "18c");
        assert_eq!(record.subject, "Invoice #42");
        assert_eq!(record.sender, "Billing <billing@acme.test>");
        assert_eq!(record.content, "Your invoice is attached");
        assert_eq!(record.received_at.timestamp(), 1_700_000_000);
    }

    const INVOICE: &str = "From: Billing <billing@acme.test>\r\n\
Subject: Invoice #42\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Amount due: $120. Pay by Friday.\r\n";

    fn raw_message(id: &str, rfc822: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "snippet": "Amount due",
            "internalDate": "1700000000000",
            "raw": base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(rfc822),
        })
    }

    #[test]
    fn raw_message_body_becomes_content() {
        let message: Message = serde_json::from_value(raw_message("18c", INVOICE)).unwrap();
        let record = message.into_record();
        assert_eq!(record.subject, "Invoice #42");
        assert_eq!(record.sender, "Billing <billing@acme.test>");
        assert_eq!(record.content, "Amount due: $120. Pay by Friday.");
    }

    #[test]
    fn snippet_is_used_when_the_body_is_empty() {
        let empty_body = "From: a@b.test\r\nSubject: Hi\r\n\r\n";
        let message: Message = serde_json::from_value(raw_message("18d", empty_body)).unwrap();
        let record = message.into_record();
        assert_eq!(record.subject, "Hi");
        assert_eq!(record.sender, "a@b.test");
        assert_eq!(record.content, "Amount due");
    }

    /// Minimal HTTP/1.1 server: path (without query) → (status, JSON body).
    async fn serve(routes: Vec<(&'static str, u16, serde_json::Value)>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&request);
                let target = head.split_whitespace().nth(1).unwrap_or("/");
                let path = target.split('?').next().unwrap_or(target);
                let (status, body) = routes
                    .iter()
                    .find(|(route, _, _)| *route == path)
                    .map(|(_, status, body)| (*status, body.to_string()))
                    .unwrap_or((404, "{}".to_string()));
                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn message_deleted_after_listing_is_skipped() {
        let base = serve(vec![
            (
                "/messages",
                200,
                serde_json::json!({"messages": [{"id": "gone"}, {"id": "ok"}]}),
            ),
            ("/messages/gone", 404, serde_json::json!({"error": "not found"})),
            ("/messages/ok", 200, raw_message("ok", INVOICE)),
        ])
        .await;
        let client = GmailClient::new(Some(SecretString::from("token".to_string())))
            .with_base_url(base);

        let records = client.fetch("is:unread", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "ok");
        assert_eq!(records[0].subject, "Invoice #42");
    }

    #[tokio::test]
    async fn missing_token_is_an_auth_failure() {
        let client = GmailClient::new(None).with_base_url("http://127.0.0.1:9");
        let err = client.fetch("is:unread", 5).await.unwrap_err();
        assert!(err.is_auth());
    }
}
