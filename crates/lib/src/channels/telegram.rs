//! Telegram Bot API client: update delivery (getUpdates / webhook) and outbound messages.
//!
//! Every Bot API failure is decoded into a [`PlatformErrorKind`] here, from `error_code` and
//! `parameters.retry_after`; nothing downstream inspects the description text.

use super::api::{BotApi, MessageRef, Messenger, UpdateBatch, WebhookInfo};
use crate::error::{PlatformError, PlatformErrorKind};
use crate::event::{InboundEvent, SubjectId};
use async_trait::async_trait;
use chrono::DateTime;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Extra HTTP time on top of the long-poll timeout.
const LONG_POLL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Telegram update payload (getUpdates result item or webhook POST body).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub edited_message: Option<TelegramMessage>,
    #[serde(default)]
    pub channel_post: Option<TelegramMessage>,
    #[serde(default)]
    pub callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub date: i64,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct RawWebhookInfo {
    #[serde(default)]
    url: String,
    #[serde(default)]
    pending_update_count: u64,
}

impl TelegramUpdate {
    /// Normalize into an [`InboundEvent`]. `None` when the update has no addressable subject.
    pub fn into_event(self) -> Option<InboundEvent> {
        let id = self.update_id;
        if let Some(msg) = self.message {
            let subject = SubjectId(msg.chat.id);
            let at = DateTime::from_timestamp(msg.date, 0);
            let event = match msg.text {
                Some(text) => InboundEvent::text(id, subject, text),
                None => InboundEvent::other(id, subject),
            };
            return Some(match at {
                Some(at) => event.with_timestamp(at),
                None => event,
            });
        }
        if let Some(cb) = self.callback_query {
            let subject = cb
                .message
                .as_ref()
                .map(|m| m.chat.id)
                .unwrap_or(cb.from.id);
            return Some(InboundEvent::callback(id, SubjectId(subject), cb.id, cb.data));
        }
        self.edited_message
            .or(self.channel_post)
            .map(|m| InboundEvent::other(id, SubjectId(m.chat.id)))
    }
}

/// Map a Bot API error to its kind.
fn error_kind(method: &str, code: i64, description: &str, retry_after: Option<u64>) -> PlatformErrorKind {
    match code {
        401 => PlatformErrorKind::Unauthorized,
        // An unknown token yields 404 on every method; only the update fetch treats it as fatal.
        404 if method == "getUpdates" => PlatformErrorKind::Unauthorized,
        404 => PlatformErrorKind::BadRequest,
        403 => PlatformErrorKind::Blocked,
        409 => PlatformErrorKind::Conflict,
        429 => PlatformErrorKind::RateLimited {
            retry_after: retry_after.map(Duration::from_secs),
        },
        400 => {
            let d = description.to_ascii_lowercase();
            if d.contains("chat not found") || d.contains("user not found") {
                PlatformErrorKind::ChatNotFound
            } else {
                PlatformErrorKind::BadRequest
            }
        }
        c if c >= 500 => PlatformErrorKind::Server,
        _ => PlatformErrorKind::BadRequest,
    }
}

/// Telegram Bot API client.
#[derive(Clone)]
pub struct TelegramClient {
    token: String,
    api_base: String,
    client: reqwest::Client,
}

impl fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramClient")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl TelegramClient {
    pub fn new(token: impl Into<String>, api_base: Option<String>) -> Self {
        let api_base = api_base
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| TELEGRAM_API_BASE.to_string());
        Self {
            token: token.into(),
            api_base,
            client: reqwest::Client::new(),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<T, PlatformError> {
        let url = format!("{}/bot{}/{}", self.api_base, self.token, method);
        let res = self
            .client
            .post(&url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await?;
        let status = res.status();
        let bytes = res.bytes().await?;
        let data: ApiResponse<T> = match serde_json::from_slice(&bytes) {
            Ok(d) => d,
            Err(e) if status.is_success() => {
                return Err(PlatformError::new(
                    PlatformErrorKind::Decode,
                    format!("{}: {}", method, e),
                ));
            }
            Err(_) => {
                return Err(PlatformError::new(
                    error_kind(method, i64::from(status.as_u16()), "", None),
                    format!("{} failed: {}", method, status),
                ));
            }
        };
        if data.ok {
            return data.result.ok_or_else(|| {
                PlatformError::new(
                    PlatformErrorKind::Decode,
                    format!("{} returned ok without a result", method),
                )
            });
        }
        let code = data.error_code.unwrap_or(i64::from(status.as_u16()));
        let description = data.description.unwrap_or_default();
        let retry_after = data.parameters.and_then(|p| p.retry_after);
        Err(PlatformError::new(
            error_kind(method, code, &description, retry_after),
            format!("{} failed: {} {}", method, code, description),
        ))
    }
}

#[async_trait]
impl Messenger for TelegramClient {
    async fn send_text(&self, subject: SubjectId, text: &str) -> Result<MessageRef, PlatformError> {
        let body = serde_json::json!({ "chat_id": subject.0, "text": text });
        let sent: SentMessage = self.call("sendMessage", body, REQUEST_TIMEOUT).await?;
        Ok(MessageRef {
            subject,
            message_id: sent.message_id,
        })
    }

    async fn delete_message(&self, message: MessageRef) -> Result<(), PlatformError> {
        let body = serde_json::json!({
            "chat_id": message.subject.0,
            "message_id": message.message_id,
        });
        let _: bool = self.call("deleteMessage", body, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), PlatformError> {
        let mut body = serde_json::json!({ "callback_query_id": callback_id });
        if let Some(t) = text {
            body["text"] = serde_json::Value::String(t.to_string());
        }
        let _: bool = self.call("answerCallbackQuery", body, REQUEST_TIMEOUT).await?;
        Ok(())
    }
}

#[async_trait]
impl BotApi for TelegramClient {
    async fn get_updates(&self, offset: Option<i64>, timeout_secs: u64) -> Result<UpdateBatch, PlatformError> {
        let mut body = serde_json::json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message", "edited_message", "channel_post", "callback_query"],
        });
        if let Some(off) = offset {
            body["offset"] = serde_json::Value::from(off);
        }
        let http_timeout = Duration::from_secs(timeout_secs) + LONG_POLL_GRACE;
        let updates: Vec<TelegramUpdate> = self.call("getUpdates", body, http_timeout).await?;
        let next_offset = updates.iter().map(|u| u.update_id).max().map(|id| id + 1);
        let events = updates
            .into_iter()
            .filter_map(|u| {
                let id = u.update_id;
                let event = u.into_event();
                if event.is_none() {
                    log::debug!("telegram: update {} has no subject, skipping", id);
                }
                event
            })
            .collect();
        Ok(UpdateBatch {
            events,
            next_offset,
        })
    }

    async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), PlatformError> {
        let mut body = serde_json::json!({ "url": url });
        if let Some(s) = secret {
            body["secret_token"] = serde_json::Value::String(s.to_string());
        }
        let _: bool = self.call("setWebhook", body, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    async fn webhook_info(&self) -> Result<WebhookInfo, PlatformError> {
        let raw: RawWebhookInfo = self
            .call("getWebhookInfo", serde_json::json!({}), REQUEST_TIMEOUT)
            .await?;
        Ok(WebhookInfo {
            url: raw.url,
            pending_update_count: raw.pending_update_count,
        })
    }

    async fn delete_webhook(&self) -> Result<(), PlatformError> {
        let _: bool = self
            .call("deleteWebhook", serde_json::json!({}), REQUEST_TIMEOUT)
            .await?;
        Ok(())
    }

    fn decode_update(&self, body: &[u8]) -> Result<Option<InboundEvent>, PlatformError> {
        let update: TelegramUpdate = serde_json::from_slice(body)
            .map_err(|e| PlatformError::new(PlatformErrorKind::Decode, e.to_string()))?;
        Ok(update.into_event())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn decode(json: &str) -> Option<InboundEvent> {
        serde_json::from_str::<TelegramUpdate>(json)
            .expect("valid update")
            .into_event()
    }

    #[test]
    fn text_message_becomes_command_or_message() {
        let e = decode(r#"{"update_id":10,"message":{"message_id":1,"date":1700000000,"chat":{"id":42},"text":"/start"}}"#)
            .expect("event");
        assert_eq!(e.kind, EventKind::Command);
        assert_eq!(e.subject, SubjectId(42));
        assert_eq!(e.timestamp.timestamp(), 1_700_000_000);

        let e = decode(r#"{"update_id":11,"message":{"message_id":2,"chat":{"id":42},"text":"hi"}}"#)
            .expect("event");
        assert_eq!(e.kind, EventKind::Message);
    }

    #[test]
    fn callback_query_uses_the_originating_chat() {
        let e = decode(
            r#"{"update_id":12,"callback_query":{"id":"cb1","from":{"id":5},"data":"settings:lang","message":{"message_id":3,"chat":{"id":-100}}}}"#,
        )
        .expect("event");
        assert_eq!(e.kind, EventKind::Callback);
        assert_eq!(e.subject, SubjectId(-100));
        assert_eq!(e.payload.as_deref(), Some("settings:lang"));
        assert_eq!(e.callback_id.as_deref(), Some("cb1"));
    }

    #[test]
    fn update_without_subject_is_dropped() {
        assert!(decode(r#"{"update_id":13,"poll":{"id":"p"}}"#).is_none());
    }

    #[test]
    fn error_codes_map_to_kinds() {
        assert_eq!(
            error_kind("sendMessage", 401, "Unauthorized", None),
            PlatformErrorKind::Unauthorized
        );
        assert_eq!(
            error_kind("sendMessage", 403, "Forbidden: bot was blocked by the user", None),
            PlatformErrorKind::Blocked
        );
        assert_eq!(
            error_kind("sendMessage", 400, "Bad Request: chat not found", None),
            PlatformErrorKind::ChatNotFound
        );
        assert_eq!(
            error_kind("sendMessage", 400, "Bad Request: message text is empty", None),
            PlatformErrorKind::BadRequest
        );
        assert_eq!(
            error_kind("sendMessage", 429, "Too Many Requests: retry after 5", Some(5)),
            PlatformErrorKind::RateLimited {
                retry_after: Some(Duration::from_secs(5))
            }
        );
        assert_eq!(error_kind("sendMessage", 502, "Bad Gateway", None), PlatformErrorKind::Server);
    }

    #[test]
    fn stray_404_is_fatal_only_for_update_fetch() {
        assert_eq!(
            error_kind("getUpdates", 404, "Not Found", None),
            PlatformErrorKind::Unauthorized
        );
        assert_eq!(
            error_kind("deleteMessage", 404, "Not Found", None),
            PlatformErrorKind::BadRequest
        );
    }

    #[test]
    fn error_envelope_without_result_decodes() {
        let r: ApiResponse<SentMessage> = serde_json::from_str(
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests","parameters":{"retry_after":3}}"#,
        )
        .expect("error envelope");
        assert!(!r.ok);
        assert!(r.result.is_none());
        assert_eq!(r.parameters.and_then(|p| p.retry_after), Some(3));

        let r: ApiResponse<SentMessage> =
            serde_json::from_str(r#"{"ok":true,"result":{"message_id":9}}"#).expect("ok envelope");
        assert_eq!(r.result.map(|m| m.message_id), Some(9));
    }
}
