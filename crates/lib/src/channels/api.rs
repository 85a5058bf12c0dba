//! Platform seams: outbound messaging and update delivery.
//!
//! The transport and dispatch layers only talk to these traits; the Telegram client is one
//! implementation, test fakes are others.

use crate::error::PlatformError;
use crate::event::{InboundEvent, SubjectId};
use async_trait::async_trait;

/// A message the bot sent, addressable for later deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub subject: SubjectId,
    pub message_id: i64,
}

/// Outbound operations consumed by handlers, the notifier, and the error boundary.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send a plain text message to a subject.
    async fn send_text(&self, subject: SubjectId, text: &str) -> Result<MessageRef, PlatformError>;

    /// Delete a previously sent message.
    async fn delete_message(&self, message: MessageRef) -> Result<(), PlatformError>;

    /// Acknowledge a callback query so the client stops its progress indicator.
    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), PlatformError>;
}

/// Registered webhook as reported by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookInfo {
    /// Empty when no webhook is registered.
    pub url: String,
    pub pending_update_count: u64,
}

/// One long-poll result: normalized events and the offset to acknowledge them.
#[derive(Debug, Default)]
pub struct UpdateBatch {
    pub events: Vec<InboundEvent>,
    /// Offset for the next fetch; `None` when the batch was empty.
    pub next_offset: Option<i64>,
}

/// Update delivery operations used by the transport listener.
#[async_trait]
pub trait BotApi: Messenger {
    /// Block up to `timeout_secs` for new updates after `offset`.
    async fn get_updates(&self, offset: Option<i64>, timeout_secs: u64) -> Result<UpdateBatch, PlatformError>;

    /// Register `url` for push delivery, with an optional shared secret.
    async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), PlatformError>;

    /// Read back the current registration.
    async fn webhook_info(&self) -> Result<WebhookInfo, PlatformError>;

    /// Remove any push registration.
    async fn delete_webhook(&self) -> Result<(), PlatformError>;

    /// Decode a webhook request body. `Ok(None)` for updates with no addressable subject.
    fn decode_update(&self, body: &[u8]) -> Result<Option<InboundEvent>, PlatformError>;
}
