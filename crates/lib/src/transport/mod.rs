//! Update intake: webhook push or long-poll, with automatic fallback to long-poll.
//!
//! Exactly one mode is active at a time. Every accepted event runs as its own task through
//! the dispatch pipeline; `stop` tears down the active mode and drains in-flight events.

mod long_poll;

use crate::channels::BotApi;
use crate::dispatch::Pipeline;
use crate::error::{PlatformError, PlatformErrorKind};
use crate::event::InboundEvent;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Header carrying the webhook shared secret.
pub const SECRET_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";

/// How long `stop` waits for in-flight events before cancelling them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportMode {
    Webhook,
    #[default]
    LongPoll,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Webhook => f.write_str("webhook"),
            TransportMode::LongPoll => f.write_str("longPoll"),
        }
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "webhook" => Ok(TransportMode::Webhook),
            "longpoll" | "poll" => Ok(TransportMode::LongPoll),
            other => Err(format!("unknown transport mode: {}", other)),
        }
    }
}

/// Transport settings resolved from config.
#[derive(Debug, Clone, Default)]
pub struct TransportSettings {
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub poll_timeout_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bot token rejected by the platform: {0}")]
    Unauthorized(PlatformError),
}

#[derive(Debug, thiserror::Error)]
enum WebhookSetupError {
    #[error("no webhook url configured")]
    NotConfigured,
    #[error("{0}")]
    Platform(#[from] PlatformError),
    #[error("webhook read-back mismatch: expected {expected:?}, platform reports {actual:?}")]
    Mismatch { expected: String, actual: String },
}

/// Outcome of a webhook delivery, mapped to an HTTP status by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookReceipt {
    Accepted,
    /// Valid update without an addressable subject.
    Ignored,
    BadSecret,
    Malformed,
    /// Webhook mode is not active.
    Inactive,
}

struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct TransportListener {
    api: Arc<dyn BotApi>,
    pipeline: Arc<Pipeline>,
    settings: TransportSettings,
    mode: Mutex<Option<TransportMode>>,
    poll: tokio::sync::Mutex<Option<PollTask>>,
    events: TaskTracker,
    events_cancel: Mutex<CancellationToken>,
    fatal: CancellationToken,
}

impl TransportListener {
    pub fn new(api: Arc<dyn BotApi>, pipeline: Arc<Pipeline>, settings: TransportSettings) -> Arc<Self> {
        Arc::new(Self {
            api,
            pipeline,
            settings,
            mode: Mutex::new(None),
            poll: tokio::sync::Mutex::new(None),
            events: TaskTracker::new(),
            events_cancel: Mutex::new(CancellationToken::new()),
            fatal: CancellationToken::new(),
        })
    }

    /// Currently active mode, `None` when stopped or halted by a fatal error.
    pub fn active_mode(&self) -> Option<TransportMode> {
        *self.mode.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_mode(&self, mode: Option<TransportMode>) {
        *self.mode.lock().unwrap_or_else(|p| p.into_inner()) = mode;
    }

    /// Cancelled when intake halts on a fatal platform error (rejected token).
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Start intake in `requested` mode. Webhook mode falls back to long-poll when registration
    /// fails or cannot be verified. Returns the mode actually started.
    pub async fn start(self: &Arc<Self>, requested: TransportMode) -> Result<TransportMode, TransportError> {
        self.stop().await;
        if requested == TransportMode::Webhook {
            match self.register_webhook().await {
                Ok(url) => {
                    self.set_mode(Some(TransportMode::Webhook));
                    log::info!("transport: webhook mode active at {}", url);
                    return Ok(TransportMode::Webhook);
                }
                Err(WebhookSetupError::Platform(e)) if e.kind() == PlatformErrorKind::Unauthorized => {
                    log::error!("transport: webhook registration rejected: {}", e);
                    return Err(TransportError::Unauthorized(e));
                }
                Err(e) => {
                    log::warn!("transport: webhook unavailable, falling back to long-poll: {}", e);
                }
            }
        }
        self.start_long_poll().await?;
        Ok(TransportMode::LongPoll)
    }

    /// Delete-then-set, then verify by reading the registration back.
    async fn register_webhook(&self) -> Result<String, WebhookSetupError> {
        let url = self
            .settings
            .webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(WebhookSetupError::NotConfigured)?;
        if let Err(e) = self.api.delete_webhook().await {
            log::debug!("transport: removing previous webhook failed: {}", e);
        }
        self.api
            .set_webhook(url, self.settings.webhook_secret.as_deref())
            .await?;
        let info = self.api.webhook_info().await?;
        if info.url != url {
            // Leave no half-registered webhook behind; long-poll needs it gone.
            if let Err(e) = self.api.delete_webhook().await {
                log::debug!("transport: removing unverified webhook failed: {}", e);
            }
            return Err(WebhookSetupError::Mismatch {
                expected: url.to_string(),
                actual: info.url,
            });
        }
        Ok(url.to_string())
    }

    async fn start_long_poll(self: &Arc<Self>) -> Result<(), TransportError> {
        match self.api.delete_webhook().await {
            Ok(()) => {}
            Err(e) if e.kind() == PlatformErrorKind::Unauthorized => {
                log::error!("transport: bot token rejected: {}", e);
                return Err(TransportError::Unauthorized(e));
            }
            Err(e) => log::warn!("transport: deleteWebhook before long-poll failed: {}", e),
        }
        let cancel = CancellationToken::new();
        self.set_mode(Some(TransportMode::LongPoll));
        let handle = tokio::spawn(long_poll::run(self.clone(), cancel.clone()));
        *self.poll.lock().await = Some(PollTask { cancel, handle });
        log::info!("transport: long-poll mode active");
        Ok(())
    }

    /// Stop intake, tear down any webhook registration, and drain in-flight events.
    pub async fn stop(&self) {
        let previous = self.active_mode();
        self.set_mode(None);

        if let Some(task) = self.poll.lock().await.take() {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                log::warn!("transport: long-poll task ended abnormally: {}", e);
            }
        }

        if previous == Some(TransportMode::Webhook) {
            if let Err(e) = self.api.delete_webhook().await {
                log::warn!("transport: deleteWebhook on stop failed: {}", e);
            }
        }

        self.drain().await;
        if previous.is_some() {
            log::info!("transport: stopped");
        }
    }

    async fn drain(&self) {
        self.events.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.events.wait()).await.is_err() {
            log::warn!(
                "transport: {} events still running after {:?}, cancelling",
                self.events.len(),
                DRAIN_TIMEOUT
            );
            let token = {
                let mut guard = self.events_cancel.lock().unwrap_or_else(|p| p.into_inner());
                std::mem::take(&mut *guard)
            };
            token.cancel();
            self.events.wait().await;
        }
        self.events.reopen();
    }

    /// Run one event through the pipeline on its own task.
    fn dispatch(&self, event: InboundEvent) {
        let pipeline = self.pipeline.clone();
        let ct = self
            .events_cancel
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .child_token();
        self.events.spawn(async move {
            pipeline.invoke(event, ct).await;
        });
    }

    /// Called by the long-poll loop when the platform rejects the bot token.
    fn halt(&self) {
        self.set_mode(None);
        self.fatal.cancel();
    }

    /// Handle one webhook delivery: verify the shared secret, decode, and dispatch.
    pub fn accept_webhook(&self, secret: Option<&str>, body: &[u8]) -> WebhookReceipt {
        if self.active_mode() != Some(TransportMode::Webhook) {
            return WebhookReceipt::Inactive;
        }
        if let Some(expected) = self.settings.webhook_secret.as_deref() {
            if secret != Some(expected) {
                log::warn!("transport: webhook delivery with invalid secret rejected");
                return WebhookReceipt::BadSecret;
            }
        }
        match self.api.decode_update(body) {
            Ok(Some(event)) => {
                self.dispatch(event);
                WebhookReceipt::Accepted
            }
            Ok(None) => WebhookReceipt::Ignored,
            Err(e) => {
                log::warn!("transport: undecodable webhook body: {}", e);
                WebhookReceipt::Malformed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_cli_spellings() {
        assert_eq!("webhook".parse::<TransportMode>(), Ok(TransportMode::Webhook));
        assert_eq!("long-poll".parse::<TransportMode>(), Ok(TransportMode::LongPoll));
        assert_eq!("longPoll".parse::<TransportMode>(), Ok(TransportMode::LongPoll));
        assert!("smoke-signals".parse::<TransportMode>().is_err());
    }
}
