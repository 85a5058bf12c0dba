//! Messaging platform seams and the Telegram implementation.
//!
//! Transports and dispatch depend on the [`BotApi`] / [`Messenger`] traits only, so the
//! platform client can be swapped (or faked in tests).

mod api;
mod telegram;

pub use api::{BotApi, MessageRef, Messenger, UpdateBatch, WebhookInfo};
pub use telegram::{TelegramClient, TelegramUpdate, TELEGRAM_API_BASE};
