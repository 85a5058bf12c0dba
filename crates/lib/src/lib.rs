//! Herald core library: update intake, dispatch, retries, and rate limiting for a
//! Telegram bot, used by the CLI.

pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod gateway;
pub mod limiter;
pub mod notifier;
pub mod retry;
pub mod transport;
