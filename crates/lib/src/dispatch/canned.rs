//! Config-driven command handler that answers fixed commands with fixed text.

use super::router::CommandHandler;
use crate::channels::Messenger;
use crate::event::InboundEvent;
use crate::retry::{RetryContext, RetryPolicy};
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Replies to `/name` with the configured text.
pub struct CannedReplies {
    replies: HashMap<String, String>,
    messenger: Arc<dyn Messenger>,
    retry: RetryPolicy,
}

impl CannedReplies {
    /// `replies` keys may be given with or without the leading `/`; matching ignores case.
    pub fn new(
        replies: &HashMap<String, String>,
        messenger: Arc<dyn Messenger>,
        retry: RetryPolicy,
    ) -> Self {
        let replies = replies
            .iter()
            .map(|(k, v)| (k.trim().trim_start_matches('/').to_lowercase(), v.clone()))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        Self {
            replies,
            messenger,
            retry,
        }
    }

    fn reply_for(&self, event: &InboundEvent) -> Option<&str> {
        let name = event.command_name()?.to_lowercase();
        self.replies.get(&name).map(String::as_str)
    }
}

#[async_trait]
impl CommandHandler for CannedReplies {
    fn name(&self) -> &str {
        "canned"
    }

    fn can_handle(&self, event: &InboundEvent) -> bool {
        self.reply_for(event).is_some()
    }

    async fn handle(&self, event: &InboundEvent, ct: &CancellationToken) -> anyhow::Result<()> {
        let Some(text) = self.reply_for(event) else {
            return Ok(());
        };
        self.retry
            .execute(RetryContext::for_subject("command.reply", event.subject), ct, || {
                self.messenger.send_text(event.subject, text)
            })
            .await
            .map_err(anyhow::Error::new)
            .context("sending canned reply")?;
        Ok(())
    }
}
