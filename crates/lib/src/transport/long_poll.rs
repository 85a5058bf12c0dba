//! getUpdates loop.

use super::TransportListener;
use crate::error::PlatformErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pause after a failed fetch when the platform gives no retry hint.
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Sleep unless cancelled first. Returns false when cancelled.
async fn pause(cancel: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

pub(super) async fn run(listener: Arc<TransportListener>, cancel: CancellationToken) {
    let mut offset: Option<i64> = None;
    let timeout = listener.settings.poll_timeout_secs;
    log::info!("transport: getUpdates loop started (timeout {}s)", timeout);
    loop {
        let fetched = tokio::select! {
            _ = cancel.cancelled() => break,
            r = listener.api.get_updates(offset, timeout) => r,
        };
        let err = match fetched {
            Ok(batch) => {
                if batch.next_offset.is_some() {
                    offset = batch.next_offset;
                }
                for event in batch.events {
                    listener.dispatch(event);
                }
                continue;
            }
            Err(e) => e,
        };
        let delay = match err.kind() {
            PlatformErrorKind::Unauthorized => {
                log::error!("transport: bot token rejected, stopping getUpdates loop: {}", err);
                listener.halt();
                break;
            }
            PlatformErrorKind::Blocked | PlatformErrorKind::ChatNotFound => {
                log::warn!("transport: getUpdates reported an unreachable subject: {}", err);
                FETCH_ERROR_BACKOFF
            }
            PlatformErrorKind::RateLimited { retry_after } => {
                let wait = retry_after.unwrap_or(FETCH_ERROR_BACKOFF);
                log::warn!("transport: getUpdates rate limited, waiting {:?}: {}", wait, err);
                wait
            }
            PlatformErrorKind::Conflict => {
                log::warn!("transport: getUpdates conflicts with a webhook, removing it: {}", err);
                if let Err(e) = listener.api.delete_webhook().await {
                    log::warn!("transport: deleteWebhook failed: {}", e);
                }
                FETCH_ERROR_BACKOFF
            }
            _ => {
                log::warn!("transport: getUpdates failed: {}", err);
                FETCH_ERROR_BACKOFF
            }
        };
        if !pause(&cancel, delay).await {
            break;
        }
    }
    log::info!("transport: getUpdates loop stopped");
}
