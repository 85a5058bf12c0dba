//! Outbound notification rate limiting over shared sliding windows.
//!
//! Windows are evaluated relative to "now" on every call, so counts fall as entries age out
//! without any sweeper. The limiter fails open: when the store stays unreachable after its
//! short retry, checks report "not over limit" and increments are skipped.

mod clock;
mod redis_store;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use redis_store::RedisWindowStore;
pub use store::{MemoryWindowStore, StoreError, WindowRequest, WindowStore};

use crate::channels::{MessageRef, Messenger};
use crate::error::PlatformError;
use crate::event::SubjectId;
use crate::retry::{RetryContext, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Seconds added to the window length when setting key expiry.
pub const DEFAULT_EXPIRY_SAFETY_MARGIN_SECS: u64 = 60;
/// Store attempts before failing open.
pub const DEFAULT_STORE_ATTEMPTS: u32 = 2;
/// Linear backoff step between store attempts.
pub const DEFAULT_STORE_BACKOFF: Duration = Duration::from_millis(100);

/// A named limit applied per subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub name: String,
    pub limit: u64,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(name: impl Into<String>, limit: u64, window: Duration) -> Self {
        Self {
            name: name.into(),
            limit,
            window,
        }
    }

    /// Store key of this policy's window for `subject`.
    pub fn key(&self, prefix: &str, subject: SubjectId) -> String {
        format!("{}{}:{}", prefix, self.name, subject)
    }
}

/// Sliding-window limiter over a [`WindowStore`].
pub struct SlidingWindowLimiter {
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    expiry_margin_secs: u64,
}

impl SlidingWindowLimiter {
    /// Limiter with the default store retry (2 attempts, 100ms linear) and expiry margin (60s).
    pub fn new(store: Arc<dyn WindowStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retry: RetryPolicy::linear(DEFAULT_STORE_ATTEMPTS, DEFAULT_STORE_BACKOFF),
            expiry_margin_secs: DEFAULT_EXPIRY_SAFETY_MARGIN_SECS,
        }
    }

    /// Process-local limiter on the system clock.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryWindowStore::new()), Arc::new(SystemClock))
    }

    pub fn with_store_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_expiry_margin(mut self, margin_secs: u64) -> Self {
        self.expiry_margin_secs = margin_secs;
        self
    }

    fn request<'a>(&self, key: &'a str, window: Duration) -> WindowRequest<'a> {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let window_secs = window.as_millis().div_ceil(1000);
        WindowRequest {
            key,
            now_ms: self.clock.now_millis(),
            window_ms,
            expiry_secs: u64::try_from(window_secs)
                .unwrap_or(u64::MAX)
                .saturating_add(self.expiry_margin_secs),
        }
    }

    /// True when `key` already holds `limit` or more entries in `window`. Never mutates.
    pub async fn check_only(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        ct: &CancellationToken,
    ) -> bool {
        let req = self.request(key, window);
        let result = self
            .retry
            .execute(RetryContext::new("limiter.check"), ct, || self.store.count(req))
            .await;
        match result {
            Ok(count) => count >= limit,
            Err(e) => {
                log::warn!("limiter: check for {} failed, allowing: {}", key, e);
                false
            }
        }
    }

    /// Record one entry at now for `key`, without checking any limit.
    pub async fn increment_only(&self, key: &str, window: Duration, ct: &CancellationToken) {
        let req = self.request(key, window);
        let result = self
            .retry
            .execute(RetryContext::new("limiter.increment"), ct, || self.store.insert(req))
            .await;
        if let Err(e) = result {
            log::warn!("limiter: increment for {} failed, skipping: {}", key, e);
        }
    }

    /// Atomically check and record. Returns true (over limit, nothing recorded) when `key` already
    /// holds `limit` entries in `window`; otherwise records the call and returns false.
    pub async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        ct: &CancellationToken,
    ) -> bool {
        let req = self.request(key, window);
        let result = self
            .retry
            .execute(RetryContext::new("limiter.check_and_increment"), ct, || {
                self.store.insert_below(req, limit)
            })
            .await;
        match result {
            Ok(count) => count >= limit,
            Err(e) => {
                log::warn!("limiter: check-and-increment for {} failed, allowing: {}", key, e);
                false
            }
        }
    }
}

/// Result of a gated send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Sent(MessageRef),
    Throttled,
}

/// Rate-limited outbound notifications: check before sending, record only what was delivered.
pub struct NotificationGate {
    limiter: Arc<SlidingWindowLimiter>,
    messenger: Arc<dyn Messenger>,
    policy: RateLimitPolicy,
    key_prefix: String,
}

impl NotificationGate {
    pub fn new(
        limiter: Arc<SlidingWindowLimiter>,
        messenger: Arc<dyn Messenger>,
        policy: RateLimitPolicy,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            limiter,
            messenger,
            policy,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Send `text` to `subject` unless the subject is over the policy limit.
    pub async fn send(
        &self,
        subject: SubjectId,
        text: &str,
        ct: &CancellationToken,
    ) -> Result<GateOutcome, PlatformError> {
        let key = self.policy.key(&self.key_prefix, subject);
        if self
            .limiter
            .check_only(&key, self.policy.limit, self.policy.window, ct)
            .await
        {
            log::debug!("limiter: {} notification to {} throttled", self.policy.name, subject);
            return Ok(GateOutcome::Throttled);
        }
        let sent = self.messenger.send_text(subject, text).await?;
        self.limiter.increment_only(&key, self.policy.window, ct).await;
        Ok(GateOutcome::Sent(sent))
    }
}
