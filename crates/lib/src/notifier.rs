//! Ephemeral "I didn't get that" notices for unmatched input, throttled per subject.
//!
//! A burst of unmatched events from one subject yields at most one notice per suppression
//! window. The notice is deleted again after a short delay. The throttle is process-local:
//! separate worker processes each keep their own suppression cache.

use crate::channels::Messenger;
use crate::dispatch::FallbackNotifier;
use crate::error::{Classify, FailureClass};
use crate::event::SubjectId;
use crate::retry::{RetryContext, RetryError, RetryPolicy};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub const DEFAULT_FALLBACK_TEXT: &str = "Sorry, I didn't understand that. Send /help to see what I can do.";
pub const DEFAULT_SUPPRESSION_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_DELETE_AFTER: Duration = Duration::from_secs(3);

/// Expired entries are swept once the cache grows past this many subjects.
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Clone)]
pub struct NotifierSettings {
    pub text: String,
    pub suppression_ttl: Duration,
    pub delete_after: Duration,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            text: DEFAULT_FALLBACK_TEXT.to_string(),
            suppression_ttl: DEFAULT_SUPPRESSION_TTL,
            delete_after: DEFAULT_DELETE_AFTER,
        }
    }
}

/// Subject-keyed flags that expire on their own after a fixed TTL.
#[derive(Debug)]
pub struct SuppressionCache {
    ttl: Duration,
    entries: Mutex<HashMap<SubjectId, Instant>>,
}

impl SuppressionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Set the flag for `subject` unless a live one exists. True when this call set it.
    pub fn try_claim(&self, subject: SubjectId) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.len() > SWEEP_THRESHOLD {
            entries.retain(|_, expires| *expires > now);
        }
        match entries.get(&subject) {
            Some(expires) if *expires > now => false,
            _ => {
                entries.insert(subject, now + self.ttl);
                true
            }
        }
    }

    pub fn is_suppressed(&self, subject: SubjectId) -> bool {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.get(&subject).is_some_and(|expires| *expires > now)
    }
}

/// Fallback notifier that sends short-lived notices on supervised background tasks.
pub struct AntiSpamEphemeralNotifier {
    messenger: Arc<dyn Messenger>,
    retry: RetryPolicy,
    settings: NotifierSettings,
    suppression: SuppressionCache,
    tasks: TaskTracker,
}

impl AntiSpamEphemeralNotifier {
    pub fn new(messenger: Arc<dyn Messenger>, retry: RetryPolicy, settings: NotifierSettings) -> Self {
        Self {
            messenger,
            retry,
            suppression: SuppressionCache::new(settings.suppression_ttl),
            settings,
            tasks: TaskTracker::new(),
        }
    }

    /// Schedule a notice for `subject` unless one was sent within the suppression window.
    /// Returns whether a notice was scheduled.
    pub fn notify(&self, subject: SubjectId) -> bool {
        if !self.suppression.try_claim(subject) {
            log::debug!("notifier: fallback notice for {} suppressed", subject);
            return false;
        }
        let messenger = self.messenger.clone();
        let retry = self.retry;
        let text = self.settings.text.clone();
        let delete_after = self.settings.delete_after;
        self.tasks.spawn(async move {
            let work = send_ephemeral(messenger, retry, subject, text, delete_after);
            if AssertUnwindSafe(work).catch_unwind().await.is_err() {
                log::error!("notifier: fallback task for {} panicked", subject);
            }
        });
        true
    }

    /// Stop accepting work and wait for in-flight notices (including pending deletions).
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl FallbackNotifier for AntiSpamEphemeralNotifier {
    fn notify_fallback(&self, subject: SubjectId) {
        self.notify(subject);
    }
}

fn log_failure<E: std::fmt::Display>(what: &str, subject: SubjectId, err: &RetryError<E>) {
    match err.failure_class() {
        FailureClass::Permanent => log::warn!("notifier: {} for {} skipped: {}", what, subject, err),
        FailureClass::Cancelled => log::info!("notifier: {} for {} cancelled", what, subject),
        FailureClass::Transient => log::error!("notifier: {} for {} failed: {}", what, subject, err),
    }
}

async fn send_ephemeral(
    messenger: Arc<dyn Messenger>,
    retry: RetryPolicy,
    subject: SubjectId,
    text: String,
    delete_after: Duration,
) {
    // Detached from the triggering request; nothing cancels this work.
    let ct = CancellationToken::new();
    let sent = retry
        .execute(RetryContext::for_subject("fallback.send", subject), &ct, || {
            messenger.send_text(subject, &text)
        })
        .await;
    let sent = match sent {
        Ok(m) => m,
        Err(e) => {
            log_failure("notice", subject, &e);
            return;
        }
    };
    tokio::time::sleep(delete_after).await;
    let deleted = retry
        .execute(RetryContext::for_subject("fallback.delete", subject), &ct, || {
            messenger.delete_message(sent)
        })
        .await;
    if let Err(e) = deleted {
        log_failure("notice deletion", subject, &e);
    }
}
