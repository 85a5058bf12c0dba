//! Backing store contract for sliding windows, plus an in-process implementation.
//!
//! Each operation is atomic per key: prune, count, and the optional insert happen as one step,
//! so concurrent callers on the same key never observe each other's intermediate state.

use crate::error::{Classify, FailureClass};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Limiter store failure. Always transient from the caller's point of view.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("limiter store unavailable: {0}")]
    Unavailable(String),
    #[error("limiter store returned an unexpected reply: {0}")]
    Protocol(String),
}

impl Classify for StoreError {
    fn failure_class(&self) -> FailureClass {
        FailureClass::Transient
    }
}

/// Arguments shared by all window operations.
#[derive(Debug, Clone, Copy)]
pub struct WindowRequest<'a> {
    pub key: &'a str,
    pub now_ms: i64,
    pub window_ms: i64,
    /// Key time-to-live applied on insert.
    pub expiry_secs: u64,
}

impl WindowRequest<'_> {
    /// Entries at or before this instant are outside the window.
    pub fn cutoff_ms(&self) -> i64 {
        self.now_ms.saturating_sub(self.window_ms)
    }
}

/// Atomic sliding-window operations.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Prune, then return the number of entries in the window. Never inserts.
    async fn count(&self, req: WindowRequest<'_>) -> Result<u64, StoreError>;

    /// Prune, insert an entry at `now_ms`, refresh expiry. Returns the count after insert.
    async fn insert(&self, req: WindowRequest<'_>) -> Result<u64, StoreError>;

    /// Prune and count; insert only when the count is below `limit`. Returns the count before
    /// the (possible) insert, so the caller is over the limit iff the result is `>= limit`.
    async fn insert_below(&self, req: WindowRequest<'_>, limit: u64) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct Window {
    entries: Vec<i64>,
    expires_at_ms: i64,
}

impl Window {
    fn prune(&mut self, req: &WindowRequest<'_>) {
        if self.expires_at_ms <= req.now_ms {
            self.entries.clear();
        }
        let cutoff = req.cutoff_ms();
        self.entries.retain(|&t| t > cutoff);
    }

    fn push(&mut self, req: &WindowRequest<'_>) {
        self.entries.push(req.now_ms);
        let ttl_ms = i64::try_from(req.expiry_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        self.expires_at_ms = req.now_ms.saturating_add(ttl_ms);
    }

    fn len(&self) -> u64 {
        self.entries.len() as u64
    }
}

/// Process-local store. Shares the atomicity guarantee of the remote store but not its scope:
/// counters are per process.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_window<T>(&self, req: &WindowRequest<'_>, f: impl FnOnce(&mut Window) -> T) -> T {
        let mut windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());
        let window = windows.entry(req.key.to_string()).or_default();
        window.prune(req);
        let out = f(window);
        if window.entries.is_empty() {
            windows.remove(req.key);
        }
        out
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn count(&self, req: WindowRequest<'_>) -> Result<u64, StoreError> {
        Ok(self.with_window(&req, |w| w.len()))
    }

    async fn insert(&self, req: WindowRequest<'_>) -> Result<u64, StoreError> {
        Ok(self.with_window(&req, |w| {
            w.push(&req);
            w.len()
        }))
    }

    async fn insert_below(&self, req: WindowRequest<'_>, limit: u64) -> Result<u64, StoreError> {
        Ok(self.with_window(&req, |w| {
            let count = w.len();
            if count < limit {
                w.push(&req);
            }
            count
        }))
    }
}
