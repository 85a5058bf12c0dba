//! Middleware pipeline around the terminal dispatch step.
//!
//! Middlewares run in registration order: the first registered is outermost, the last
//! registered sits right next to dispatch. Each receives a [`Next`] continuation and may act
//! before or after it, or short-circuit by not calling it. The composed chain is frozen at
//! build time and shared by every event.

use crate::error::{Classify, FailureClass};
use crate::event::InboundEvent;
use crate::limiter::{GateOutcome, NotificationGate};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default user-facing notice for internal failures.
pub const DEFAULT_ERROR_NOTICE: &str = "Something went wrong while handling your message. Please try again in a moment.";

/// Terminal action of the pipeline.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, event: &InboundEvent, ct: &CancellationToken) -> anyhow::Result<()>;
}

/// Cross-cutting wrapper around dispatch.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        event: &InboundEvent,
        ct: &CancellationToken,
        next: Next<'_>,
    ) -> anyhow::Result<()>;
}

/// The rest of the chain after the current middleware.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Dispatch,
}

impl Next<'_> {
    pub async fn run(self, event: &InboundEvent, ct: &CancellationToken) -> anyhow::Result<()> {
        match self.middlewares.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    middlewares: rest,
                    terminal: self.terminal,
                };
                head.handle(event, ct, next).await
            }
            None => self.terminal.dispatch(event, ct).await,
        }
    }
}

/// Outer error boundary: turns any failure escaping the chain into a log entry and, for
/// internal failures, one generic notice to the subject.
pub struct ErrorBoundary {
    notice: String,
    gate: Arc<NotificationGate>,
}

impl ErrorBoundary {
    pub fn new(notice: impl Into<String>, gate: Arc<NotificationGate>) -> Self {
        Self {
            notice: notice.into(),
            gate,
        }
    }

    async fn report(&self, event: &InboundEvent, err: anyhow::Error) {
        match err.failure_class() {
            FailureClass::Cancelled => {
                log::info!("dispatch: event {} for subject {} cancelled", event.id, event.subject);
            }
            FailureClass::Permanent => {
                log::warn!(
                    "dispatch: subject {} unreachable, dropping event {}: {:#}",
                    event.subject,
                    event.id,
                    err
                );
            }
            FailureClass::Transient => {
                log::error!(
                    "dispatch: event {} ({}) for subject {} failed: {:#}",
                    event.id,
                    event.kind,
                    event.subject,
                    err
                );
                // Delivery of the notice ignores the event's cancellation.
                let ct = CancellationToken::new();
                match self.gate.send(event.subject, &self.notice, &ct).await {
                    Ok(GateOutcome::Sent(_)) => {}
                    Ok(GateOutcome::Throttled) => {
                        log::debug!("dispatch: error notice to {} throttled", event.subject);
                    }
                    Err(e) => log::warn!("dispatch: error notice to {} failed: {}", event.subject, e),
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Collects middlewares before the pipeline is frozen.
#[derive(Default)]
pub struct PipelineBuilder {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    /// Register a middleware. Later registrations sit closer to dispatch.
    pub fn middleware(mut self, m: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(m);
        self
    }

    pub fn build(self, terminal: Arc<dyn Dispatch>, boundary: ErrorBoundary) -> Pipeline {
        Pipeline {
            middlewares: self.middlewares.into(),
            terminal,
            boundary,
        }
    }
}

/// Frozen middleware chain plus terminal dispatch.
pub struct Pipeline {
    middlewares: Arc<[Arc<dyn Middleware>]>,
    terminal: Arc<dyn Dispatch>,
    boundary: ErrorBoundary,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Run one event through the chain. Never fails: errors and panics stop at the boundary.
    pub async fn invoke(&self, event: InboundEvent, ct: CancellationToken) {
        let next = Next {
            middlewares: &self.middlewares[..],
            terminal: self.terminal.as_ref(),
        };
        let result = AssertUnwindSafe(next.run(&event, &ct)).catch_unwind().await;
        let err = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(payload) => anyhow::anyhow!("handler panicked: {}", panic_message(payload.as_ref())),
        };
        self.boundary.report(&event, err).await;
    }
}

/// Logs every event with its outcome and elapsed time.
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        event: &InboundEvent,
        ct: &CancellationToken,
        next: Next<'_>,
    ) -> anyhow::Result<()> {
        let started = Instant::now();
        log::debug!("dispatch: event {} ({}) from subject {}", event.id, event.kind, event.subject);
        let result = next.run(event, ct).await;
        match &result {
            Ok(()) => log::info!(
                "dispatch: event {} ({}) from subject {} handled in {:?}",
                event.id,
                event.kind,
                event.subject,
                started.elapsed()
            ),
            Err(_) => log::debug!(
                "dispatch: event {} failed after {:?}",
                event.id,
                started.elapsed()
            ),
        }
        result
    }
}
