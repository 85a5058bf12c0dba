//! Priority routing: command, then callback, then active conversation state, then fallback.
//!
//! The first matching branch wins and later branches are not evaluated, so an explicit
//! command is never swallowed by a stale conversation state.

use super::state::{ConversationState, StateMachine};
use crate::channels::Messenger;
use crate::event::{EventKind, InboundEvent, SubjectId};
use crate::retry::{RetryContext, RetryError, RetryPolicy};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Handles textual commands.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Name used in logs and route outcomes.
    fn name(&self) -> &str;
    fn can_handle(&self, event: &InboundEvent) -> bool;
    async fn handle(&self, event: &InboundEvent, ct: &CancellationToken) -> anyhow::Result<()>;
}

/// Handles button presses, matched on the callback payload.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    fn name(&self) -> &str;
    fn can_handle(&self, event: &InboundEvent) -> bool;
    async fn handle(&self, event: &InboundEvent, ct: &CancellationToken) -> anyhow::Result<()>;
}

/// Reaction to input nothing else claimed. Must return quickly; work runs detached.
pub trait FallbackNotifier: Send + Sync {
    fn notify_fallback(&self, subject: SubjectId);
}

/// Command and callback handlers, in match order. Built once at startup and never mutated.
#[derive(Default)]
pub struct HandlerTable {
    commands: Vec<Arc<dyn CommandHandler>>,
    callbacks: Vec<Arc<dyn CallbackHandler>>,
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    pub fn command_names(&self) -> Vec<&str> {
        self.commands.iter().map(|h| h.name()).collect()
    }
}

#[derive(Default)]
pub struct HandlerTableBuilder {
    table: HandlerTable,
}

impl HandlerTableBuilder {
    pub fn command(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.table.commands.push(handler);
        self
    }

    pub fn callback(mut self, handler: Arc<dyn CallbackHandler>) -> Self {
        self.table.callbacks.push(handler);
        self
    }

    pub fn build(self) -> Arc<HandlerTable> {
        Arc::new(self.table)
    }
}

/// Which branch handled an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Command(String),
    Callback(String),
    State(String),
    Fallback,
}

pub struct PriorityRouter {
    handlers: Arc<HandlerTable>,
    states: Arc<dyn StateMachine>,
    fallback: Arc<dyn FallbackNotifier>,
    messenger: Arc<dyn Messenger>,
    retry: RetryPolicy,
}

impl PriorityRouter {
    pub fn new(
        handlers: Arc<HandlerTable>,
        states: Arc<dyn StateMachine>,
        fallback: Arc<dyn FallbackNotifier>,
        messenger: Arc<dyn Messenger>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            handlers,
            states,
            fallback,
            messenger,
            retry,
        }
    }

    /// Route one event to exactly one branch.
    pub async fn route(
        &self,
        event: &InboundEvent,
        ct: &CancellationToken,
    ) -> anyhow::Result<RouteOutcome> {
        let outcome = self.resolve(event, ct).await;
        if let Some(id) = event.callback_id.as_deref() {
            if let Err(e) = self.messenger.answer_callback(id, None).await {
                log::debug!("router: answering callback {} failed: {}", id, e);
            }
        }
        outcome
    }

    async fn resolve(
        &self,
        event: &InboundEvent,
        ct: &CancellationToken,
    ) -> anyhow::Result<RouteOutcome> {
        if event.kind == EventKind::Command {
            if let Some(h) = self.handlers.commands.iter().find(|h| h.can_handle(event)) {
                log::debug!("router: event {} -> command {}", event.id, h.name());
                h.handle(event, ct)
                    .await
                    .with_context(|| format!("command handler {}", h.name()))?;
                return Ok(RouteOutcome::Command(h.name().to_string()));
            }
        }

        if event.kind == EventKind::Callback {
            if let Some(h) = self.handlers.callbacks.iter().find(|h| h.can_handle(event)) {
                log::debug!("router: event {} -> callback {}", event.id, h.name());
                h.handle(event, ct)
                    .await
                    .with_context(|| format!("callback handler {}", h.name()))?;
                return Ok(RouteOutcome::Callback(h.name().to_string()));
            }
        }

        let subject = event.subject;
        let state = self
            .retry
            .execute(RetryContext::for_subject("state.get", subject), ct, || {
                self.states.current_state(subject, ct)
            })
            .await
            .map_err(anyhow::Error::new)
            .context("loading conversation state")?;

        if let ConversationState::Named { name, .. } = state {
            log::debug!("router: event {} -> state {}", event.id, name);
            let processed = self
                .retry
                .execute(RetryContext::for_subject("state.process", subject), ct, || {
                    self.states.process(subject, event, ct)
                })
                .await;
            return match processed {
                Ok(()) => Ok(RouteOutcome::State(name)),
                Err(e @ RetryError::Exhausted { .. }) => {
                    self.clear_stuck_state(subject, &name, ct).await;
                    Err(anyhow::Error::new(e).context(format!("processing state {}", name)))
                }
                Err(e) => Err(anyhow::Error::new(e).context(format!("processing state {}", name))),
            };
        }

        log::debug!("router: event {} -> fallback", event.id);
        self.fallback.notify_fallback(subject);
        Ok(RouteOutcome::Fallback)
    }

    /// Best-effort reset so a failing state does not capture the subject forever.
    async fn clear_stuck_state(&self, subject: SubjectId, name: &str, ct: &CancellationToken) {
        let cleared = self
            .retry
            .execute(RetryContext::for_subject("state.clear", subject), ct, || {
                self.states.clear_state(subject, ct)
            })
            .await;
        match cleared {
            Ok(()) => log::warn!("router: cleared state {} for subject {} after repeated failures", name, subject),
            Err(e) => log::error!("router: could not clear state {} for subject {}: {}", name, subject, e),
        }
    }
}

#[async_trait]
impl super::pipeline::Dispatch for PriorityRouter {
    async fn dispatch(&self, event: &InboundEvent, ct: &CancellationToken) -> anyhow::Result<()> {
        let outcome = self.route(event, ct).await?;
        log::debug!("router: event {} routed to {:?}", event.id, outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MessageRef;
    use crate::error::PlatformError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Command {
        name: &'static str,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CommandHandler for Command {
        fn name(&self) -> &str {
            self.name
        }

        fn can_handle(&self, event: &InboundEvent) -> bool {
            event.command_name() == Some(self.name)
        }

        async fn handle(&self, _event: &InboundEvent, _ct: &CancellationToken) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Button;

    #[async_trait]
    impl CallbackHandler for Button {
        fn name(&self) -> &str {
            "settings"
        }

        fn can_handle(&self, event: &InboundEvent) -> bool {
            event
                .payload
                .as_deref()
                .is_some_and(|p| p.starts_with("settings:"))
        }

        async fn handle(&self, _event: &InboundEvent, _ct: &CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct States {
        state: Option<&'static str>,
        failing: bool,
        lookups: AtomicU32,
        processed: AtomicU32,
        cleared: AtomicU32,
    }

    #[async_trait]
    impl StateMachine for States {
        async fn current_state(
            &self,
            _subject: SubjectId,
            _ct: &CancellationToken,
        ) -> anyhow::Result<ConversationState> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .state
                .map(ConversationState::named)
                .unwrap_or(ConversationState::NoState))
        }

        async fn process(
            &self,
            _subject: SubjectId,
            _event: &InboundEvent,
            _ct: &CancellationToken,
        ) -> anyhow::Result<()> {
            self.processed.fetch_add(1, Ordering::SeqCst);
            if self.failing {
                anyhow::bail!("state store timeout");
            }
            Ok(())
        }

        async fn clear_state(&self, _subject: SubjectId, _ct: &CancellationToken) -> anyhow::Result<()> {
            self.cleared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Fallbacks(Mutex<Vec<SubjectId>>);

    impl FallbackNotifier for Fallbacks {
        fn notify_fallback(&self, subject: SubjectId) {
            self.0.lock().unwrap().push(subject);
        }
    }

    #[derive(Default)]
    struct Acks(Mutex<Vec<String>>);

    #[async_trait]
    impl Messenger for Acks {
        async fn send_text(&self, subject: SubjectId, _text: &str) -> Result<MessageRef, PlatformError> {
            Ok(MessageRef {
                subject,
                message_id: 1,
            })
        }

        async fn delete_message(&self, _message: MessageRef) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn answer_callback(&self, callback_id: &str, _text: Option<&str>) -> Result<(), PlatformError> {
            self.0.lock().unwrap().push(callback_id.to_string());
            Ok(())
        }
    }

    struct Fixture {
        start: Arc<Command>,
        states: Arc<States>,
        fallbacks: Arc<Fallbacks>,
        acks: Arc<Acks>,
        router: PriorityRouter,
    }

    fn fixture(states: States) -> Fixture {
        let start = Arc::new(Command {
            name: "start",
            calls: AtomicU32::new(0),
        });
        let states = Arc::new(states);
        let fallbacks = Arc::new(Fallbacks::default());
        let acks = Arc::new(Acks::default());
        let table = HandlerTable::builder()
            .command(start.clone())
            .callback(Arc::new(Button))
            .build();
        let router = PriorityRouter::new(
            table,
            states.clone(),
            fallbacks.clone(),
            acks.clone(),
            RetryPolicy::default(),
        );
        Fixture {
            start,
            states,
            fallbacks,
            acks,
            router,
        }
    }

    #[tokio::test]
    async fn command_wins_over_active_state() {
        let f = fixture(States {
            state: Some("AwaitingEmail"),
            ..Default::default()
        });
        let event = InboundEvent::text(1, SubjectId(7), "/start");
        let outcome = f.router.route(&event, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Command("start".to_string()));
        assert_eq!(f.start.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.states.lookups.load(Ordering::SeqCst), 0);
        assert_eq!(f.states.processed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn free_text_goes_to_active_state() {
        let f = fixture(States {
            state: Some("AwaitingEmail"),
            ..Default::default()
        });
        let event = InboundEvent::text(2, SubjectId(7), "me@example.com");
        let outcome = f.router.route(&event, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RouteOutcome::State("AwaitingEmail".to_string()));
        assert!(f.fallbacks.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_command_falls_through_to_fallback() {
        let f = fixture(States::default());
        let event = InboundEvent::text(3, SubjectId(7), "/unknown");
        let outcome = f.router.route(&event, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Fallback);
        assert_eq!(*f.fallbacks.0.lock().unwrap(), vec![SubjectId(7)]);
    }

    #[tokio::test]
    async fn matched_callback_is_handled_and_acknowledged() {
        let f = fixture(States::default());
        let event = InboundEvent::callback(4, SubjectId(7), "cb-4", Some("settings:lang".to_string()));
        let outcome = f.router.route(&event, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Callback("settings".to_string()));
        assert_eq!(*f.acks.0.lock().unwrap(), vec!["cb-4".to_string()]);
        assert_eq!(f.states.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_state_processing_clears_the_state() {
        let f = fixture(States {
            state: Some("AwaitingEmail"),
            failing: true,
            ..Default::default()
        });
        let event = InboundEvent::text(5, SubjectId(7), "hello");
        let err = f
            .router
            .route(&event, &CancellationToken::new())
            .await
            .expect_err("processing fails");
        assert!(format!("{:#}", err).contains("AwaitingEmail"));
        assert_eq!(f.states.processed.load(Ordering::SeqCst), 3);
        assert_eq!(f.states.cleared.load(Ordering::SeqCst), 1);
        assert!(f.fallbacks.0.lock().unwrap().is_empty());
    }
}
