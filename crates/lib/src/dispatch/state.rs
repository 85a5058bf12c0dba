//! Conversation state contract. State storage and lifecycle live outside this crate.

use crate::event::{InboundEvent, SubjectId};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Current conversation state of a subject.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationState {
    NoState,
    Named {
        name: String,
        data: Option<serde_json::Value>,
    },
}

impl ConversationState {
    pub fn named(name: impl Into<String>) -> Self {
        ConversationState::Named {
            name: name.into(),
            data: None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            ConversationState::NoState => None,
            ConversationState::Named { name, .. } => Some(name),
        }
    }
}

/// External multi-step conversation engine.
#[async_trait]
pub trait StateMachine: Send + Sync {
    async fn current_state(
        &self,
        subject: SubjectId,
        ct: &CancellationToken,
    ) -> anyhow::Result<ConversationState>;

    /// Let the active state consume `event`.
    async fn process(
        &self,
        subject: SubjectId,
        event: &InboundEvent,
        ct: &CancellationToken,
    ) -> anyhow::Result<()>;

    async fn clear_state(&self, subject: SubjectId, ct: &CancellationToken) -> anyhow::Result<()>;
}

/// State machine for bots without multi-step conversations: nobody is ever in a state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stateless;

#[async_trait]
impl StateMachine for Stateless {
    async fn current_state(
        &self,
        _subject: SubjectId,
        _ct: &CancellationToken,
    ) -> anyhow::Result<ConversationState> {
        Ok(ConversationState::NoState)
    }

    async fn process(
        &self,
        subject: SubjectId,
        _event: &InboundEvent,
        _ct: &CancellationToken,
    ) -> anyhow::Result<()> {
        anyhow::bail!("no conversation state for subject {}", subject)
    }

    async fn clear_state(&self, _subject: SubjectId, _ct: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }
}
