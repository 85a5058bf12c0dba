//! Normalized inbound event: one per platform update, immutable once built.

use chrono::{DateTime, Utc};
use std::fmt;

/// Stable numeric id of a chat or user.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SubjectId(pub i64);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of occurrence the platform delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Free-form text message.
    Message,
    /// Text starting with the command marker.
    Command,
    /// Button press (callback query).
    Callback,
    /// Anything else with an addressable subject (edits, channel posts, media without text).
    Other,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Message => "message",
            EventKind::Command => "command",
            EventKind::Callback => "callback",
            EventKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Leading marker of a textual command.
pub const COMMAND_MARKER: char = '/';

/// A platform update in normalized form.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub id: i64,
    pub kind: EventKind,
    pub subject: SubjectId,
    /// Message text (messages and commands).
    pub text: Option<String>,
    /// Interaction payload (callback data).
    pub payload: Option<String>,
    /// Platform id of the callback query, used to acknowledge it.
    pub callback_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    /// Text event; classified as a command when it starts with [`COMMAND_MARKER`].
    pub fn text(id: i64, subject: SubjectId, text: impl Into<String>) -> Self {
        let text = text.into();
        let kind = if text.trim_start().starts_with(COMMAND_MARKER) {
            EventKind::Command
        } else {
            EventKind::Message
        };
        Self {
            id,
            kind,
            subject,
            text: Some(text),
            payload: None,
            callback_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Callback (button press) event carrying `payload`.
    pub fn callback(
        id: i64,
        subject: SubjectId,
        callback_id: impl Into<String>,
        payload: Option<String>,
    ) -> Self {
        Self {
            id,
            kind: EventKind::Callback,
            subject,
            text: None,
            payload,
            callback_id: Some(callback_id.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn other(id: i64, subject: SubjectId) -> Self {
        Self {
            id,
            kind: EventKind::Other,
            subject,
            text: None,
            payload: None,
            callback_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Command name without marker, arguments, or `@botname` suffix (e.g. `start` for `/start@my_bot x`).
    pub fn command_name(&self) -> Option<&str> {
        if self.kind != EventKind::Command {
            return None;
        }
        let text = self.text.as_deref()?.trim_start();
        let word = text.strip_prefix(COMMAND_MARKER)?.split_whitespace().next()?;
        Some(word.split('@').next().unwrap_or(word))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_with_marker_is_a_command() {
        let e = InboundEvent::text(1, SubjectId(7), "/start@herald_bot now");
        assert_eq!(e.kind, EventKind::Command);
        assert_eq!(e.command_name(), Some("start"));
    }

    #[test]
    fn plain_text_is_a_message() {
        let e = InboundEvent::text(1, SubjectId(7), "hello /start");
        assert_eq!(e.kind, EventKind::Message);
        assert_eq!(e.command_name(), None);
    }
}
