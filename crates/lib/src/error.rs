//! Error taxonomy shared by the dispatch core.
//!
//! Platform failures carry a structural [`PlatformErrorKind`] tag assigned by the platform
//! client when it decodes a response; retry and cleanup decisions match on the tag, never on
//! message text.

use std::fmt;
use std::time::Duration;

/// Kind of a platform (Bot API) failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformErrorKind {
    /// Bot token rejected (HTTP 401). Fatal for the transport.
    Unauthorized,
    /// The subject blocked the bot or the bot was removed (HTTP 403).
    Blocked,
    /// Chat or user does not exist anymore.
    ChatNotFound,
    /// Platform throttling (HTTP 429), with the server-provided wait when known.
    RateLimited { retry_after: Option<Duration> },
    /// Request rejected as malformed (HTTP 400, other than chat-not-found).
    BadRequest,
    /// Conflicting delivery mode (e.g. getUpdates while a webhook is set).
    Conflict,
    /// Platform-side 5xx.
    Server,
    /// Connection, timeout, or transport-level failure.
    Network,
    /// Response body could not be decoded.
    Decode,
}

impl fmt::Display for PlatformErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlatformErrorKind::Unauthorized => "unauthorized",
            PlatformErrorKind::Blocked => "blocked",
            PlatformErrorKind::ChatNotFound => "chat not found",
            PlatformErrorKind::RateLimited { .. } => "rate limited",
            PlatformErrorKind::BadRequest => "bad request",
            PlatformErrorKind::Conflict => "conflict",
            PlatformErrorKind::Server => "server error",
            PlatformErrorKind::Network => "network",
            PlatformErrorKind::Decode => "decode",
        };
        f.write_str(s)
    }
}

/// A failed platform call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct PlatformError {
    kind: PlatformErrorKind,
    message: String,
}

impl PlatformError {
    pub fn new(kind: PlatformErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> PlatformErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Subject is unreachable by definition (blocked, gone, or the bot itself is unauthorized).
    pub fn is_structural(&self) -> bool {
        matches!(
            self.kind,
            PlatformErrorKind::Unauthorized
                | PlatformErrorKind::Blocked
                | PlatformErrorKind::ChatNotFound
        )
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_decode() {
            PlatformErrorKind::Decode
        } else {
            PlatformErrorKind::Network
        };
        // Request URLs embed the bot token.
        PlatformError::new(kind, e.without_url().to_string())
    }
}

/// Raised when an operation observes its cancellation signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// How a failure should be treated by retry and error boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Infrastructure hiccup; worth retrying.
    Transient,
    /// Structural platform failure; retrying cannot help.
    Permanent,
    /// The caller gave up; stop immediately.
    Cancelled,
}

/// Maps an error value to its [`FailureClass`].
pub trait Classify {
    fn failure_class(&self) -> FailureClass;
}

impl Classify for PlatformError {
    fn failure_class(&self) -> FailureClass {
        if self.is_structural() {
            FailureClass::Permanent
        } else {
            FailureClass::Transient
        }
    }
}

impl Classify for Cancelled {
    fn failure_class(&self) -> FailureClass {
        FailureClass::Cancelled
    }
}

impl Classify for anyhow::Error {
    fn failure_class(&self) -> FailureClass {
        for cause in self.chain() {
            if cause.is::<Cancelled>() {
                return FailureClass::Cancelled;
            }
            if let Some(p) = cause.downcast_ref::<PlatformError>() {
                return p.failure_class();
            }
            if let Some(r) = cause.downcast_ref::<crate::retry::RetryError<PlatformError>>() {
                return r.failure_class();
            }
            if let Some(r) = cause.downcast_ref::<crate::retry::RetryError<anyhow::Error>>() {
                return r.failure_class();
            }
        }
        FailureClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_platform_errors_are_permanent() {
        for kind in [
            PlatformErrorKind::Unauthorized,
            PlatformErrorKind::Blocked,
            PlatformErrorKind::ChatNotFound,
        ] {
            assert_eq!(
                PlatformError::new(kind, "x").failure_class(),
                FailureClass::Permanent
            );
        }
        assert_eq!(
            PlatformError::new(PlatformErrorKind::Server, "x").failure_class(),
            FailureClass::Transient
        );
    }

    #[test]
    fn anyhow_classification_uses_the_wrapped_type() {
        let e = anyhow::Error::new(PlatformError::new(PlatformErrorKind::Blocked, "bot was blocked"))
            .context("sending reply");
        assert_eq!(e.failure_class(), FailureClass::Permanent);

        let e = anyhow::Error::new(Cancelled).context("loading state");
        assert_eq!(e.failure_class(), FailureClass::Cancelled);

        // Message text alone never makes an error permanent.
        let e = anyhow::anyhow!("Forbidden: bot was blocked by the user");
        assert_eq!(e.failure_class(), FailureClass::Transient);
    }
}
