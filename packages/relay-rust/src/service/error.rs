//! Error types for handlers, the operation store, and dispatch.
//!
//! Display strings are complete sentences: the UI layer renders a failed
//! dispatch's message text directly.

use opsbridge_core::{ErrorClass, TransitionError};

use crate::channel::TransportError;
use crate::traits::BridgeError;

/// Fallback text for errors whose message is empty.
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Failure of a single handler invocation. Always converted into a failed
/// `Response`; never escapes the relay.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The handler body failed; retrying may succeed.
    #[error("{0}")]
    Failed(String),
    /// The handler body refused the request; retrying will not help.
    #[error("{0}")]
    Rejected(String),
    #[error("invalid payload for {message_type}: {reason}")]
    InvalidPayload { message_type: String, reason: String },
    #[error("handler timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("relay overloaded, try again later")]
    Overloaded,
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Rejected(_) | Self::InvalidPayload { .. } | Self::Panicked(_) => {
                ErrorClass::Permanent
            }
            Self::Failed(_) | Self::Timeout { .. } | Self::Overloaded => ErrorClass::Transient,
        }
    }

    /// Human-readable message, never empty.
    #[must_use]
    pub fn message(&self) -> String {
        let text = self.to_string();
        if text.trim().is_empty() {
            UNKNOWN_ERROR.to_string()
        } else {
            text
        }
    }
}

impl From<BridgeError> for HandlerError {
    fn from(err: BridgeError) -> Self {
        match err.class() {
            ErrorClass::Permanent => Self::Rejected(err.to_string()),
            ErrorClass::Transient => Self::Failed(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(bridge) = err.downcast_ref::<BridgeError>() {
            return bridge.clone().into();
        }
        if let Some(handler) = err.downcast_ref::<HandlerError>() {
            return handler.clone();
        }
        Self::Failed(err.to_string())
    }
}

/// Rejected operation store mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("operation {0} is already tracked")]
    DuplicateOperation(String),
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Caller-facing dispatch failure.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no handler registered for {message_type}")]
    HandlerNotFound { message_type: String },
    #[error("Message timeout: {message_type} (no reply within {timeout_ms}ms)")]
    Timeout { message_type: String, timeout_ms: u64 },
    /// The handler ran and failed; `message` is its error text.
    #[error("{message}")]
    Remote {
        message: String,
        class: Option<ErrorClass>,
    },
    #[error("dispatch of {message_type} was cancelled")]
    Cancelled { message_type: String },
    #[error("relay channel closed")]
    ChannelClosed,
    #[error("failed to post {message_type}: {source}")]
    Transport {
        message_type: String,
        #[source]
        source: TransportError,
    },
    #[error("{0} was not returned")]
    EmptyResult(&'static str),
    #[error("malformed relay payload: {0}")]
    Codec(#[from] serde_json::Error),
}

impl RelayError {
    /// Returns `true` if the same request may succeed when sent again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. }
            | Self::ChannelClosed
            | Self::Transport { .. }
            | Self::EmptyResult(_) => true,
            Self::Remote { class, .. } => *class != Some(ErrorClass::Permanent),
            Self::HandlerNotFound { .. } | Self::Cancelled { .. } | Self::Codec(_) => false,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
