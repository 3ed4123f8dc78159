use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::LoadStatus;

/// Broad error category used for retry and user-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Local session is missing or rejected by the server.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// The server answered with something we could not interpret.
    Protocol,
    /// Invalid input or unsupported state.
    Config,
    /// Internal invariant break.
    Internal,
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        408 | 429 => ErrorCategory::Network,
        400..=499 => ErrorCategory::Config,
        500..=599 => ErrorCategory::Network,
        _ => ErrorCategory::Internal,
    }
}

/// History fetch failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// Transport failure; retrying may recover.
    #[error("history load failed: {0}")]
    Network(String),
    /// The local session is invalid.
    #[error("history load rejected: session is not authorized")]
    Unauthorized,
    /// The response body could not be decoded.
    #[error("history response malformed: {0}")]
    Protocol(String),
}

impl LoadError {
    /// Build a load error from a non-success HTTP status.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        match classify_http_status(status) {
            ErrorCategory::Auth => Self::Unauthorized,
            _ => Self::Network(format!("status {status}: {}", detail.into())),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "load_network",
            Self::Unauthorized => "load_unauthorized",
            Self::Protocol(_) => "load_protocol",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network(_) => ErrorCategory::Network,
            Self::Unauthorized => ErrorCategory::Auth,
            Self::Protocol(_) => ErrorCategory::Protocol,
        }
    }
}

/// Failure persisting an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("message write failed: {0}")]
    Network(String),
    #[error("message write rejected: session is not authorized")]
    Unauthorized,
}

impl WriteError {
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        match classify_http_status(status) {
            ErrorCategory::Auth => Self::Unauthorized,
            _ => Self::Network(format!("status {status}: {}", detail.into())),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "write_network",
            Self::Unauthorized => "write_unauthorized",
        }
    }
}

/// Live channel failure. Transient; recovers on reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The transport is currently offline.
    #[error("live channel is disconnected")]
    Disconnected,
    /// The channel was shut down and will not reconnect.
    #[error("live channel is closed")]
    Closed,
}

impl ChannelError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Disconnected => "channel_disconnected",
            Self::Closed => "channel_closed",
        }
    }
}

/// Timeline operation attempted in a lifecycle state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimelineError {
    #[error("cannot run '{action}' while timeline is {current:?}")]
    InvalidState {
        current: LoadStatus,
        action: &'static str,
    },
    #[error("local echo '{client_txn_id}' could not be placed in the timeline")]
    EchoNotRetained { client_txn_id: String },
}

impl TimelineError {
    pub fn invalid_state(current: LoadStatus, action: &'static str) -> Self {
        Self::InvalidState { current, action }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidState { .. } => "invalid_timeline_state",
            Self::EchoNotRetained { .. } => "echo_not_retained",
        }
    }
}

/// Errors returned by session controller operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no local user is authenticated")]
    NotAuthenticated,
    #[error("no conversation is active")]
    NoActiveConversation,
    #[error("invalid peer user id '{0}'")]
    InvalidPeer(String),
    #[error("message text is empty")]
    EmptyMessage,
    #[error(transparent)]
    Timeline(#[from] TimelineError),
    #[error("session runtime is closed")]
    Closed,
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotAuthenticated => "not_authenticated",
            Self::NoActiveConversation => "no_active_conversation",
            Self::InvalidPeer(_) => "invalid_peer",
            Self::EmptyMessage => "empty_message",
            Self::Timeline(err) => err.code(),
            Self::Closed => "session_closed",
        }
    }
}
