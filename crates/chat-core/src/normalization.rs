use crate::{
    error::{ChannelError, ErrorCategory, LoadError, WriteError},
    types::{ConversationId, SendAck, SessionEvent},
};

/// Write-path result before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The store accepted the message; it may or may not report an id.
    Success { message_id: Option<String> },
    Failure { error: WriteError },
}

/// Convert a write outcome to a stable `SessionEvent::SendAck`.
pub fn normalize_write_outcome(
    client_txn_id: impl Into<String>,
    conversation: ConversationId,
    outcome: WriteOutcome,
) -> SessionEvent {
    let client_txn_id = client_txn_id.into();
    match outcome {
        WriteOutcome::Success { message_id } => SessionEvent::SendAck(SendAck {
            client_txn_id,
            conversation,
            message_id,
            error_code: None,
        }),
        WriteOutcome::Failure { error } => SessionEvent::SendAck(SendAck {
            client_txn_id,
            conversation,
            message_id: None,
            error_code: Some(error.code().to_owned()),
        }),
    }
}

/// Convert a history load failure into a `LoadFailed` event.
///
/// Auth failures are not retryable until the user signs in again.
pub fn normalize_load_failure(conversation: ConversationId, error: &LoadError) -> SessionEvent {
    SessionEvent::LoadFailed {
        conversation,
        code: error.code().to_owned(),
        message: error.to_string(),
        retryable: error.category() != ErrorCategory::Auth,
    }
}

/// Convert a failed live emit into a non-blocking notification.
pub fn normalize_channel_error(action: &str, error: &ChannelError) -> SessionEvent {
    SessionEvent::Notification {
        code: error.code().to_owned(),
        message: format!("{action}: {error}"),
    }
}
