use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Addressable pairing of the local user and one peer.
///
/// Identifies exactly one timeline. Equality covers both ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId {
    /// Identity of the authenticated local user.
    pub local_user_id: String,
    /// Identity of the other participant.
    pub peer_user_id: String,
}

impl ConversationId {
    pub fn new(local_user_id: impl Into<String>, peer_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            peer_user_id: peer_user_id.into(),
        }
    }

    /// Whether `sender_id` is the peer side of this conversation.
    pub fn is_peer(&self, sender_id: &str) -> bool {
        self.peer_user_id == sender_id
    }

    /// Whether `sender_id` is the local side of this conversation.
    pub fn is_local(&self, sender_id: &str) -> bool {
        self.local_user_id == sender_id
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.local_user_id, self.peer_user_id)
    }
}

/// Where a timeline message came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageOrigin {
    /// Returned by the history store on (re)activation.
    Historical,
    /// Pushed over the live channel while the conversation was active.
    Remote,
    /// Optimistically appended by the local sender.
    LocalEcho,
}

/// One timeline entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Server id when known.
    pub id: Option<String>,
    /// Per-session correlation id, present on local echoes.
    pub client_txn_id: Option<String>,
    /// `true` when the local user authored the message.
    pub sender_is_self: bool,
    /// Message body.
    pub text: String,
    /// Send (or receipt) time in milliseconds since Unix epoch.
    pub sent_at_ms: u64,
    /// Provenance of this entry.
    pub origin: MessageOrigin,
}

impl Message {
    /// Build an optimistic local echo with a fresh correlation id.
    pub fn local_echo(text: impl Into<String>, sent_at_ms: u64) -> Self {
        Self {
            id: None,
            client_txn_id: Some(Uuid::new_v4().to_string()),
            sender_is_self: true,
            text: text.into(),
            sent_at_ms,
            origin: MessageOrigin::LocalEcho,
        }
    }

    /// Build a peer message received over the live channel.
    pub fn remote(text: impl Into<String>, sent_at_ms: u64) -> Self {
        Self {
            id: None,
            client_txn_id: None,
            sender_is_self: false,
            text: text.into(),
            sent_at_ms,
            origin: MessageOrigin::Remote,
        }
    }

    /// Build a message loaded from the history store.
    pub fn historical(
        id: Option<String>,
        sender_is_self: bool,
        text: impl Into<String>,
        sent_at_ms: u64,
    ) -> Self {
        Self {
            id,
            client_txn_id: None,
            sender_is_self,
            text: text.into(),
            sent_at_ms,
            origin: MessageOrigin::Historical,
        }
    }
}

/// Load lifecycle of one conversation timeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum LoadStatus {
    /// Created, no load requested yet.
    #[default]
    Idle,
    /// History load in flight.
    Loading,
    /// History loaded; live appends accepted.
    Ready,
    /// History load failed; retry by loading again.
    Failed,
}

/// Command input accepted by the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionCommand {
    /// Local user authenticated; bind the live channel to this identity.
    Authenticate {
        /// Local user id announced on the live channel.
        user_id: String,
    },
    /// Make the conversation with `peer_user_id` the active one.
    OpenConversation {
        /// Peer to converse with.
        peer_user_id: String,
    },
    /// Re-run the history load of the active conversation after a failure.
    RetryLoad,
    /// Send a text message to the active peer.
    SendText {
        /// Raw input text; trimmed before sending.
        text: String,
    },
    /// Local keystroke in the composer.
    Keystroke,
    /// Deactivate the active conversation without opening another.
    CloseConversation,
    /// Tear the session down.
    EndSession,
}

/// Write-path acknowledgement for one local echo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Correlation id of the echo the write belongs to.
    pub client_txn_id: String,
    /// Conversation the message was sent in.
    pub conversation: ConversationId,
    /// Server id on success, when the store returned one.
    pub message_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

impl SendAck {
    pub fn is_success(&self) -> bool {
        self.error_code.is_none()
    }
}

/// Point-in-time view of the session for consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub local_user_id: Option<String>,
    pub channel_connected: bool,
    pub conversation: Option<ConversationId>,
    pub load_status: LoadStatus,
    pub messages: Vec<Message>,
    pub is_peer_typing: bool,
    pub is_local_typing: bool,
    pub last_error_code: Option<String>,
}

/// Event output emitted by the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    /// Live channel connectivity changed.
    ChannelStatus {
        /// Whether the transport is currently connected.
        connected: bool,
    },
    /// Identity was announced on the current connection.
    IdentityAnnounced {
        /// Announced local user id.
        user_id: String,
    },
    /// Timeline load status transition.
    TimelineStatus {
        conversation: ConversationId,
        status: LoadStatus,
    },
    /// Full timeline replacement (after a load completes).
    TimelineSnapshot {
        conversation: ConversationId,
        messages: Vec<Message>,
    },
    /// One message inserted into the active timeline.
    TimelineAppended {
        conversation: ConversationId,
        /// Position the message was inserted at.
        index: usize,
        message: Message,
    },
    /// A local echo received its server id from the write path.
    MessageAcknowledged {
        conversation: ConversationId,
        client_txn_id: String,
        message_id: String,
    },
    /// History load failed; the caller may retry.
    LoadFailed {
        conversation: ConversationId,
        /// Stable error code.
        code: String,
        /// Human-readable error message.
        message: String,
        /// Whether `RetryLoad` may recover.
        retryable: bool,
    },
    /// Peer typing indicator changed.
    PeerTyping {
        conversation: ConversationId,
        is_typing: bool,
    },
    /// Local typing phase changed.
    LocalTyping {
        conversation: ConversationId,
        is_typing: bool,
    },
    /// Write-path result for a sent message.
    SendAck(SendAck),
    /// Non-blocking problem report (for example a live emit while offline).
    Notification { code: String, message: String },
    /// A command could not run in the current state.
    CommandRejected { code: String, message: String },
    /// The session was torn down; no further events follow.
    SessionEnded,
}
