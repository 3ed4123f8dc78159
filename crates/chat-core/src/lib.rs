//! Core contract for the one-to-one chat session synchronizer.
//!
//! This crate defines conversation identity, the timeline reconciler, typing
//! state machines, the history/live/contact collaborator traits with in-memory
//! implementations, and the command/event protocol consumed by front ends.

/// Wall-clock abstraction used for message timestamps.
pub mod clock;
/// Contact directory trait and an in-memory directory.
pub mod contacts;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// History store trait, record tagging, and an in-memory store.
pub mod history;
/// Live channel trait, event types, and an in-memory channel.
pub mod live;
/// Event normalization helpers (send acks, load failures).
pub mod normalization;
/// Backoff policy used by reconnect loops.
pub mod retry;
/// Timeline load lifecycle.
pub mod state_machine;
/// Ordered timeline buffer and reconciler.
pub mod timeline;
/// Frontend-facing protocol types.
pub mod types;
/// Local and peer typing indicator state machines.
pub mod typing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use contacts::{Contact, ContactDirectory, InMemoryContactDirectory};
pub use error::{
    ChannelError, ErrorCategory, LoadError, SessionError, TimelineError, WriteError,
    classify_http_status,
};
pub use history::{HistoryRecord, HistoryStore, InMemoryHistoryStore, PersistAck, records_to_messages};
pub use live::{InMemoryLiveChannel, LiveChannel, LiveEvent, OutboundEvent};
pub use normalization::{
    WriteOutcome, normalize_channel_error, normalize_load_failure, normalize_write_outcome,
};
pub use retry::{Backoff, RetryPolicy};
pub use state_machine::TimelineLifecycle;
pub use timeline::{
    AckOutcome, InsertOutcome, LoadCompletion, RemoteAppend, TimelineBuffer, TimelineMergeError,
    TimelineState,
};
pub use types::{
    ConversationId, LoadStatus, Message, MessageOrigin, SendAck, SessionCommand, SessionEvent,
    SessionSnapshot,
};
pub use typing::{
    DEFAULT_TYPING_DEBOUNCE, DEFAULT_TYPING_TIMEOUT, DecayTimer, LocalTyping, PeerTyping,
    TypingPhase, TypingSignal,
};
