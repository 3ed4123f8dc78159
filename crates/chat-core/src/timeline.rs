use std::collections::{HashSet, VecDeque};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    error::{LoadError, TimelineError},
    state_machine::TimelineLifecycle,
    types::{ConversationId, LoadStatus, Message, MessageOrigin},
};

/// Maximum distance between a history timestamp and the timestamp of a
/// queued live message for the two to count as the same message on replay.
pub const REPLAY_DEDUPE_SLACK_MS: u64 = 5_000;
/// History entries older than the load start by more than this never absorb
/// a queued live message.
pub const LOAD_START_SKEW_MS: u64 = 1_000;
/// Live messages held while a load is in flight.
pub const MAX_PENDING_LIVE: usize = 256;

/// Errors that can occur while applying timeline operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimelineMergeError {
    /// An acknowledgement referenced a correlation id that is not present.
    #[error("timeline item with client_txn_id '{0}' was not found")]
    MissingEcho(String),
}

/// Result of inserting one message into a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Inserted at this index.
    Inserted(usize),
    /// Already present (same server id or same correlation id).
    Duplicate,
    /// Older than everything retained in a full buffer.
    Evicted,
}

/// Result of attaching a server id to a local echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The echo now carries the server id.
    Attached,
    /// Another entry already carried the server id; the echo was folded into it.
    Merged,
}

/// Ordered, duplicate-free message sequence with bounded retention.
///
/// Order is non-decreasing by `sent_at_ms`; equal timestamps keep arrival order.
#[derive(Debug, Clone)]
pub struct TimelineBuffer {
    items: Vec<Message>,
    max_items: usize,
}

impl TimelineBuffer {
    /// Create a timeline buffer with an item cap (`max_items >= 1`).
    pub fn new(max_items: usize) -> Self {
        Self {
            items: Vec::new(),
            max_items: max_items.max(1),
        }
    }

    /// Current timeline items in display order.
    pub fn items(&self) -> &[Message] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Replace the whole sequence, e.g. with a freshly loaded history.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.items.clear();
        for message in messages {
            let _ = self.insert(message);
        }
    }

    /// Insert one message at its ordered position.
    pub fn insert(&mut self, message: Message) -> InsertOutcome {
        self.insert_with(message, false)
    }

    /// Insert a message that must survive the cap.
    ///
    /// On overflow the oldest other entries are dropped, so the result is
    /// always `Inserted` or `Duplicate`.
    pub fn insert_retained(&mut self, message: Message) -> InsertOutcome {
        self.insert_with(message, true)
    }

    fn insert_with(&mut self, message: Message, retain: bool) -> InsertOutcome {
        if self.contains(&message) {
            return InsertOutcome::Duplicate;
        }

        let index = self
            .items
            .partition_point(|it| it.sent_at_ms <= message.sent_at_ms);
        self.items.insert(index, message);

        let evicted = if retain {
            self.trim_around(index)
        } else {
            self.trim_to_max()
        };
        if index < evicted {
            InsertOutcome::Evicted
        } else {
            InsertOutcome::Inserted(index - evicted)
        }
    }

    /// Attach the write-path server id to the echo with `client_txn_id`.
    pub fn acknowledge(
        &mut self,
        client_txn_id: &str,
        message_id: &str,
    ) -> Result<AckOutcome, TimelineMergeError> {
        let echo_idx = self
            .items
            .iter()
            .position(|it| it.client_txn_id.as_deref() == Some(client_txn_id))
            .ok_or_else(|| TimelineMergeError::MissingEcho(client_txn_id.to_owned()))?;

        let already_present = self
            .items
            .iter()
            .enumerate()
            .any(|(idx, it)| idx != echo_idx && it.id.as_deref() == Some(message_id));
        if already_present {
            self.items.remove(echo_idx);
            return Ok(AckOutcome::Merged);
        }

        self.items[echo_idx].id = Some(message_id.to_owned());
        Ok(AckOutcome::Attached)
    }

    fn contains(&self, message: &Message) -> bool {
        self.items.iter().any(|it| {
            let same_id = message.id.is_some() && it.id == message.id;
            let same_txn =
                message.client_txn_id.is_some() && it.client_txn_id == message.client_txn_id;
            same_id || same_txn
        })
    }

    /// Drop the oldest items over the cap; returns how many were dropped.
    fn trim_to_max(&mut self) -> usize {
        if self.items.len() <= self.max_items {
            return 0;
        }

        let excess = self.items.len() - self.max_items;
        self.items.drain(0..excess);
        excess
    }

    /// Drop the oldest items over the cap other than the one at `keep`;
    /// returns how many were dropped in front of it.
    fn trim_around(&mut self, keep: usize) -> usize {
        let excess = self.items.len().saturating_sub(self.max_items);
        if excess == 0 {
            return 0;
        }

        let before = excess.min(keep);
        self.items.drain(0..before);
        let after = excess - before;
        if after > 0 {
            let start = keep - before + 1;
            self.items.drain(start..start + after);
        }
        before
    }
}

/// Live message received while the history load was still in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingRemote {
    text: String,
    sent_at_ms: Option<u64>,
    received_at_ms: u64,
}

/// What happened to a live message handed to [`TimelineState::append_remote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAppend {
    Inserted { index: usize, message: Message },
    /// Held until the load completes.
    Queued,
    Duplicate,
    /// Older than everything retained in a full timeline.
    Evicted,
    /// The timeline is not loading or ready.
    Dropped,
}

/// Summary of a completed load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadCompletion {
    pub history_len: usize,
    pub replayed: usize,
    pub skipped_duplicates: usize,
}

/// Timeline of the active conversation: lifecycle, ordered messages, and live
/// messages queued during a load.
#[derive(Debug)]
pub struct TimelineState {
    conversation: ConversationId,
    lifecycle: TimelineLifecycle,
    buffer: TimelineBuffer,
    last_error: Option<LoadError>,
    pending: VecDeque<PendingRemote>,
    load_generation: u64,
    load_started_at_ms: u64,
}

impl TimelineState {
    pub fn new(conversation: ConversationId, max_items: usize) -> Self {
        Self {
            conversation,
            lifecycle: TimelineLifecycle::default(),
            buffer: TimelineBuffer::new(max_items),
            last_error: None,
            pending: VecDeque::new(),
            load_generation: 0,
            load_started_at_ms: 0,
        }
    }

    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    pub fn status(&self) -> LoadStatus {
        self.lifecycle.state()
    }

    pub fn messages(&self) -> &[Message] {
        self.buffer.items()
    }

    pub fn last_error(&self) -> Option<&LoadError> {
        self.last_error.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Enter `Loading` at local time `now_ms` and return the generation the
    /// eventual result must carry.
    pub fn begin_load(&mut self, now_ms: u64) -> Result<u64, TimelineError> {
        self.lifecycle.begin_load()?;
        self.load_generation = self.load_generation.wrapping_add(1);
        self.load_started_at_ms = now_ms;
        self.last_error = None;
        debug!(
            conversation = %self.conversation,
            generation = self.load_generation,
            started_at_ms = now_ms,
            "timeline load started"
        );
        Ok(self.load_generation)
    }

    /// Whether a result tagged with `generation` belongs to the load in flight.
    pub fn is_current_load(&self, generation: u64) -> bool {
        self.lifecycle.is_loading() && self.load_generation == generation
    }

    /// Store the loaded history, enter `Ready`, and replay queued live messages.
    ///
    /// Returns `None` for a stale generation; the state is left untouched.
    pub fn complete_load(
        &mut self,
        generation: u64,
        history: Vec<Message>,
    ) -> Option<LoadCompletion> {
        if !self.is_current_load(generation) {
            trace!(conversation = %self.conversation, generation, "ignoring stale load result");
            return None;
        }
        self.lifecycle.on_load_result(true).ok()?;

        let mut completion = LoadCompletion {
            history_len: history.len(),
            ..LoadCompletion::default()
        };
        self.buffer.replace(history);

        let mut consumed = HashSet::new();
        while let Some(pending) = self.pending.pop_front() {
            if let Some(idx) = self.matching_history_entry(&pending, &consumed) {
                consumed.insert(idx);
                completion.skipped_duplicates += 1;
                continue;
            }
            let sent_at_ms = pending.sent_at_ms.unwrap_or(pending.received_at_ms);
            if let InsertOutcome::Inserted(_) =
                self.buffer.insert(Message::remote(pending.text, sent_at_ms))
            {
                completion.replayed += 1;
            }
        }

        debug!(
            conversation = %self.conversation,
            history = completion.history_len,
            replayed = completion.replayed,
            skipped = completion.skipped_duplicates,
            "timeline ready"
        );
        Some(completion)
    }

    /// Record a load failure and enter `Failed`. Returns `false` for a stale generation.
    pub fn fail_load(&mut self, generation: u64, error: LoadError) -> bool {
        if !self.is_current_load(generation) {
            return false;
        }
        if self.lifecycle.on_load_result(false).is_err() {
            return false;
        }
        warn!(conversation = %self.conversation, error = %error, "timeline load failed");
        self.pending.clear();
        self.last_error = Some(error);
        true
    }

    /// Optimistically append a message authored by the local user.
    pub fn append_local_echo(
        &mut self,
        text: impl Into<String>,
        now_ms: u64,
    ) -> Result<(usize, Message), TimelineError> {
        self.lifecycle.require_ready("append_local_echo")?;

        let message = Message::local_echo(text, now_ms);
        match self.buffer.insert_retained(message.clone()) {
            InsertOutcome::Inserted(index) => Ok((index, message)),
            InsertOutcome::Duplicate | InsertOutcome::Evicted => Err(
                TimelineError::EchoNotRetained {
                    client_txn_id: message.client_txn_id.unwrap_or_default(),
                },
            ),
        }
    }

    /// Append a peer message received on the live channel.
    ///
    /// `sent_at_ms` is the event's own timestamp when it carries one; otherwise
    /// the receipt time is used.
    pub fn append_remote(
        &mut self,
        text: impl Into<String>,
        sent_at_ms: Option<u64>,
        received_at_ms: u64,
    ) -> RemoteAppend {
        let text = text.into();
        match self.lifecycle.state() {
            LoadStatus::Ready => {
                let message = Message::remote(text, sent_at_ms.unwrap_or(received_at_ms));
                match self.buffer.insert(message.clone()) {
                    InsertOutcome::Inserted(index) => RemoteAppend::Inserted { index, message },
                    InsertOutcome::Duplicate => RemoteAppend::Duplicate,
                    InsertOutcome::Evicted => RemoteAppend::Evicted,
                }
            }
            LoadStatus::Loading => {
                if self.pending.len() >= MAX_PENDING_LIVE {
                    warn!(conversation = %self.conversation, "pending live queue full; dropping oldest");
                    self.pending.pop_front();
                }
                self.pending.push_back(PendingRemote {
                    text,
                    sent_at_ms,
                    received_at_ms,
                });
                RemoteAppend::Queued
            }
            LoadStatus::Idle | LoadStatus::Failed => RemoteAppend::Dropped,
        }
    }

    /// Attach a write-path server id to a local echo.
    pub fn acknowledge(
        &mut self,
        client_txn_id: &str,
        message_id: &str,
    ) -> Result<AckOutcome, TimelineMergeError> {
        self.buffer.acknowledge(client_txn_id, message_id)
    }

    fn matching_history_entry(
        &self,
        pending: &PendingRemote,
        consumed: &HashSet<usize>,
    ) -> Option<usize> {
        let earliest = self.load_started_at_ms.saturating_sub(LOAD_START_SKEW_MS);
        let pending_at = pending.sent_at_ms.unwrap_or(pending.received_at_ms);
        self.buffer.items().iter().enumerate().position(|(idx, it)| {
            !consumed.contains(&idx)
                && it.origin == MessageOrigin::Historical
                && !it.sender_is_self
                && it.text == pending.text
                && it.sent_at_ms >= earliest
                && it.sent_at_ms.abs_diff(pending_at) <= REPLAY_DEDUPE_SLACK_MS
        })
    }
}
