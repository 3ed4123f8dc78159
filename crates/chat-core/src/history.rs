use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    clock::{Clock, SystemClock},
    error::{LoadError, WriteError},
    types::{ConversationId, Message},
};

/// One persisted message as returned by a history store, before tagging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HistoryRecord {
    pub id: Option<String>,
    /// Author id, when the store reports it.
    pub sender_id: Option<String>,
    /// Explicit "authored by the requester" flag, when the store reports it.
    pub from_self: Option<bool>,
    pub text: String,
    pub sent_at_ms: Option<u64>,
}

impl HistoryRecord {
    fn is_from(&self, conversation: &ConversationId) -> bool {
        match (self.from_self, self.sender_id.as_deref()) {
            (Some(flag), _) => flag,
            (None, Some(sender)) => conversation.is_local(sender),
            (None, None) => false,
        }
    }
}

/// Write-path acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersistAck {
    /// Server id of the stored message, when the store returns one.
    pub message_id: Option<String>,
}

/// Durable message history: the read path used on (re)activation and the
/// write path used on send.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Fetch the conversation history, oldest first, tagged by sender side.
    ///
    /// Repeated calls return at least the same prefix.
    async fn load(&self, conversation: &ConversationId) -> Result<Vec<Message>, LoadError>;

    /// Persist one outbound message authored by the local user.
    async fn persist(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> Result<PersistAck, WriteError>;
}

/// Tag records by sender side and order them oldest first.
///
/// A record without a timestamp inherits the previous record's, so it keeps
/// its server position under the stable sort.
pub fn records_to_messages(
    conversation: &ConversationId,
    records: Vec<HistoryRecord>,
) -> Vec<Message> {
    let mut last_seen_ms = 0;
    let mut messages: Vec<Message> = records
        .into_iter()
        .map(|record| {
            let sent_at_ms = record.sent_at_ms.unwrap_or(last_seen_ms);
            last_seen_ms = sent_at_ms;
            let sender_is_self = record.is_from(conversation);
            Message::historical(record.id, sender_is_self, record.text, sent_at_ms)
        })
        .collect();
    messages.sort_by_key(|message| message.sent_at_ms);
    messages
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    sender_id: String,
    text: String,
    sent_at_ms: u64,
}

#[derive(Default)]
struct InMemoryHistory {
    threads: HashMap<(String, String), Vec<StoredMessage>>,
    failing_loads: VecDeque<LoadError>,
    failing_writes: VecDeque<WriteError>,
    next_id: u64,
}

impl InMemoryHistory {
    fn append(&mut self, sender_id: &str, recipient_id: &str, text: &str, sent_at_ms: u64) -> String {
        self.next_id += 1;
        let id = format!("mem-{}", self.next_id);
        self.threads
            .entry(thread_key(sender_id, recipient_id))
            .or_default()
            .push(StoredMessage {
                id: id.clone(),
                sender_id: sender_id.to_owned(),
                text: text.to_owned(),
                sent_at_ms,
            });
        id
    }
}

/// Process-local history store with failure injection.
#[derive(Clone)]
pub struct InMemoryHistoryStore {
    data: Arc<Mutex<InMemoryHistory>>,
    clock: Arc<dyn Clock>,
    loads: Arc<AtomicUsize>,
}

impl InMemoryHistoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: Arc::new(Mutex::new(InMemoryHistory::default())),
            clock,
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Store a message between two users directly, bypassing the write path.
    pub fn seed(&self, sender_id: &str, recipient_id: &str, text: &str, sent_at_ms: u64) {
        if let Ok(mut data) = self.data.lock() {
            data.append(sender_id, recipient_id, text, sent_at_ms);
        }
    }

    /// Make the next `load` fail with `error`.
    pub fn fail_next_load(&self, error: LoadError) {
        if let Ok(mut data) = self.data.lock() {
            data.failing_loads.push_back(error);
        }
    }

    /// Make the next `persist` fail with `error`.
    pub fn fail_next_write(&self, error: WriteError) {
        if let Ok(mut data) = self.data.lock() {
            data.failing_writes.push_back(error);
        }
    }

    /// Number of `load` calls served so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of messages stored between two users.
    pub fn thread_len(&self, a: &str, b: &str) -> usize {
        self.data
            .lock()
            .map(|data| data.threads.get(&thread_key(a, b)).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn load(&self, conversation: &ConversationId) -> Result<Vec<Message>, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let mut data = self
            .data
            .lock()
            .map_err(|_| LoadError::Network("poisoned lock".to_owned()))?;
        if let Some(error) = data.failing_loads.pop_front() {
            return Err(error);
        }

        let records = data
            .threads
            .get(&thread_key(
                &conversation.local_user_id,
                &conversation.peer_user_id,
            ))
            .map(|thread| {
                thread
                    .iter()
                    .map(|stored| HistoryRecord {
                        id: Some(stored.id.clone()),
                        sender_id: Some(stored.sender_id.clone()),
                        from_self: None,
                        text: stored.text.clone(),
                        sent_at_ms: Some(stored.sent_at_ms),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(records_to_messages(conversation, records))
    }

    async fn persist(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> Result<PersistAck, WriteError> {
        let now_ms = self.clock.now_ms();
        let mut data = self
            .data
            .lock()
            .map_err(|_| WriteError::Network("poisoned lock".to_owned()))?;
        if let Some(error) = data.failing_writes.pop_front() {
            return Err(error);
        }

        let id = data.append(
            &conversation.local_user_id,
            &conversation.peer_user_id,
            text,
            now_ms,
        );
        Ok(PersistAck {
            message_id: Some(id),
        })
    }
}

fn thread_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_owned(), b.to_owned())
    } else {
        (b.to_owned(), a.to_owned())
    }
}
