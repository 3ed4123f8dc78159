//! Console-facing state reducer for `parley-cli`.
//!
//! Session events go in, transcript lines come out. The reducer also keeps a
//! trimmed copy of the visible conversation so `/who` can reprint it.

use std::collections::HashSet;

use chat_core::{ConversationId, LoadStatus, Message, SendAck, SessionEvent};
use tracing::{debug, warn};

const DEFAULT_STATUS: &str = "Offline";

/// One transcript row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub message_id: Option<String>,
    pub client_txn_id: Option<String>,
    pub sender: String,
    pub body: String,
    pub is_own: bool,
}

impl MessageView {
    fn render(&self) -> String {
        let pending = if self.is_own && self.message_id.is_none() {
            " (sending)"
        } else {
            ""
        };
        format!("{}: {}{pending}", self.sender, self.body)
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleState {
    timeline_max_items: usize,
    conversation: Option<ConversationId>,
    messages: Vec<MessageView>,
    status_text: String,
    error_text: Option<String>,
    peer_typing: bool,
    pending_sends: HashSet<String>,
}

impl ConsoleState {
    pub fn new(timeline_max_items: usize) -> Self {
        Self {
            timeline_max_items: timeline_max_items.max(1),
            conversation: None,
            messages: Vec::new(),
            status_text: DEFAULT_STATUS.to_owned(),
            error_text: None,
            peer_typing: false,
            pending_sends: HashSet::new(),
        }
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn error_text(&self) -> Option<&str> {
        self.error_text.as_deref()
    }

    pub fn messages(&self) -> &[MessageView] {
        &self.messages
    }

    pub fn pending_sends(&self) -> usize {
        self.pending_sends.len()
    }

    /// Full transcript of the visible conversation.
    pub fn transcript(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.messages.len() + 1);
        match &self.conversation {
            Some(conversation) => lines.push(format!(
                "--- {} ({}) ---",
                conversation.peer_user_id, self.status_text
            )),
            None => lines.push(format!("--- no conversation ({}) ---", self.status_text)),
        }
        lines.extend(self.messages.iter().map(MessageView::render));
        lines
    }

    /// Feed one session event into the reducer; returns lines to print.
    pub fn handle_session_event(&mut self, event: SessionEvent) -> Vec<String> {
        match event {
            SessionEvent::ChannelStatus { connected } => {
                self.status_text = if connected { "Connected" } else { "Reconnecting" }.to_owned();
                vec![format!("* {}", self.status_text.to_lowercase())]
            }
            SessionEvent::IdentityAnnounced { user_id } => {
                vec![format!("* signed in as {user_id}")]
            }
            SessionEvent::TimelineStatus {
                conversation,
                status,
            } => {
                if self.conversation.as_ref() != Some(&conversation) {
                    self.conversation = Some(conversation.clone());
                    self.messages.clear();
                    self.peer_typing = false;
                }
                match status {
                    LoadStatus::Loading => {
                        vec![format!("* loading history with {}", conversation.peer_user_id)]
                    }
                    LoadStatus::Idle | LoadStatus::Ready | LoadStatus::Failed => Vec::new(),
                }
            }
            SessionEvent::TimelineSnapshot {
                conversation,
                messages,
            } => {
                self.conversation = Some(conversation.clone());
                self.messages = messages
                    .iter()
                    .map(|message| view_for(&conversation, message))
                    .collect();
                self.trim();
                self.error_text = None;
                debug!(count = self.messages.len(), "transcript replaced");
                self.transcript()
            }
            SessionEvent::TimelineAppended {
                conversation,
                index,
                message,
            } => {
                if self.conversation.as_ref() != Some(&conversation) {
                    return Vec::new();
                }
                if let Some(txn) = &message.client_txn_id {
                    self.pending_sends.insert(txn.clone());
                }
                let view = view_for(&conversation, &message);
                let line = view.render();
                self.messages.insert(index.min(self.messages.len()), view);
                self.trim();
                if !message.sender_is_self {
                    self.peer_typing = false;
                }
                vec![line]
            }
            SessionEvent::MessageAcknowledged {
                conversation,
                client_txn_id,
                message_id,
            } => {
                if self.conversation.as_ref() == Some(&conversation)
                    && let Some(view) = self
                        .messages
                        .iter_mut()
                        .find(|view| view.client_txn_id.as_deref() == Some(client_txn_id.as_str()))
                {
                    view.message_id = Some(message_id);
                }
                Vec::new()
            }
            SessionEvent::LoadFailed {
                message, retryable, ..
            } => {
                let hint = if retryable { " (type /retry)" } else { "" };
                self.error_text = Some(message.clone());
                vec![format!("! history failed: {message}{hint}")]
            }
            SessionEvent::PeerTyping {
                conversation,
                is_typing,
            } => {
                if self.conversation.as_ref() != Some(&conversation) || self.peer_typing == is_typing
                {
                    return Vec::new();
                }
                self.peer_typing = is_typing;
                if is_typing {
                    vec![format!("* {} is typing...", conversation.peer_user_id)]
                } else {
                    Vec::new()
                }
            }
            SessionEvent::LocalTyping { .. } => Vec::new(),
            SessionEvent::SendAck(ack) => self.handle_send_ack(ack),
            SessionEvent::Notification { code, message } => {
                warn!(%code, "session notification");
                vec![format!("! {message}")]
            }
            SessionEvent::CommandRejected { code, message } => {
                self.error_text = Some(format!("{code}: {message}"));
                vec![format!("! {message}")]
            }
            SessionEvent::SessionEnded => {
                self.status_text = "Ended".to_owned();
                vec!["* session ended".to_owned()]
            }
        }
    }

    fn handle_send_ack(&mut self, ack: SendAck) -> Vec<String> {
        self.pending_sends.remove(&ack.client_txn_id);
        match ack.error_code {
            Some(error_code) => {
                self.error_text = Some(format!("send failed ({error_code})"));
                vec![format!("! message was not stored ({error_code})")]
            }
            None => Vec::new(),
        }
    }

    fn trim(&mut self) {
        if self.messages.len() > self.timeline_max_items {
            let excess = self.messages.len() - self.timeline_max_items;
            self.messages.drain(0..excess);
        }
    }
}

fn view_for(conversation: &ConversationId, message: &Message) -> MessageView {
    MessageView {
        message_id: message.id.clone(),
        client_txn_id: message.client_txn_id.clone(),
        sender: if message.sender_is_self {
            "you".to_owned()
        } else {
            conversation.peer_user_id.clone()
        },
        body: message.text.clone(),
        is_own: message.sender_is_self,
    }
}
