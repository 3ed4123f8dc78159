use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ChannelError;

const IN_MEMORY_EVENT_BUFFER: usize = 256;

/// Inbound event pushed by the live channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LiveEvent {
    /// Transport (re)connected.
    Connected,
    /// Transport dropped; a reconnect may follow.
    Disconnected { reason: Option<String> },
    /// `message-received`. The sender is implied when absent.
    MessageReceived {
        sender_id: Option<String>,
        text: String,
        sent_at_ms: Option<u64>,
    },
    /// `typing-start`.
    TypingStarted { sender_id: Option<String> },
    /// `typing-stop`.
    TypingStopped { sender_id: Option<String> },
}

impl LiveEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::MessageReceived { .. } => "message-received",
            Self::TypingStarted { .. } => "typing-start",
            Self::TypingStopped { .. } => "typing-stop",
        }
    }

    /// Explicit sender of a conversation-scoped event, when the payload names one.
    pub fn sender_id(&self) -> Option<&str> {
        match self {
            Self::MessageReceived { sender_id, .. }
            | Self::TypingStarted { sender_id }
            | Self::TypingStopped { sender_id } => sender_id.as_deref(),
            Self::Connected | Self::Disconnected { .. } => None,
        }
    }

    /// Whether the event concerns connection lifecycle rather than a conversation.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Connected | Self::Disconnected { .. })
    }
}

/// Outbound event emitted on the live channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutboundEvent {
    /// `add-user`: register this connection under `user_id`.
    AnnounceIdentity { user_id: String },
    /// `send-message`.
    SendMessage {
        to: String,
        from: String,
        text: String,
    },
    /// `typing-start`.
    TypingStart { to: String, from: String },
    /// `typing-stop`.
    TypingStop { to: String, from: String },
}

impl OutboundEvent {
    /// Wire event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AnnounceIdentity { .. } => "add-user",
            Self::SendMessage { .. } => "send-message",
            Self::TypingStart { .. } => "typing-start",
            Self::TypingStop { .. } => "typing-stop",
        }
    }
}

/// Bidirectional named-event stream.
///
/// Implementations must never deliver `MessageReceived` for a message sent by
/// the receiving client's own identity; the timeline does not reconcile a
/// local echo against an echo-back of the same message.
#[async_trait]
pub trait LiveChannel: Send + Sync {
    /// Emit one event. Fails with [`ChannelError::Disconnected`] while offline.
    ///
    /// `Ok` means the event was accepted for delivery, not that the peer saw
    /// it; a transport may discard accepted events if it drops before writing.
    async fn emit(&self, event: OutboundEvent) -> Result<(), ChannelError>;

    /// Subscribe to inbound events, including connect/disconnect.
    ///
    /// Dropping the receiver releases the subscription.
    fn subscribe(&self) -> broadcast::Receiver<LiveEvent>;

    fn is_connected(&self) -> bool;
}

/// Loopback channel: records emitted events and lets callers inject inbound ones.
#[derive(Clone)]
pub struct InMemoryLiveChannel {
    inner: Arc<InMemoryChannelInner>,
}

struct InMemoryChannelInner {
    events: broadcast::Sender<LiveEvent>,
    connected: AtomicBool,
    emitted: Mutex<Vec<OutboundEvent>>,
}

impl InMemoryLiveChannel {
    pub fn new(connected: bool) -> Self {
        let (events, _) = broadcast::channel(IN_MEMORY_EVENT_BUFFER);
        Self {
            inner: Arc::new(InMemoryChannelInner {
                events,
                connected: AtomicBool::new(connected),
                emitted: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Mark connected and broadcast `Connected`.
    pub fn connect(&self) {
        self.inner.connected.store(true, Ordering::SeqCst);
        let _ = self.inner.events.send(LiveEvent::Connected);
    }

    /// Mark disconnected and broadcast `Disconnected`.
    pub fn disconnect(&self, reason: impl Into<String>) {
        self.inner.connected.store(false, Ordering::SeqCst);
        let _ = self.inner.events.send(LiveEvent::Disconnected {
            reason: Some(reason.into()),
        });
    }

    /// Deliver an inbound event to every subscriber.
    pub fn deliver(&self, event: LiveEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Events emitted so far, oldest first.
    pub fn emitted(&self) -> Vec<OutboundEvent> {
        self.inner
            .emitted
            .lock()
            .map(|emitted| emitted.clone())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.events.receiver_count()
    }
}

impl Default for InMemoryLiveChannel {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl LiveChannel for InMemoryLiveChannel {
    async fn emit(&self, event: OutboundEvent) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Disconnected);
        }
        self.inner
            .emitted
            .lock()
            .map_err(|_| ChannelError::Closed)?
            .push(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.inner.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_emitted_events_while_connected() {
        let channel = InMemoryLiveChannel::new(true);
        channel
            .emit(OutboundEvent::AnnounceIdentity {
                user_id: "alice".into(),
            })
            .await
            .expect("emit while connected");

        assert_eq!(
            channel.emitted(),
            vec![OutboundEvent::AnnounceIdentity {
                user_id: "alice".into()
            }]
        );
    }

    #[tokio::test]
    async fn rejects_emit_while_disconnected() {
        let channel = InMemoryLiveChannel::new(false);
        let err = channel
            .emit(OutboundEvent::TypingStart {
                to: "bob".into(),
                from: "alice".into(),
            })
            .await
            .expect_err("offline emit must fail");
        assert_eq!(err, ChannelError::Disconnected);
        assert!(channel.emitted().is_empty());
    }

    #[tokio::test]
    async fn fans_out_lifecycle_and_inbound_events() {
        let channel = InMemoryLiveChannel::new(false);
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 2);

        channel.connect();
        channel.deliver(LiveEvent::TypingStarted {
            sender_id: Some("bob".into()),
        });

        assert_eq!(a.recv().await.expect("a connected"), LiveEvent::Connected);
        assert_eq!(b.recv().await.expect("b connected"), LiveEvent::Connected);
        let typing = a.recv().await.expect("a typing");
        assert_eq!(typing.kind(), "typing-start");
        assert_eq!(typing.sender_id(), Some("bob"));
        assert!(channel.is_connected());

        drop(b);
        assert_eq!(channel.subscriber_count(), 1);
    }

    #[test]
    fn outbound_events_use_wire_names() {
        let event = OutboundEvent::SendMessage {
            to: "bob".into(),
            from: "alice".into(),
            text: "hi".into(),
        };
        assert_eq!(event.name(), "send-message");
        assert_eq!(
            OutboundEvent::AnnounceIdentity {
                user_id: "alice".into()
            }
            .name(),
            "add-user"
        );
    }
}
