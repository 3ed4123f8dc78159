use std::sync::Arc;

use chat_core::{ConversationId, LiveChannel, LiveEvent};
use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Which live events a binding forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BindingScope {
    /// Connection lifecycle (`Connected`/`Disconnected`) for the session.
    Channel,
    /// Message and typing events from the peer of one conversation.
    Conversation(ConversationId),
}

impl BindingScope {
    pub(crate) fn accepts(&self, event: &LiveEvent) -> bool {
        match self {
            Self::Channel => event.is_lifecycle(),
            Self::Conversation(_) if event.is_lifecycle() => false,
            Self::Conversation(conversation) => match event.sender_id() {
                None => true,
                Some(sender) if conversation.is_peer(sender) => true,
                Some(sender) if conversation.is_local(sender) => {
                    warn!(
                        conversation = %conversation,
                        kind = event.kind(),
                        "dropping live event sent by own identity"
                    );
                    false
                }
                Some(sender) => {
                    trace!(
                        conversation = %conversation,
                        sender,
                        kind = event.kind(),
                        "ignoring live event for inactive conversation"
                    );
                    false
                }
            },
        }
    }
}

/// Live event forwarded by a binding, tagged with the binding id.
#[derive(Debug)]
pub(crate) struct BoundEvent {
    pub(crate) binding: u64,
    pub(crate) event: LiveEvent,
}

/// Subscription to the live channel scoped to the session or one conversation.
///
/// Releasing (or dropping) the binding stops forwarding; events it already
/// queued are recognized as stale by their binding id.
#[derive(Debug)]
pub(crate) struct LiveBinding {
    id: u64,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl LiveBinding {
    /// Subscribe synchronously, then forward accepted events from a spawned task.
    pub(crate) fn attach<T>(
        channel: &Arc<dyn LiveChannel>,
        id: u64,
        scope: BindingScope,
        tx: mpsc::UnboundedSender<T>,
    ) -> Self
    where
        T: From<BoundEvent> + Send + 'static,
    {
        let mut events = channel.subscribe();
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_child.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => {
                            if !scope.accepts(&event) {
                                continue;
                            }
                            if tx.send(T::from(BoundEvent { binding: id, event })).is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(binding = id, skipped, "live binding lagged; events dropped");
                        }
                        Err(RecvError::Closed) => {
                            debug!(binding = id, "live channel closed");
                            break;
                        }
                    }
                }
            }
        });

        debug!(binding = id, "live binding attached");
        Self { id, stop, task }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for LiveBinding {
    fn drop(&mut self) {
        self.stop.cancel();
        self.task.abort();
        trace!(binding = self.id, "live binding released");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chat_core::InMemoryLiveChannel;
    use tokio::time::timeout;

    use super::*;

    fn peer_scope() -> BindingScope {
        BindingScope::Conversation(ConversationId::new("alice", "bob"))
    }

    fn message_from(sender: Option<&str>) -> LiveEvent {
        LiveEvent::MessageReceived {
            sender_id: sender.map(str::to_owned),
            text: "hi".into(),
            sent_at_ms: None,
        }
    }

    #[test]
    fn conversation_scope_filters_by_sender() {
        let scope = peer_scope();
        assert!(scope.accepts(&message_from(Some("bob"))));
        assert!(scope.accepts(&message_from(None)));
        assert!(!scope.accepts(&message_from(Some("carol"))));
        assert!(!scope.accepts(&message_from(Some("alice"))));
        assert!(!scope.accepts(&LiveEvent::Connected));
    }

    #[test]
    fn channel_scope_only_forwards_lifecycle() {
        assert!(BindingScope::Channel.accepts(&LiveEvent::Connected));
        assert!(BindingScope::Channel.accepts(&LiveEvent::Disconnected { reason: None }));
        assert!(!BindingScope::Channel.accepts(&message_from(Some("bob"))));
    }

    #[tokio::test]
    async fn forwards_tagged_events_until_released() {
        let fake = InMemoryLiveChannel::new(true);
        let channel: Arc<dyn LiveChannel> = Arc::new(fake.clone());
        let (tx, mut rx) = mpsc::unbounded_channel::<BoundEvent>();

        let binding = LiveBinding::attach(&channel, 7, peer_scope(), tx);
        assert_eq!(binding.id(), 7);
        fake.deliver(message_from(Some("carol")));
        fake.deliver(message_from(Some("bob")));

        let forwarded = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("forward timeout")
            .expect("forwarded event");
        assert_eq!(forwarded.binding, 7);
        assert_eq!(forwarded.event, message_from(Some("bob")));

        drop(binding);
        tokio::task::yield_now().await;
        fake.deliver(message_from(Some("bob")));
        let closed = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("sender should drop with the task");
        assert!(closed.is_none());
        assert_eq!(fake.subscriber_count(), 0);
    }
}
