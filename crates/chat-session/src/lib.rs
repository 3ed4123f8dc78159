//! Session controller for one-to-one chat.
//!
//! A session is an actor task that owns the active conversation timeline,
//! both typing state machines and the live channel bindings. Front ends talk
//! to it through a cloneable [`SessionHandle`]; the session ends on
//! `EndSession` or once every handle is dropped.

mod binding;
mod channel;
mod config;
mod runtime;

use chat_core::{Message, SessionCommand, SessionError, SessionSnapshot};
use tokio::sync::oneshot;

pub use channel::EventStream;
pub use config::{DEFAULT_TIMELINE_MAX_ITEMS, SessionConfig, SessionConfigError};
pub use runtime::SessionContext;

use crate::{
    channel::{SessionChannels, SessionRequest},
    runtime::SessionRuntime,
};

#[derive(Clone, Debug)]
pub struct SessionHandle {
    channels: SessionChannels,
}

impl SessionHandle {
    /// Queue one command. Rejections arrive as `CommandRejected` events.
    pub async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.channels
            .request(SessionRequest::Command(command))
            .await
    }

    /// Send a message to the active peer.
    ///
    /// Resolves with the local echo once it is in the timeline; the write path
    /// completes later and reports through a `SendAck` event.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<Message, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.channels
            .request(SessionRequest::SendText {
                text: text.into(),
                reply,
            })
            .await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.channels
            .request(SessionRequest::Snapshot { reply })
            .await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Validate `config` and spawn a session runtime on the current tokio runtime.
pub fn spawn_session(
    context: SessionContext,
    config: SessionConfig,
) -> Result<SessionHandle, SessionConfigError> {
    config.validate()?;
    let (channels, request_rx) = SessionChannels::new(config.request_buffer, config.event_buffer);
    let runtime = SessionRuntime::new(context, config, channels.event_sender(), request_rx);
    tokio::spawn(runtime.run());

    Ok(SessionHandle { channels })
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;
    use chat_core::{
        ConversationId, HistoryStore, InMemoryHistoryStore, InMemoryLiveChannel, LiveEvent,
        LoadError, LoadStatus, ManualClock, MessageOrigin, OutboundEvent, PersistAck,
        SessionEvent, WriteError,
    };
    use tokio::{sync::Semaphore, time::timeout};

    use super::*;

    /// History store that holds loads for one peer until permits are added.
    struct GatedHistoryStore {
        inner: InMemoryHistoryStore,
        gated_peer: String,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl HistoryStore for GatedHistoryStore {
        async fn load(&self, conversation: &ConversationId) -> Result<Vec<Message>, LoadError> {
            if conversation.peer_user_id == self.gated_peer {
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|_| LoadError::Network("gate closed".into()))?;
            }
            self.inner.load(conversation).await
        }

        async fn persist(
            &self,
            conversation: &ConversationId,
            text: &str,
        ) -> Result<PersistAck, WriteError> {
            self.inner.persist(conversation, text).await
        }
    }

    struct Harness {
        handle: SessionHandle,
        events: EventStream,
        channel: InMemoryLiveChannel,
        history: InMemoryHistoryStore,
        clock: ManualClock,
    }

    fn harness_with(
        config: SessionConfig,
        wrap: impl FnOnce(InMemoryHistoryStore) -> Arc<dyn HistoryStore>,
    ) -> Harness {
        let clock = ManualClock::new(0);
        let channel = InMemoryLiveChannel::new(true);
        let history = InMemoryHistoryStore::new(Arc::new(clock.clone()));
        let context = SessionContext::new(Arc::new(channel.clone()), wrap(history.clone()))
            .with_clock(Arc::new(clock.clone()));
        let handle = spawn_session(context, config).expect("valid session config");
        let events = handle.subscribe();
        Harness {
            handle,
            events,
            channel,
            history,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(SessionConfig::default(), |history| {
            Arc::new(history) as Arc<dyn HistoryStore>
        })
    }

    fn gated_harness(peer: &str) -> (Harness, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let gated_peer = peer.to_owned();
        let store_gate = Arc::clone(&gate);
        let harness = harness_with(SessionConfig::default(), move |inner| {
            Arc::new(GatedHistoryStore {
                inner,
                gated_peer,
                gate: store_gate,
            }) as Arc<dyn HistoryStore>
        });
        (harness, gate)
    }

    async fn next_matching(
        events: &mut EventStream,
        mut matches: impl FnMut(&SessionEvent) -> bool,
    ) -> SessionEvent {
        timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) => continue,
                    Err(err) => panic!("event stream failed: {err}"),
                }
            }
        })
        .await
        .expect("event timeout")
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn conversation_with(peer: &str) -> ConversationId {
        ConversationId::new("alice", peer)
    }

    async fn sign_in(h: &mut Harness) {
        h.handle
            .send(SessionCommand::Authenticate {
                user_id: "alice".into(),
            })
            .await
            .expect("command should enqueue");
        next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::IdentityAnnounced { .. })
        })
        .await;
    }

    async fn open_ready(h: &mut Harness, peer: &str) -> Vec<Message> {
        h.handle
            .send(SessionCommand::OpenConversation {
                peer_user_id: peer.into(),
            })
            .await
            .expect("command should enqueue");
        let expected = conversation_with(peer);
        match next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::TimelineSnapshot { conversation, .. } if *conversation == expected)
        })
        .await
        {
            SessionEvent::TimelineSnapshot { messages, .. } => messages,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fn peer_message(sender: &str, text: &str, sent_at_ms: Option<u64>) -> LiveEvent {
        LiveEvent::MessageReceived {
            sender_id: Some(sender.into()),
            text: text.into(),
            sent_at_ms,
        }
    }

    fn texts(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|message| message.text.as_str()).collect()
    }

    #[test]
    fn rejects_invalid_config_before_spawning() {
        let config = SessionConfig {
            typing_debounce: Duration::from_millis(3_000),
            typing_timeout: Duration::from_millis(1_000),
            ..SessionConfig::default()
        };
        let context = SessionContext::new(
            Arc::new(InMemoryLiveChannel::default()),
            Arc::new(InMemoryHistoryStore::default()),
        );
        assert!(matches!(
            spawn_session(context, config),
            Err(SessionConfigError::TypingTimeoutTooShort { .. })
        ));
    }

    #[tokio::test]
    async fn merges_history_with_live_messages_in_order() {
        let mut h = harness();
        h.history.seed("bob", "alice", "hi", 100);
        sign_in(&mut h).await;

        let loaded = open_ready(&mut h, "bob").await;
        assert_eq!(texts(&loaded), vec!["hi"]);
        assert_eq!(loaded[0].origin, MessageOrigin::Historical);

        h.clock.set(150);
        h.channel.deliver(peer_message("bob", "yo", None));
        next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::TimelineAppended { message, .. } if message.text == "yo")
        })
        .await;

        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.load_status, LoadStatus::Ready);
        assert_eq!(texts(&snapshot.messages), vec!["hi", "yo"]);
        let stamps: Vec<_> = snapshot.messages.iter().map(|m| m.sent_at_ms).collect();
        assert_eq!(stamps, vec![100, 150]);
        assert!(snapshot.messages.iter().all(|m| !m.sender_is_self));
    }

    #[tokio::test]
    async fn local_echo_is_immediate_and_survives_write_failure() {
        let mut h = harness();
        sign_in(&mut h).await;
        open_ready(&mut h, "bob").await;

        h.history
            .fail_next_write(WriteError::Network("connection reset".into()));
        h.clock.set(200);
        let echo = h.handle.send_text("  hello  ").await.expect("send");
        assert_eq!(echo.text, "hello");
        assert_eq!(echo.sent_at_ms, 200);
        assert!(echo.sender_is_self);
        assert_eq!(echo.origin, MessageOrigin::LocalEcho);

        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.messages, vec![echo.clone()]);

        match next_matching(&mut h.events, |event| matches!(event, SessionEvent::SendAck(_))).await
        {
            SessionEvent::SendAck(ack) => {
                assert_eq!(Some(ack.client_txn_id), echo.client_txn_id);
                assert_eq!(ack.error_code.as_deref(), Some("write_network"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(texts(&snapshot.messages), vec!["hello"]);
        assert!(h.channel.emitted().contains(&OutboundEvent::SendMessage {
            to: "bob".into(),
            from: "alice".into(),
            text: "hello".into(),
        }));
    }

    #[tokio::test]
    async fn successful_write_attaches_server_id_to_echo() {
        let mut h = harness();
        sign_in(&mut h).await;
        open_ready(&mut h, "bob").await;

        let echo = h.handle.send_text("hello").await.expect("send");
        let acknowledged = next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::MessageAcknowledged { .. })
        })
        .await;
        let SessionEvent::MessageAcknowledged {
            client_txn_id,
            message_id,
            ..
        } = acknowledged
        else {
            panic!("unexpected event: {acknowledged:?}");
        };
        assert_eq!(Some(client_txn_id), echo.client_txn_id);

        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].id.as_deref(), Some(message_id.as_str()));
        assert_eq!(h.history.thread_len("alice", "bob"), 1);
    }

    #[tokio::test]
    async fn ignores_live_events_from_other_senders() {
        let mut h = harness();
        sign_in(&mut h).await;
        open_ready(&mut h, "bob").await;

        h.channel.deliver(peer_message("carol", "wrong room", None));
        h.channel.deliver(peer_message("alice", "echo of mine", None));
        h.channel.deliver(LiveEvent::TypingStarted {
            sender_id: Some("carol".into()),
        });
        h.channel.deliver(peer_message("bob", "right room", None));
        next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::TimelineAppended { .. })
        })
        .await;

        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(texts(&snapshot.messages), vec!["right room"]);
        assert!(!snapshot.is_peer_typing);
    }

    #[tokio::test]
    async fn switching_while_loading_discards_the_old_load() {
        let (mut h, gate) = gated_harness("carol");
        h.history.seed("carol", "alice", "from carol", 10);
        h.history.seed("bob", "alice", "from bob", 20);
        sign_in(&mut h).await;

        h.handle
            .send(SessionCommand::OpenConversation {
                peer_user_id: "carol".into(),
            })
            .await
            .expect("command should enqueue");
        next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::TimelineStatus { status: LoadStatus::Loading, .. })
        })
        .await;

        let loaded = open_ready(&mut h, "bob").await;
        assert_eq!(texts(&loaded), vec!["from bob"]);

        gate.add_permits(1);
        settle().await;
        h.channel.deliver(peer_message("carol", "late", None));
        settle().await;

        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.conversation, Some(conversation_with("bob")));
        assert_eq!(texts(&snapshot.messages), vec!["from bob"]);
        while let Ok(event) = h.events.try_recv() {
            if let SessionEvent::TimelineSnapshot { conversation, .. } = event {
                assert_ne!(conversation, conversation_with("carol"));
            }
        }
    }

    #[tokio::test]
    async fn message_from_inactive_peer_does_not_leak_into_later_timeline() {
        let mut h = harness();
        h.history.seed("bob", "alice", "hi bob", 10);
        h.history.seed("carol", "alice", "stored", 20);
        sign_in(&mut h).await;
        open_ready(&mut h, "bob").await;

        h.clock.set(100);
        h.channel.deliver(peer_message("carol", "while away", None));
        settle().await;
        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(texts(&snapshot.messages), vec!["hi bob"]);

        let loaded = open_ready(&mut h, "carol").await;
        assert_eq!(texts(&loaded), vec!["stored"]);
        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.conversation, Some(conversation_with("carol")));
        assert_eq!(texts(&snapshot.messages), vec!["stored"]);
    }

    #[tokio::test]
    async fn replays_live_messages_received_during_load() {
        let (mut h, gate) = gated_harness("bob");
        h.history.seed("bob", "alice", "hi", 100);
        h.history.seed("bob", "alice", "already stored", 290);
        sign_in(&mut h).await;

        h.handle
            .send(SessionCommand::OpenConversation {
                peer_user_id: "bob".into(),
            })
            .await
            .expect("command should enqueue");
        next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::TimelineStatus { status: LoadStatus::Loading, .. })
        })
        .await;

        h.clock.set(300);
        h.channel.deliver(peer_message("bob", "already stored", None));
        h.channel.deliver(peer_message("bob", "early", None));
        settle().await;
        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.load_status, LoadStatus::Loading);
        assert!(snapshot.messages.is_empty());

        gate.add_permits(1);
        let SessionEvent::TimelineSnapshot { messages, .. } = next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::TimelineSnapshot { .. })
        })
        .await
        else {
            unreachable!("matched a snapshot");
        };
        assert_eq!(texts(&messages), vec!["hi", "already stored", "early"]);
    }

    #[tokio::test]
    async fn failed_load_can_be_retried() {
        let mut h = harness();
        h.history.seed("bob", "alice", "hi", 100);
        h.history
            .fail_next_load(LoadError::Network("timed out".into()));
        sign_in(&mut h).await;

        h.handle
            .send(SessionCommand::OpenConversation {
                peer_user_id: "bob".into(),
            })
            .await
            .expect("command should enqueue");
        match next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::LoadFailed { .. })
        })
        .await
        {
            SessionEvent::LoadFailed {
                code, retryable, ..
            } => {
                assert_eq!(code, "load_network");
                assert!(retryable);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.load_status, LoadStatus::Failed);
        assert_eq!(snapshot.last_error_code.as_deref(), Some("load_network"));
        assert_eq!(
            h.handle.send_text("too soon").await,
            Err(SessionError::Timeline(chat_core::TimelineError::invalid_state(
                LoadStatus::Failed,
                "append_local_echo"
            )))
        );

        h.handle
            .send(SessionCommand::RetryLoad)
            .await
            .expect("command should enqueue");
        let SessionEvent::TimelineSnapshot { messages, .. } = next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::TimelineSnapshot { .. })
        })
        .await
        else {
            unreachable!("matched a snapshot");
        };
        assert_eq!(texts(&messages), vec!["hi"]);
        assert_eq!(h.history.load_count(), 2);

        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.last_error_code, None);
    }

    #[tokio::test]
    async fn rejects_commands_outside_valid_state() {
        let mut h = harness();
        assert_eq!(
            h.handle.send_text("hello").await,
            Err(SessionError::NotAuthenticated)
        );

        sign_in(&mut h).await;
        assert_eq!(
            h.handle.send_text("   ").await,
            Err(SessionError::EmptyMessage)
        );
        assert_eq!(
            h.handle.send_text("hello").await,
            Err(SessionError::NoActiveConversation)
        );

        h.handle
            .send(SessionCommand::OpenConversation {
                peer_user_id: "alice".into(),
            })
            .await
            .expect("command should enqueue");
        match next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::CommandRejected { .. })
        })
        .await
        {
            SessionEvent::CommandRejected { code, .. } => assert_eq!(code, "invalid_peer"),
            other => panic!("unexpected event: {other:?}"),
        }

        open_ready(&mut h, "bob").await;
        h.handle
            .send(SessionCommand::RetryLoad)
            .await
            .expect("command should enqueue");
        match next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::CommandRejected { .. })
        })
        .await
        {
            SessionEvent::CommandRejected { code, .. } => {
                assert_eq!(code, "invalid_timeline_state")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reannounces_identity_on_reconnect_without_refetching_history() {
        let mut h = harness();
        sign_in(&mut h).await;
        open_ready(&mut h, "bob").await;
        assert_eq!(h.history.load_count(), 1);

        h.channel.disconnect("server restart");
        next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::ChannelStatus { connected: false })
        })
        .await;

        let echo = h.handle.send_text("while offline").await.expect("send");
        next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::Notification { code, .. } if code == "channel_disconnected")
        })
        .await;

        h.channel.connect();
        next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::IdentityAnnounced { .. })
        })
        .await;

        let announces = h
            .channel
            .emitted()
            .into_iter()
            .filter(|event| matches!(event, OutboundEvent::AnnounceIdentity { .. }))
            .count();
        assert_eq!(announces, 2);
        assert_eq!(h.history.load_count(), 1);

        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert!(snapshot.channel_connected);
        assert_eq!(texts(&snapshot.messages), vec![echo.text.as_str()]);
    }

    #[tokio::test]
    async fn authenticating_twice_announces_once() {
        let mut h = harness();
        sign_in(&mut h).await;
        h.handle
            .send(SessionCommand::Authenticate {
                user_id: "alice".into(),
            })
            .await
            .expect("command should enqueue");

        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.local_user_id.as_deref(), Some("alice"));
        assert_eq!(
            h.channel.emitted(),
            vec![OutboundEvent::AnnounceIdentity {
                user_id: "alice".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn peer_typing_decays_after_timeout() {
        let config = SessionConfig {
            typing_timeout: Duration::from_millis(2_000),
            ..SessionConfig::default()
        };
        let mut h = harness_with(config, |history| Arc::new(history) as Arc<dyn HistoryStore>);
        sign_in(&mut h).await;
        open_ready(&mut h, "bob").await;

        h.channel.deliver(LiveEvent::TypingStarted {
            sender_id: Some("bob".into()),
        });
        next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::PeerTyping { is_typing: true, .. })
        })
        .await;

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(h.handle.snapshot().await.expect("snapshot").is_peer_typing);

        tokio::time::advance(Duration::from_millis(1_600)).await;
        next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::PeerTyping { is_typing: false, .. })
        })
        .await;
        assert!(!h.handle.snapshot().await.expect("snapshot").is_peer_typing);
    }

    #[tokio::test(start_paused = true)]
    async fn keystroke_burst_emits_one_start_and_one_stop() {
        let mut h = harness();
        sign_in(&mut h).await;
        open_ready(&mut h, "bob").await;

        for _ in 0..4 {
            h.handle
                .send(SessionCommand::Keystroke)
                .await
                .expect("command should enqueue");
            h.handle.snapshot().await.expect("snapshot");
            tokio::time::advance(Duration::from_millis(300)).await;
        }
        assert!(h.handle.snapshot().await.expect("snapshot").is_local_typing);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        next_matching(&mut h.events, |event| {
            matches!(event, SessionEvent::LocalTyping { is_typing: false, .. })
        })
        .await;

        let typing: Vec<_> = h
            .channel
            .emitted()
            .into_iter()
            .filter(|event| {
                matches!(
                    event,
                    OutboundEvent::TypingStart { .. } | OutboundEvent::TypingStop { .. }
                )
            })
            .collect();
        assert_eq!(
            typing,
            vec![
                OutboundEvent::TypingStart {
                    to: "bob".into(),
                    from: "alice".into()
                },
                OutboundEvent::TypingStop {
                    to: "bob".into(),
                    from: "alice".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn sending_ends_local_typing() {
        let mut h = harness();
        sign_in(&mut h).await;
        open_ready(&mut h, "bob").await;

        h.handle
            .send(SessionCommand::Keystroke)
            .await
            .expect("command should enqueue");
        h.handle.send_text("done").await.expect("send");

        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert!(!snapshot.is_local_typing);
        let emitted = h.channel.emitted();
        assert!(matches!(
            emitted.last(),
            Some(OutboundEvent::TypingStop { .. })
        ));
    }

    #[tokio::test]
    async fn end_session_releases_bindings_and_closes_handle() {
        let mut h = harness();
        sign_in(&mut h).await;
        open_ready(&mut h, "bob").await;
        h.handle
            .send(SessionCommand::Keystroke)
            .await
            .expect("command should enqueue");

        h.handle
            .send(SessionCommand::EndSession)
            .await
            .expect("command should enqueue");
        next_matching(&mut h.events, |event| matches!(event, SessionEvent::SessionEnded)).await;

        assert!(matches!(
            h.channel.emitted().last(),
            Some(OutboundEvent::TypingStop { .. })
        ));
        assert_eq!(h.handle.snapshot().await, Err(SessionError::Closed));

        for _ in 0..100 {
            if h.channel.subscriber_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.channel.subscriber_count(), 0);

        h.channel.deliver(peer_message("bob", "after teardown", None));
        settle().await;
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_every_handle_ends_the_session() {
        let Harness {
            handle, mut events, ..
        } = harness();
        let clone = handle.clone();
        drop(handle);
        drop(clone);

        next_matching(&mut events, |event| matches!(event, SessionEvent::SessionEnded)).await;
    }
}
