use std::sync::Arc;

use chat_core::{
    Clock, ConversationId, HistoryStore, LiveChannel, LiveEvent, LoadError, LoadStatus,
    LocalTyping, Message, OutboundEvent, PeerTyping, RemoteAppend, SessionCommand, SessionError,
    SessionEvent, SessionSnapshot, SystemClock, TimelineState, TypingSignal, WriteOutcome,
    normalize_channel_error, normalize_load_failure, normalize_write_outcome,
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    binding::{BindingScope, BoundEvent, LiveBinding},
    channel::SessionRequest,
    config::SessionConfig,
};

/// Collaborators injected into one session.
#[derive(Clone)]
pub struct SessionContext {
    pub channel: Arc<dyn LiveChannel>,
    pub history: Arc<dyn HistoryStore>,
    pub clock: Arc<dyn Clock>,
}

impl SessionContext {
    pub fn new(channel: Arc<dyn LiveChannel>, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            channel,
            history,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Results reported back to the runtime by tasks it spawned.
#[derive(Debug)]
pub(crate) enum Feedback {
    Live(BoundEvent),
    LoadFinished {
        activation: u64,
        generation: u64,
        result: Result<Vec<Message>, LoadError>,
    },
    WriteFinished {
        conversation: ConversationId,
        client_txn_id: String,
        outcome: WriteOutcome,
    },
    LocalTypingElapsed {
        activation: u64,
        generation: u64,
    },
    PeerTypingElapsed {
        activation: u64,
        generation: u64,
    },
}

impl From<BoundEvent> for Feedback {
    fn from(event: BoundEvent) -> Self {
        Self::Live(event)
    }
}

#[derive(Debug)]
struct RunningLoad(JoinHandle<()>);

impl Drop for RunningLoad {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Everything scoped to the active conversation. Dropping it releases the
/// live binding, aborts the load and cancels both typing timers.
#[derive(Debug)]
struct ActiveConversation {
    timeline: TimelineState,
    local_typing: LocalTyping,
    peer_typing: PeerTyping,
    binding: LiveBinding,
    load: Option<RunningLoad>,
}

impl ActiveConversation {
    fn activation(&self) -> u64 {
        self.binding.id()
    }

    fn conversation(&self) -> &ConversationId {
        self.timeline.conversation()
    }
}

pub(crate) struct SessionRuntime {
    context: SessionContext,
    config: SessionConfig,
    events: broadcast::Sender<SessionEvent>,
    request_rx: mpsc::Receiver<SessionRequest>,
    feedback_tx: mpsc::UnboundedSender<Feedback>,
    feedback_rx: mpsc::UnboundedReceiver<Feedback>,
    local_user_id: Option<String>,
    channel_binding: Option<LiveBinding>,
    channel_connected: bool,
    identity_announced: bool,
    active: Option<ActiveConversation>,
    next_binding_id: u64,
    last_error_code: Option<String>,
}

impl SessionRuntime {
    pub(crate) fn new(
        context: SessionContext,
        config: SessionConfig,
        events: broadcast::Sender<SessionEvent>,
        request_rx: mpsc::Receiver<SessionRequest>,
    ) -> Self {
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        Self {
            context,
            config,
            events,
            request_rx,
            feedback_tx,
            feedback_rx,
            local_user_id: None,
            channel_binding: None,
            channel_connected: false,
            identity_announced: false,
            active: None,
            next_binding_id: 0,
            last_error_code: None,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("session runtime started");
        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    let Some(request) = request else {
                        debug!("all session handles dropped");
                        break;
                    };
                    if !self.handle_request(request).await {
                        break;
                    }
                }
                Some(feedback) = self.feedback_rx.recv() => self.handle_feedback(feedback).await,
            }
        }
        self.teardown().await;
    }

    /// Returns `false` once the session should end.
    async fn handle_request(&mut self, request: SessionRequest) -> bool {
        match request {
            SessionRequest::Command(SessionCommand::EndSession) => {
                info!("session end requested");
                return false;
            }
            SessionRequest::Command(command) => {
                if let Err(err) = self.handle_command(command).await {
                    self.reject(err);
                }
            }
            SessionRequest::SendText { text, reply } => {
                let result = self.handle_send_text(text).await;
                let _ = reply.send(result);
            }
            SessionRequest::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
        true
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Result<(), SessionError> {
        match command {
            SessionCommand::Authenticate { user_id } => self.handle_authenticate(user_id).await,
            SessionCommand::OpenConversation { peer_user_id } => {
                self.handle_open_conversation(peer_user_id).await
            }
            SessionCommand::RetryLoad => {
                self.require_user()?;
                self.start_load()
            }
            SessionCommand::SendText { text } => self.handle_send_text(text).await.map(|_| ()),
            SessionCommand::Keystroke => self.handle_keystroke().await,
            SessionCommand::CloseConversation => {
                self.deactivate().await;
                Ok(())
            }
            SessionCommand::EndSession => Ok(()),
        }
    }

    async fn handle_authenticate(&mut self, user_id: String) -> Result<(), SessionError> {
        let user_id = user_id.trim().to_owned();
        if user_id.is_empty() {
            return Err(SessionError::NotAuthenticated);
        }
        if self.local_user_id.as_deref() == Some(user_id.as_str()) {
            debug!(user_id = %user_id, "identity already bound");
            return Ok(());
        }

        self.deactivate().await;
        info!(user_id = %user_id, "binding live channel to identity");
        self.local_user_id = Some(user_id);

        let binding_id = self.allocate_binding_id();
        self.channel_binding = Some(LiveBinding::attach(
            &self.context.channel,
            binding_id,
            BindingScope::Channel,
            self.feedback_tx.clone(),
        ));
        self.identity_announced = false;
        self.set_connected(self.context.channel.is_connected());
        self.announce_identity().await;
        Ok(())
    }

    async fn handle_open_conversation(&mut self, peer_user_id: String) -> Result<(), SessionError> {
        let local_user_id = self.require_user()?.to_owned();
        let peer_user_id = peer_user_id.trim().to_owned();
        if peer_user_id.is_empty() || peer_user_id == local_user_id {
            return Err(SessionError::InvalidPeer(peer_user_id));
        }

        let conversation = ConversationId::new(local_user_id, peer_user_id);
        if let Some(active) = &self.active
            && active.conversation() == &conversation
        {
            debug!(conversation = %conversation, "conversation already active");
            return Ok(());
        }

        self.deactivate().await;

        let activation = self.allocate_binding_id();
        let binding = LiveBinding::attach(
            &self.context.channel,
            activation,
            BindingScope::Conversation(conversation.clone()),
            self.feedback_tx.clone(),
        );
        info!(conversation = %conversation, activation, "conversation activated");
        self.active = Some(ActiveConversation {
            timeline: TimelineState::new(conversation, self.config.timeline_max_items),
            local_typing: LocalTyping::new(self.config.typing_debounce),
            peer_typing: PeerTyping::new(self.config.typing_timeout),
            binding,
            load: None,
        });
        self.start_load()
    }

    /// Begin a history load for the active conversation (initial or retry).
    fn start_load(&mut self) -> Result<(), SessionError> {
        let now_ms = self.context.clock.now_ms();
        let active = self
            .active
            .as_mut()
            .ok_or(SessionError::NoActiveConversation)?;
        let generation = active.timeline.begin_load(now_ms)?;
        let activation = active.activation();
        let conversation = active.conversation().clone();

        let history = Arc::clone(&self.context.history);
        let tx = self.feedback_tx.clone();
        let load_conversation = conversation.clone();
        active.load = Some(RunningLoad(tokio::spawn(async move {
            let result = history.load(&load_conversation).await;
            let _ = tx.send(Feedback::LoadFinished {
                activation,
                generation,
                result,
            });
        })));

        self.last_error_code = None;
        self.emit(SessionEvent::TimelineStatus {
            conversation,
            status: LoadStatus::Loading,
        });
        Ok(())
    }

    async fn handle_send_text(&mut self, text: String) -> Result<Message, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        self.require_user()?;
        let now_ms = self.context.clock.now_ms();

        let active = self
            .active
            .as_mut()
            .ok_or(SessionError::NoActiveConversation)?;
        let (index, message) = active.timeline.append_local_echo(text, now_ms)?;
        let conversation = active.conversation().clone();
        let typing = active.local_typing.finish();
        let client_txn_id = message.client_txn_id.clone().unwrap_or_default();
        debug!(
            conversation = %conversation,
            client_txn_id = %client_txn_id,
            index,
            "local echo appended"
        );

        self.emit(SessionEvent::TimelineAppended {
            conversation: conversation.clone(),
            index,
            message: message.clone(),
        });
        self.emit_live(OutboundEvent::SendMessage {
            to: conversation.peer_user_id.clone(),
            from: conversation.local_user_id.clone(),
            text: text.to_owned(),
        })
        .await;
        if let Some(signal) = typing {
            self.announce_local_typing(&conversation, signal).await;
        }

        self.spawn_write(conversation, client_txn_id, text.to_owned());
        Ok(message)
    }

    fn spawn_write(&self, conversation: ConversationId, client_txn_id: String, text: String) {
        let history = Arc::clone(&self.context.history);
        let tx = self.feedback_tx.clone();
        tokio::spawn(async move {
            let outcome = match history.persist(&conversation, &text).await {
                Ok(ack) => WriteOutcome::Success {
                    message_id: ack.message_id,
                },
                Err(error) => WriteOutcome::Failure { error },
            };
            let _ = tx.send(Feedback::WriteFinished {
                conversation,
                client_txn_id,
                outcome,
            });
        });
    }

    async fn handle_keystroke(&mut self) -> Result<(), SessionError> {
        self.require_user()?;
        let active = self
            .active
            .as_mut()
            .ok_or(SessionError::NoActiveConversation)?;
        let activation = active.activation();
        let signal = active
            .local_typing
            .on_keystroke(&self.feedback_tx, move |generation| {
                Feedback::LocalTypingElapsed {
                    activation,
                    generation,
                }
            });
        let conversation = active.conversation().clone();

        if let Some(signal) = signal {
            self.announce_local_typing(&conversation, signal).await;
        }
        Ok(())
    }

    async fn handle_feedback(&mut self, feedback: Feedback) {
        match feedback {
            Feedback::Live(bound) => self.handle_live(bound).await,
            Feedback::LoadFinished {
                activation,
                generation,
                result,
            } => self.handle_load_finished(activation, generation, result),
            Feedback::WriteFinished {
                conversation,
                client_txn_id,
                outcome,
            } => self.handle_write_finished(conversation, client_txn_id, outcome),
            Feedback::LocalTypingElapsed {
                activation,
                generation,
            } => {
                let Some(active) = self.active_for(activation) else {
                    return;
                };
                if let Some(signal) = active.local_typing.on_debounce_elapsed(generation) {
                    let conversation = active.conversation().clone();
                    self.announce_local_typing(&conversation, signal).await;
                }
            }
            Feedback::PeerTypingElapsed {
                activation,
                generation,
            } => {
                let Some(active) = self.active_for(activation) else {
                    return;
                };
                if active.peer_typing.on_timeout(generation) {
                    let conversation = active.conversation().clone();
                    debug!(conversation = %conversation, "peer typing decayed");
                    self.emit(SessionEvent::PeerTyping {
                        conversation,
                        is_typing: false,
                    });
                }
            }
        }
    }

    async fn handle_live(&mut self, bound: BoundEvent) {
        let BoundEvent { binding, event } = bound;
        if self
            .channel_binding
            .as_ref()
            .is_some_and(|channel| channel.id() == binding)
        {
            self.handle_channel_event(event).await;
            return;
        }

        let now_ms = self.context.clock.now_ms();
        let tx = self.feedback_tx.clone();
        let Some(active) = self.active_for(binding) else {
            return;
        };
        let conversation = active.conversation().clone();

        match event {
            LiveEvent::MessageReceived {
                text, sent_at_ms, ..
            } => match active.timeline.append_remote(text, sent_at_ms, now_ms) {
                RemoteAppend::Inserted { index, message } => {
                    self.emit(SessionEvent::TimelineAppended {
                        conversation,
                        index,
                        message,
                    });
                }
                RemoteAppend::Queued => {
                    trace!(conversation = %conversation, "live message queued until load completes");
                }
                RemoteAppend::Duplicate => {
                    debug!(conversation = %conversation, "duplicate live message ignored");
                }
                RemoteAppend::Evicted => {
                    debug!(
                        conversation = %conversation,
                        sent_at_ms = ?sent_at_ms,
                        "live message older than retained timeline; evicted"
                    );
                }
                RemoteAppend::Dropped => {
                    debug!(conversation = %conversation, "live message dropped; timeline not loaded");
                }
            },
            LiveEvent::TypingStarted { .. } => {
                let changed = active.peer_typing.on_start(now_ms, &tx, move |generation| {
                    Feedback::PeerTypingElapsed {
                        activation: binding,
                        generation,
                    }
                });
                if changed {
                    self.emit(SessionEvent::PeerTyping {
                        conversation,
                        is_typing: true,
                    });
                }
            }
            LiveEvent::TypingStopped { .. } => {
                if active.peer_typing.on_stop(now_ms) {
                    self.emit(SessionEvent::PeerTyping {
                        conversation,
                        is_typing: false,
                    });
                }
            }
            LiveEvent::Connected | LiveEvent::Disconnected { .. } => {}
        }
    }

    async fn handle_channel_event(&mut self, event: LiveEvent) {
        match event {
            LiveEvent::Connected => {
                info!("live channel connected");
                self.identity_announced = false;
                self.set_connected(true);
                self.announce_identity().await;
            }
            LiveEvent::Disconnected { reason } => {
                warn!(
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "live channel disconnected"
                );
                self.identity_announced = false;
                self.set_connected(false);
            }
            other => trace!(kind = other.kind(), "ignoring non-lifecycle event on channel binding"),
        }
    }

    fn handle_load_finished(
        &mut self,
        activation: u64,
        generation: u64,
        result: Result<Vec<Message>, LoadError>,
    ) {
        let Some(active) = self.active_for(activation) else {
            return;
        };
        if !active.timeline.is_current_load(generation) {
            trace!(activation, generation, "ignoring stale load result");
            return;
        }
        active.load = None;
        let conversation = active.conversation().clone();

        match result {
            Ok(history) => {
                let Some(completion) = active.timeline.complete_load(generation, history) else {
                    return;
                };
                let messages = active.timeline.messages().to_vec();
                info!(
                    conversation = %conversation,
                    history = completion.history_len,
                    replayed = completion.replayed,
                    "conversation ready"
                );
                self.last_error_code = None;
                self.emit(SessionEvent::TimelineStatus {
                    conversation: conversation.clone(),
                    status: LoadStatus::Ready,
                });
                self.emit(SessionEvent::TimelineSnapshot {
                    conversation,
                    messages,
                });
            }
            Err(error) => {
                if !active.timeline.fail_load(generation, error.clone()) {
                    return;
                }
                self.last_error_code = Some(error.code().to_owned());
                self.emit(SessionEvent::TimelineStatus {
                    conversation: conversation.clone(),
                    status: LoadStatus::Failed,
                });
                self.emit(normalize_load_failure(conversation, &error));
            }
        }
    }

    fn handle_write_finished(
        &mut self,
        conversation: ConversationId,
        client_txn_id: String,
        outcome: WriteOutcome,
    ) {
        if let WriteOutcome::Success {
            message_id: Some(message_id),
        } = &outcome
            && let Some(active) = self.active.as_mut()
            && active.conversation() == &conversation
        {
            match active.timeline.acknowledge(&client_txn_id, message_id) {
                Ok(ack) => {
                    debug!(client_txn_id = %client_txn_id, message_id = %message_id, ?ack, "local echo acknowledged");
                    self.emit(SessionEvent::MessageAcknowledged {
                        conversation: conversation.clone(),
                        client_txn_id: client_txn_id.clone(),
                        message_id: message_id.clone(),
                    });
                }
                Err(err) => debug!(error = %err, "write acknowledged after echo left the timeline"),
            }
        }

        if let WriteOutcome::Failure { error } = &outcome {
            warn!(
                conversation = %conversation,
                client_txn_id = %client_txn_id,
                error = %error,
                "message write failed; local echo kept"
            );
            self.emit(SessionEvent::Notification {
                code: error.code().to_owned(),
                message: error.to_string(),
            });
        }

        self.emit(normalize_write_outcome(client_txn_id, conversation, outcome));
    }

    async fn announce_identity(&mut self) {
        if self.identity_announced || !self.channel_connected {
            return;
        }
        let Some(user_id) = self.local_user_id.clone() else {
            return;
        };

        match self
            .context
            .channel
            .emit(OutboundEvent::AnnounceIdentity {
                user_id: user_id.clone(),
            })
            .await
        {
            Ok(()) => {
                self.identity_announced = true;
                info!(user_id = %user_id, "identity announced");
                self.emit(SessionEvent::IdentityAnnounced { user_id });
            }
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "identity announce failed");
                self.emit(normalize_channel_error("add-user", &err));
            }
        }
    }

    async fn announce_local_typing(&mut self, conversation: &ConversationId, signal: TypingSignal) {
        let to = conversation.peer_user_id.clone();
        let from = conversation.local_user_id.clone();
        let (event, is_typing) = match signal {
            TypingSignal::Start => (OutboundEvent::TypingStart { to, from }, true),
            TypingSignal::Stop => (OutboundEvent::TypingStop { to, from }, false),
        };
        self.emit_live(event).await;
        self.emit(SessionEvent::LocalTyping {
            conversation: conversation.clone(),
            is_typing,
        });
    }

    /// Best-effort live emit; failures become notifications.
    async fn emit_live(&self, event: OutboundEvent) {
        let name = event.name();
        if let Err(err) = self.context.channel.emit(event).await {
            warn!(event = name, error = %err, "live emit failed");
            self.emit(normalize_channel_error(name, &err));
        }
    }

    async fn deactivate(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        let conversation = active.conversation().clone();
        if let Some(signal) = active.local_typing.finish() {
            self.announce_local_typing(&conversation, signal).await;
        }
        info!(conversation = %conversation, "conversation deactivated");
    }

    async fn teardown(mut self) {
        self.deactivate().await;
        self.channel_binding = None;
        self.identity_announced = false;
        info!("session ended");
        self.emit(SessionEvent::SessionEnded);
    }

    fn snapshot(&self) -> SessionSnapshot {
        let mut snapshot = SessionSnapshot {
            local_user_id: self.local_user_id.clone(),
            channel_connected: self.channel_connected,
            last_error_code: self.last_error_code.clone(),
            ..SessionSnapshot::default()
        };
        if let Some(active) = &self.active {
            snapshot.conversation = Some(active.conversation().clone());
            snapshot.load_status = active.timeline.status();
            snapshot.messages = active.timeline.messages().to_vec();
            snapshot.is_peer_typing = active.peer_typing.is_peer_typing();
            snapshot.is_local_typing = active.local_typing.is_typing();
        }
        snapshot
    }

    fn active_for(&mut self, activation: u64) -> Option<&mut ActiveConversation> {
        let active = self
            .active
            .as_mut()
            .filter(|active| active.activation() == activation);
        if active.is_none() {
            trace!(activation, "ignoring feedback for inactive conversation");
        }
        active
    }

    fn require_user(&self) -> Result<&str, SessionError> {
        self.local_user_id
            .as_deref()
            .ok_or(SessionError::NotAuthenticated)
    }

    fn set_connected(&mut self, connected: bool) {
        if self.channel_connected != connected {
            self.channel_connected = connected;
            self.emit(SessionEvent::ChannelStatus { connected });
        }
    }

    fn allocate_binding_id(&mut self) -> u64 {
        self.next_binding_id = self.next_binding_id.wrapping_add(1);
        self.next_binding_id
    }

    fn reject(&self, err: SessionError) {
        warn!(code = err.code(), error = %err, "command rejected");
        self.emit(SessionEvent::CommandRejected {
            code: err.code().to_owned(),
            message: err.to_string(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
