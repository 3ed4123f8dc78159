use chat_core::{Message, SessionCommand, SessionError, SessionEvent, SessionSnapshot};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Broadcast event stream handed to session subscribers.
pub type EventStream = broadcast::Receiver<SessionEvent>;

/// Request accepted by the session runtime.
#[derive(Debug)]
pub(crate) enum SessionRequest {
    Command(SessionCommand),
    /// Send and reply once the local echo is in the timeline.
    SendText {
        text: String,
        reply: oneshot::Sender<Result<Message, SessionError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Request/event channel pair shared by session handles.
///
/// The runtime only keeps the event sender, so the request queue closes once
/// every handle is dropped.
#[derive(Clone, Debug)]
pub(crate) struct SessionChannels {
    request_tx: mpsc::Sender<SessionRequest>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionChannels {
    pub(crate) fn new(
        request_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<SessionRequest>) {
        let (request_tx, request_rx) = mpsc::channel(request_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                request_tx,
                event_tx,
            },
            request_rx,
        )
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<SessionEvent> {
        self.event_tx.clone()
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    pub(crate) async fn request(&self, request: SessionRequest) -> Result<(), SessionError> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_requests_to_receiver() {
        let (channels, mut rx) = SessionChannels::new(8, 8);
        channels
            .request(SessionRequest::Command(SessionCommand::Keystroke))
            .await
            .expect("request should enqueue");

        match rx.recv().await.expect("receiver should have a request") {
            SessionRequest::Command(SessionCommand::Keystroke) => {}
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reports_closed_runtime() {
        let (channels, rx) = SessionChannels::new(1, 1);
        drop(rx);
        let err = channels
            .request(SessionRequest::Command(SessionCommand::EndSession))
            .await
            .expect_err("closed receiver must fail");
        assert_eq!(err, SessionError::Closed);
    }

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let (channels, _rx) = SessionChannels::new(4, 16);
        let mut a = channels.subscribe();
        let mut b = channels.subscribe();

        let _ = channels
            .event_sender()
            .send(SessionEvent::ChannelStatus { connected: true });

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }
}
