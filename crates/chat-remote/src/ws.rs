//! WebSocket-backed [`LiveChannel`] with automatic reconnect.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chat_core::{ChannelError, LiveChannel, LiveEvent, OutboundEvent, RetryPolicy};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{error::RemoteConfigError, http::parse_base_url, wire};

const DEFAULT_OUTBOUND_BUFFER: usize = 64;
const DEFAULT_EVENT_BUFFER: usize = 256;
const LIVE_PATH: &str = "ws";

/// Derive the live endpoint from a server url.
///
/// `http://host/` becomes `ws://host/ws`; an explicit `ws://` url is used
/// unchanged. TLS endpoints are rejected because the transport is built
/// without a TLS connector.
pub fn ws_url_for(server_url: &str) -> Result<Url, RemoteConfigError> {
    let invalid = |reason: String| RemoteConfigError::InvalidUrl {
        url: server_url.to_owned(),
        reason,
    };
    let parsed = Url::parse(server_url.trim()).map_err(|err| invalid(err.to_string()))?;
    match parsed.scheme() {
        "ws" => Ok(parsed),
        "http" => {
            let mut base = parse_base_url(server_url)?;
            base.set_scheme("ws")
                .map_err(|()| invalid("cannot switch scheme to ws".to_owned()))?;
            base.join(LIVE_PATH).map_err(|err| invalid(err.to_string()))
        }
        other => Err(RemoteConfigError::UnsupportedScheme(other.to_owned())),
    }
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: Url,
    pub retry: RetryPolicy,
    /// Outbound frames queued while a send is in flight.
    pub outbound_buffer: usize,
    /// Inbound events kept for slow subscribers before they lag.
    pub event_buffer: usize,
}

impl WsConfig {
    pub fn new(server_url: &str) -> Result<Self, RemoteConfigError> {
        Ok(Self {
            url: ws_url_for(server_url)?,
            retry: RetryPolicy::default(),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            event_buffer: DEFAULT_EVENT_BUFFER,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

struct Shared {
    events: broadcast::Sender<LiveEvent>,
    connected: AtomicBool,
    discarded: AtomicU64,
}

impl Shared {
    fn new(events: broadcast::Sender<LiveEvent>) -> Self {
        Self {
            events,
            connected: AtomicBool::new(false),
            discarded: AtomicU64::new(0),
        }
    }

    fn publish(&self, event: LiveEvent) {
        trace!(kind = event.kind(), "live event");
        let _ = self.events.send(event);
    }

    /// Drop frames accepted by `emit` but never written; returns how many.
    fn discard_queued(&self, outbound_rx: &mut mpsc::Receiver<OutboundEvent>) -> u64 {
        let mut discarded = 0_u64;
        while let Ok(event) = outbound_rx.try_recv() {
            trace!(event = event.name(), "discarding unsent frame");
            discarded += 1;
        }
        if discarded > 0 {
            self.discarded.fetch_add(discarded, Ordering::SeqCst);
            warn!(discarded, "dropped outbound frames queued at disconnect");
        }
        discarded
    }
}

/// Live channel over a single WebSocket connection, re-established with
/// backoff whenever it drops. Dropping the channel stops the connection loop.
pub struct WsLiveChannel {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<OutboundEvent>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl WsLiveChannel {
    /// Start the connection loop. Must be called from within a tokio runtime.
    pub fn spawn(config: WsConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_buffer.max(1));
        let shared = Arc::new(Shared::new(events));
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_connection_loop(
            config,
            Arc::clone(&shared),
            outbound_rx,
            stop.child_token(),
        ));
        Self {
            shared,
            outbound,
            stop,
            task,
        }
    }
}

impl WsLiveChannel {
    /// Frames that `emit` accepted but the connection dropped before writing.
    pub fn discarded_frames(&self) -> u64 {
        self.shared.discarded.load(Ordering::SeqCst)
    }
}

impl Drop for WsLiveChannel {
    fn drop(&mut self) {
        self.stop.cancel();
        self.task.abort();
    }
}

#[async_trait]
impl LiveChannel for WsLiveChannel {
    /// `Ok` means the frame was queued for the current connection. Frames
    /// still queued when that connection drops are discarded and counted in
    /// [`WsLiveChannel::discarded_frames`].
    async fn emit(&self, event: OutboundEvent) -> Result<(), ChannelError> {
        if self.task.is_finished() {
            return Err(ChannelError::Closed);
        }
        if !self.is_connected() {
            return Err(ChannelError::Disconnected);
        }
        self.outbound
            .send(event)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.shared.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

enum PumpExit {
    Stopped,
    Dropped(Option<String>),
}

async fn run_connection_loop(
    config: WsConfig,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::Receiver<OutboundEvent>,
    stop: CancellationToken,
) {
    let mut backoff = config.retry.backoff();
    loop {
        let attempt = tokio::select! {
            _ = stop.cancelled() => break,
            attempt = connect_async(config.url.as_str()) => attempt,
        };

        match attempt {
            Ok((stream, _response)) => {
                backoff.reset();
                shared.connected.store(true, Ordering::SeqCst);
                info!(url = %config.url, "live channel connected");
                shared.publish(LiveEvent::Connected);

                let exit = pump(stream, &mut outbound_rx, &shared, &stop).await;

                shared.connected.store(false, Ordering::SeqCst);
                shared.discard_queued(&mut outbound_rx);

                match exit {
                    PumpExit::Stopped => {
                        shared.publish(LiveEvent::Disconnected {
                            reason: Some("channel closed".to_owned()),
                        });
                        break;
                    }
                    PumpExit::Dropped(reason) => {
                        warn!(reason = ?reason, "live channel dropped");
                        shared.publish(LiveEvent::Disconnected { reason });
                    }
                }
            }
            Err(err) => {
                warn!(url = %config.url, attempt = backoff.attempt(), error = %err, "live channel connect failed");
            }
        }

        let delay: Duration = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "scheduling live reconnect");
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("live connection loop stopped");
}

async fn pump<S>(
    stream: WebSocketStream<S>,
    outbound_rx: &mut mpsc::Receiver<OutboundEvent>,
    shared: &Shared,
    stop: &CancellationToken,
) -> PumpExit
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return PumpExit::Stopped;
            }
            outbound = outbound_rx.recv() => {
                let Some(event) = outbound else {
                    let _ = sink.send(Message::Close(None)).await;
                    return PumpExit::Stopped;
                };
                match wire::encode(&event) {
                    Ok(frame) => {
                        if let Err(err) = sink.send(Message::Text(frame.into())).await {
                            return PumpExit::Dropped(Some(err.to_string()));
                        }
                    }
                    Err(err) => warn!(event = event.name(), error = %err, "skipping unencodable frame"),
                }
            }
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => match wire::decode(text.as_str()) {
                    Ok(Some(event)) => shared.publish(event),
                    Ok(None) => trace!("ignoring unknown live event"),
                    Err(err) => warn!(error = %err, "dropping malformed live frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|frame| frame.reason.as_str().to_owned())
                        .filter(|reason| !reason.is_empty());
                    return PumpExit::Dropped(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return PumpExit::Dropped(Some(err.to_string())),
                None => return PumpExit::Dropped(None),
            }
        }
    }
}
