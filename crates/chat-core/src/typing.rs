//! Typing indicators: local debounce and peer decay.
//!
//! Both sides own exactly one cancellable timer. Arming a timer cancels the
//! previous one, and every arm carries a generation so an expiry that was
//! already queued when the timer got replaced is recognized as stale.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default quiet period after the last keystroke before local typing stops.
pub const DEFAULT_TYPING_DEBOUNCE: Duration = Duration::from_millis(1_000);
/// Default window after which a peer typing indicator decays on its own.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_millis(3_000);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TypingPhase {
    #[default]
    Idle,
    Typing,
}

/// Outbound typing transition to announce on the live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

#[derive(Debug)]
struct RunningTimer {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Single cancellable one-shot timer that reports expiry into an mpsc queue.
#[derive(Debug, Default)]
pub struct DecayTimer {
    running: Option<RunningTimer>,
    generation: u64,
}

impl DecayTimer {
    /// Arm the timer, replacing (and cancelling) any previous one.
    ///
    /// On expiry `on_fire(generation)` is sent through `tx`. Must be called
    /// from within a tokio runtime.
    pub fn arm<T, F>(&mut self, delay: Duration, tx: &mpsc::UnboundedSender<T>, on_fire: F) -> u64
    where
        T: Send + 'static,
        F: FnOnce(u64) -> T + Send + 'static,
    {
        self.cancel();
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;

        let deadline = Instant::now() + delay;
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let tx = tx.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = stop_child.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = tx.send(on_fire(generation));
                }
            }
        });

        self.running = Some(RunningTimer { stop, task });
        generation
    }

    pub fn cancel(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop.cancel();
            running.task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.running.is_some()
    }

    /// Accept an expiry report. `false` when it belongs to a replaced or
    /// cancelled arm.
    pub fn take_expiry(&mut self, generation: u64) -> bool {
        if self.running.is_some() && self.generation == generation {
            self.running = None;
            true
        } else {
            trace!(generation, current = self.generation, "ignoring stale timer expiry");
            false
        }
    }
}

impl Drop for DecayTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Local composer typing state with keystroke debounce.
#[derive(Debug)]
pub struct LocalTyping {
    phase: TypingPhase,
    debounce: Duration,
    timer: DecayTimer,
}

impl LocalTyping {
    pub fn new(debounce: Duration) -> Self {
        Self {
            phase: TypingPhase::Idle,
            debounce,
            timer: DecayTimer::default(),
        }
    }

    pub fn phase(&self) -> TypingPhase {
        self.phase
    }

    pub fn is_typing(&self) -> bool {
        self.phase == TypingPhase::Typing
    }

    /// Register a keystroke. Returns `Start` on the `Idle -> Typing` edge.
    pub fn on_keystroke<T, F>(
        &mut self,
        tx: &mpsc::UnboundedSender<T>,
        on_fire: F,
    ) -> Option<TypingSignal>
    where
        T: Send + 'static,
        F: FnOnce(u64) -> T + Send + 'static,
    {
        self.timer.arm(self.debounce, tx, on_fire);
        if self.phase == TypingPhase::Idle {
            self.phase = TypingPhase::Typing;
            return Some(TypingSignal::Start);
        }
        None
    }

    /// Handle a debounce expiry. Returns `Stop` on the `Typing -> Idle` edge.
    pub fn on_debounce_elapsed(&mut self, generation: u64) -> Option<TypingSignal> {
        if !self.timer.take_expiry(generation) {
            return None;
        }
        self.stop()
    }

    /// End typing immediately (message sent or conversation deactivated).
    pub fn finish(&mut self) -> Option<TypingSignal> {
        self.timer.cancel();
        self.stop()
    }

    fn stop(&mut self) -> Option<TypingSignal> {
        if self.phase == TypingPhase::Typing {
            self.phase = TypingPhase::Idle;
            return Some(TypingSignal::Stop);
        }
        None
    }
}

/// Peer typing indicator with decay.
///
/// A missing `typing-stop` cannot leave the indicator on forever: without a
/// refreshing `typing-start` it resets after `timeout`.
#[derive(Debug)]
pub struct PeerTyping {
    is_peer_typing: bool,
    last_signal_at_ms: Option<u64>,
    timeout: Duration,
    timer: DecayTimer,
}

impl PeerTyping {
    pub fn new(timeout: Duration) -> Self {
        Self {
            is_peer_typing: false,
            last_signal_at_ms: None,
            timeout,
            timer: DecayTimer::default(),
        }
    }

    pub fn is_peer_typing(&self) -> bool {
        self.is_peer_typing
    }

    pub fn last_signal_at_ms(&self) -> Option<u64> {
        self.last_signal_at_ms
    }

    /// Handle `typing-start`. Returns `true` when the indicator changed.
    pub fn on_start<T, F>(&mut self, now_ms: u64, tx: &mpsc::UnboundedSender<T>, on_fire: F) -> bool
    where
        T: Send + 'static,
        F: FnOnce(u64) -> T + Send + 'static,
    {
        self.last_signal_at_ms = Some(now_ms);
        self.timer.arm(self.timeout, tx, on_fire);
        let changed = !self.is_peer_typing;
        self.is_peer_typing = true;
        changed
    }

    /// Handle `typing-stop`. Returns `true` when the indicator changed.
    pub fn on_stop(&mut self, now_ms: u64) -> bool {
        self.last_signal_at_ms = Some(now_ms);
        self.timer.cancel();
        let changed = self.is_peer_typing;
        self.is_peer_typing = false;
        changed
    }

    /// Handle a decay expiry. Returns `true` when the indicator changed.
    pub fn on_timeout(&mut self, generation: u64) -> bool {
        if !self.timer.take_expiry(generation) {
            return false;
        }
        let changed = self.is_peer_typing;
        self.is_peer_typing = false;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advance_ms(ms: u64) -> impl std::future::Future<Output = ()> {
        tokio::time::advance(Duration::from_millis(ms))
    }

    #[tokio::test(start_paused = true)]
    async fn peer_typing_decays_without_stop_signal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut peer = PeerTyping::new(Duration::from_millis(2_000));

        assert!(peer.on_start(0, &tx, |generation| generation));
        assert_eq!(peer.last_signal_at_ms(), Some(0));

        advance_ms(500).await;
        tokio::task::yield_now().await;
        assert!(peer.is_peer_typing());
        assert!(rx.try_recv().is_err());

        advance_ms(1_600).await;
        let generation = rx.recv().await.expect("decay timer should fire");
        assert!(peer.on_timeout(generation));
        assert!(!peer.is_peer_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn peer_typing_refresh_extends_window() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut peer = PeerTyping::new(Duration::from_millis(2_000));

        peer.on_start(0, &tx, |generation| generation);
        advance_ms(1_500).await;
        assert!(!peer.on_start(1_500, &tx, |generation| generation));

        advance_ms(1_000).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "refreshed timer must not fire yet");
        // generation 1 belongs to the first, replaced arm
        assert!(!peer.on_timeout(1));
        assert!(peer.is_peer_typing());

        advance_ms(1_100).await;
        let generation = rx.recv().await.expect("refreshed timer fires");
        assert!(peer.on_timeout(generation));
        assert!(!peer.is_peer_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn peer_stop_cancels_decay_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let mut peer = PeerTyping::new(Duration::from_millis(2_000));

        peer.on_start(0, &tx, |generation| generation);
        assert!(peer.on_stop(100));
        assert!(!peer.on_stop(200));

        advance_ms(5_000).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn local_typing_debounces_keystroke_bursts() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut local = LocalTyping::new(Duration::from_millis(1_000));

        assert_eq!(
            local.on_keystroke(&tx, |generation| generation),
            Some(TypingSignal::Start)
        );
        for _ in 0..5 {
            advance_ms(400).await;
            assert_eq!(local.on_keystroke(&tx, |generation| generation), None);
        }
        assert!(local.is_typing());

        advance_ms(1_000).await;
        let generation = rx.recv().await.expect("debounce fires");
        assert_eq!(local.on_debounce_elapsed(generation), Some(TypingSignal::Stop));
        assert_eq!(local.phase(), TypingPhase::Idle);
        assert!(rx.try_recv().is_err(), "replaced timers never fire");
    }

    #[tokio::test(start_paused = true)]
    async fn finishing_local_typing_stops_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut local = LocalTyping::new(Duration::from_millis(1_000));

        local.on_keystroke(&tx, |generation| generation);
        assert_eq!(local.finish(), Some(TypingSignal::Stop));
        assert_eq!(local.finish(), None);

        advance_ms(2_000).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_owner_cancels_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut peer = PeerTyping::new(Duration::from_millis(100));
            peer.on_start(0, &tx, |generation| generation);
        }
        advance_ms(1_000).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
