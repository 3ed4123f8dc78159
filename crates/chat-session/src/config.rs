use std::time::Duration;

use chat_core::{DEFAULT_TYPING_DEBOUNCE, DEFAULT_TYPING_TIMEOUT};
use thiserror::Error;

pub const DEFAULT_TIMELINE_MAX_ITEMS: usize = 500;
const DEFAULT_REQUEST_BUFFER: usize = 128;
const DEFAULT_EVENT_BUFFER: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionConfigError {
    #[error(
        "typing timeout ({timeout_ms} ms) must exceed the typing debounce ({debounce_ms} ms)"
    )]
    TypingTimeoutTooShort { debounce_ms: u128, timeout_ms: u128 },
    #[error("timeline capacity must be at least 1")]
    ZeroTimelineCapacity,
}

/// Tunables for one session runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Quiet period after the last keystroke before local typing stops.
    pub typing_debounce: Duration,
    /// Peer typing decay window. Must exceed `typing_debounce`.
    pub typing_timeout: Duration,
    /// Messages retained per timeline; the oldest are dropped beyond this.
    pub timeline_max_items: usize,
    pub request_buffer: usize,
    pub event_buffer: usize,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionConfigError> {
        if self.typing_timeout <= self.typing_debounce {
            return Err(SessionConfigError::TypingTimeoutTooShort {
                debounce_ms: self.typing_debounce.as_millis(),
                timeout_ms: self.typing_timeout.as_millis(),
            });
        }
        if self.timeline_max_items == 0 {
            return Err(SessionConfigError::ZeroTimelineCapacity);
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            typing_debounce: DEFAULT_TYPING_DEBOUNCE,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            timeline_max_items: DEFAULT_TIMELINE_MAX_ITEMS,
            request_buffer: DEFAULT_REQUEST_BUFFER,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}
