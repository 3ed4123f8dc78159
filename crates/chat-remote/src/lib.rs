//! Network adapters for the chat session runtime.
//!
//! - [`HttpHistoryStore`] reads and writes conversation history over the
//!   server's REST message routes.
//! - [`WsLiveChannel`] carries live events over a WebSocket, reconnecting
//!   with backoff and reporting connect/disconnect as [`chat_core::LiveEvent`]s.
//! - [`wire`] is the JSON frame codec shared by the live transport.

pub mod error;
pub mod http;
pub mod wire;
pub mod ws;

pub use error::{RemoteConfigError, WireError};
pub use http::HttpHistoryStore;
pub use ws::{WsConfig, WsLiveChannel, ws_url_for};
