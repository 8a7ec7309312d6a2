//! In-flight exchange tracking
//!
//! While a tunnel client prepares a response, the server-side state for
//! the exchange lives here: plain HTTP requests in
//! [`request::PendingRequestStore`], WebSocket upgrades and their frame
//! streams in [`websocket::PendingWebSocketStore`].

pub mod request;
pub mod websocket;

pub use request::{PendingRequestStore, ResponseEvent};
pub use websocket::{PendingWebSocketStore, UpgradeOutcome, WsEvent};
