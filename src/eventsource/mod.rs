//! Server-Sent Events (`text/event-stream`).
//!
//! An upgraded request gets a bodyless 200 head, after which every
//! [`EventSourceMessage`] sent on the connection is written straight to the
//! socket. There is no closing handshake: `Unupgraded → Streaming → Closed`.

pub mod connection;
pub mod handler;
pub mod message;
pub(crate) mod stream;

use bytes::Bytes;

pub use connection::EventSourceConnection;
pub use handler::{EventSourceHandler, SharedEventSourceHandler};
pub use message::EventSourceMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSourceState {
    Unupgraded,
    Streaming,
    Closed,
}

pub(crate) struct EventSourceUpgrade {
    pub head: Bytes,
    pub connection: EventSourceConnection,
    pub handler: SharedEventSourceHandler,
}
