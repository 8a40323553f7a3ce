//! WebSocket support (RFC 6455).
//!
//! - **`handshake`**: validates upgrade requests and builds the 101 response
//! - **`frame`**: frame codec and message reassembly
//! - **`connection`**: the handle handlers use to send frames
//! - **`handler`**: the callback trait
//! - **`dispatcher`**: the I/O loop a connection switches to after the upgrade
//!
//! # Connection State Machine
//!
//! ```text
//!   Unupgraded ──upgrade──▶ Handshaking ──101 flushed──▶ Open
//!                                                         │
//!                       peer close: echo, then Closed ◀───┤
//!                                                         │ close()
//!                                                         ▼
//!                                    Closed ◀──peer close / 5s── Closing
//! ```

pub mod connection;
pub(crate) mod dispatcher;
pub mod frame;
pub mod handler;
pub mod handshake;

use bytes::Bytes;

pub use connection::{SendError, WebSocketConnection};
pub use handler::{SharedWebSocketHandler, WebSocketHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketState {
    Unupgraded,
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// Everything the I/O task needs to switch a connection to framed mode.
pub(crate) struct WebSocketUpgrade {
    pub head: Bytes,
    pub connection: WebSocketConnection,
    pub handler: SharedWebSocketHandler,
}
