use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;

use crate::http::connection::Outbound;
use crate::persistent::{ConnectionBase, ConnectionClosed, PersistentConnection};
use crate::websocket::WebSocketState;
use crate::websocket::frame::{Frame, FrameError, close_code};

/// Why a control frame was not queued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error(transparent)]
    Closed(#[from] ConnectionClosed),
    #[error("refusing to send invalid frame: {0}")]
    Invalid(#[from] FrameError),
}

/// Handle to an upgraded WebSocket connection.
///
/// Writes are queued to the connection's I/O task and go out in call order.
/// Frames sent before the handshake has flushed are held until it has.
#[derive(Clone)]
pub struct WebSocketConnection {
    base: ConnectionBase,
    version: String,
    state: Arc<Mutex<WebSocketState>>,
    close_fired: Arc<AtomicBool>,
}

impl WebSocketConnection {
    pub(crate) fn new(base: ConnectionBase, version: String) -> Self {
        Self {
            base,
            version,
            state: Arc::new(Mutex::new(WebSocketState::Handshaking)),
            close_fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Negotiated protocol version, e.g. `Sec-WebSocket-Version-13`.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn state(&self) -> WebSocketState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn send(&self, message: &str) -> Result<(), ConnectionClosed> {
        self.write(Frame::Text(message.to_string()))
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<(), ConnectionClosed> {
        self.write(Frame::Binary(Bytes::copy_from_slice(data)))
    }

    /// Payloads over 125 bytes are refused.
    pub fn ping(&self, payload: &[u8]) -> Result<(), SendError> {
        let frame = Frame::Ping(Bytes::copy_from_slice(payload));
        frame.validate()?;
        Ok(self.write(frame)?)
    }

    pub fn pong(&self, payload: &[u8]) -> Result<(), SendError> {
        let frame = Frame::Pong(Bytes::copy_from_slice(payload));
        frame.validate()?;
        Ok(self.write(frame)?)
    }

    /// Starts the closing handshake with the given status code. Codes that
    /// may not appear on the wire, such as 1005 and 1006, are refused.
    pub fn close_with(&self, code: u16, reason: &str) -> Result<(), SendError> {
        Frame::close(code, reason).validate()?;
        if !self.sendable() {
            return Err(ConnectionClosed.into());
        }
        Ok(self
            .base
            .send(Outbound::Close(Some((code, reason.to_string()))))?)
    }

    fn write(&self, frame: Frame) -> Result<(), ConnectionClosed> {
        if !self.sendable() {
            return Err(ConnectionClosed);
        }
        self.base.send(Outbound::Frame(frame))
    }

    fn sendable(&self) -> bool {
        matches!(
            self.state(),
            WebSocketState::Handshaking | WebSocketState::Open
        )
    }

    pub(crate) fn set_state(&self, state: WebSocketState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// True exactly once: for the caller that gets to fire `on_close`.
    pub(crate) fn claim_close(&self) -> bool {
        !self.close_fired.swap(true, Ordering::AcqRel)
    }
}

impl PersistentConnection for WebSocketConnection {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn close(&self) -> Result<(), ConnectionClosed> {
        if !self.sendable() {
            return Err(ConnectionClosed);
        }
        self.base
            .send(Outbound::Close(Some((close_code::NORMAL, String::new()))))
    }
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("peer", &self.base.remote_addr())
            .field("version", &self.version)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConnectionKind, ErrorContext};
    use crate::executor::HandlerExecutor;
    use crate::http::request::{Method, RequestBuilder};
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    fn open_connection() -> (WebSocketConnection, UnboundedReceiver<Outbound>) {
        let (tx, rx) = unbounded_channel();
        let request = RequestBuilder::new()
            .method(Method::GET)
            .uri("/ws")
            .build()
            .unwrap();
        let context = ErrorContext::new(request.remote_addr(), 1, ConnectionKind::WebSocket);
        let executor = HandlerExecutor::new("test-ws-conn").unwrap();
        let base = ConnectionBase::new(request, executor, tx, context);
        let connection = WebSocketConnection::new(base, "Sec-WebSocket-Version-13".into());
        connection.set_state(WebSocketState::Open);
        (connection, rx)
    }

    #[test]
    fn oversized_ping_and_pong_are_refused() {
        let (connection, mut rx) = open_connection();

        assert_eq!(
            connection.ping(&[7u8; 200]),
            Err(SendError::Invalid(FrameError::ControlTooLong(200)))
        );
        assert_eq!(
            connection.pong(&[7u8; 126]),
            Err(SendError::Invalid(FrameError::ControlTooLong(126)))
        );
        assert!(rx.try_recv().is_err());

        connection.ping(&[7u8; 125]).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(Frame::Ping(p))) if p.len() == 125));
    }

    #[test]
    fn close_with_refuses_reserved_codes() {
        let (connection, mut rx) = open_connection();

        for code in [0, 999, 1005, 1006] {
            assert_eq!(
                connection.close_with(code, ""),
                Err(SendError::Invalid(FrameError::InvalidCloseCode(code)))
            );
        }
        assert!(rx.try_recv().is_err());

        connection.close_with(4001, "done").unwrap();
        assert!(matches!(
            rx.try_recv(),
            Ok(Outbound::Close(Some((4001, reason)))) if reason == "done"
        ));
    }

    #[test]
    fn writes_fail_once_closed() {
        let (connection, _rx) = open_connection();
        connection.set_state(WebSocketState::Closed);
        assert_eq!(connection.send("late"), Err(ConnectionClosed));
        assert_eq!(connection.ping(b"x"), Err(SendError::Closed(ConnectionClosed)));
        assert_eq!(connection.close(), Err(ConnectionClosed));
    }
}
