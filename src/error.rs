//! Error types and failure context.
//!
//! Failures fall into four groups:
//!
//! - application errors raised by handler code, turned into a 500/413 response
//!   and reported to the application sink;
//! - transport errors (disconnects, malformed input, oversized frames), which
//!   close the connection and go to the transport sink;
//! - contract violations (double termination, double upgrade, abandoned
//!   responses), which are logged loudly and returned as `Err`;
//! - handshake rejections, answered on the wire without any sink.

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

use crate::http::parser::ParseError;
use crate::websocket::frame::FrameError;
use crate::websocket::handshake::HandshakeError;

/// Which protocol a connection was speaking when a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Http,
    WebSocket,
    EventSource,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Http => f.write_str("http"),
            ConnectionKind::WebSocket => f.write_str("websocket"),
            ConnectionKind::EventSource => f.write_str("eventsource"),
        }
    }
}

/// Identifies the connection (and request, when known) a failure belongs to.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub remote_addr: SocketAddr,
    pub connection_id: u64,
    /// `METHOD uri` of the request being handled, if any.
    pub request: Option<String>,
    pub kind: ConnectionKind,
}

impl ErrorContext {
    pub fn new(remote_addr: SocketAddr, connection_id: u64, kind: ConnectionKind) -> Self {
        Self {
            remote_addr,
            connection_id,
            request: None,
            kind,
        }
    }

    pub fn with_request(mut self, summary: impl Into<String>) -> Self {
        self.request = Some(summary.into());
        self
    }

    pub fn with_kind(mut self, kind: ConnectionKind) -> Self {
        self.kind = kind;
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{} ({})", self.remote_addr, self.connection_id, self.kind)?;
        if let Some(request) = &self.request {
            write!(f, " {}", request)?;
        }
        Ok(())
    }
}

/// Raised when a request or message exceeds a configured size limit.
///
/// `HttpResponse::error` maps this to `413 Payload Too Large` instead of 500.
#[derive(Debug, Error)]
#[error("{what} exceeds limit of {limit} bytes")]
pub struct PayloadTooLarge {
    pub what: &'static str,
    pub limit: usize,
}

/// Misuse of the response API.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("response already ended")]
    AlreadyEnded,
    #[error("response belongs to an upgraded connection")]
    Upgraded,
    #[error("connection closed before the response could be written")]
    TransportClosed,
}

/// Failure of `Control::upgrade_to_websocket` / `upgrade_to_event_source`.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("connection already upgraded")]
    AlreadyUpgraded,
    #[error("response already ended, cannot upgrade")]
    ResponseEnded,
    #[error("websocket handshake rejected: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("connection closed before the upgrade could be written")]
    TransportClosed,
}

/// Programming errors in handler composition.
#[derive(Debug, Error)]
pub enum ContractViolation {
    #[error("handler chain dropped the response without end(), error() or an upgrade")]
    ResponseNotEnded,
    #[error("handler panicked: {0}")]
    Panic(String),
}

/// Failures reading from or writing to the network stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed request: {0:?}")]
    Parse(ParseError),
    #[error(transparent)]
    TooLarge(#[from] PayloadTooLarge),
    #[error("websocket framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("peer closed the connection without a close handshake")]
    UnexpectedEof,
    #[error("connection idle for longer than {0:?}")]
    Stale(std::time::Duration),
}

impl From<ParseError> for TransportError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::TooLarge { what, limit } => {
                TransportError::TooLarge(PayloadTooLarge { what, limit })
            }
            other => TransportError::Parse(other),
        }
    }
}

/// Renders a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
