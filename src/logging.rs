//! Access logging as ordinary handlers.
//!
//! [`LoggingHandler`] sits early in the chain and wraps the response so the
//! end of every request is recorded too. The WebSocket and EventSource
//! wrappers do the same for persistent connections. Where records go is up to
//! the [`LogSink`]; [`TracingLogSink`] emits `tracing` events.

use std::sync::Arc;

use crate::error::ResponseError;
use crate::eventsource::{
    EventSourceConnection, EventSourceHandler, SharedEventSourceHandler,
};
use crate::http::control::Control;
use crate::http::handler::HttpHandler;
use crate::http::request::Request;
use crate::http::response::{Charset, HttpResponse, SharedResponse};
use crate::persistent::PersistentConnection;
use crate::websocket::{SharedWebSocketHandler, WebSocketConnection, WebSocketHandler};

/// Something that happened on a WebSocket.
#[derive(Debug, Clone, Copy)]
pub enum WebSocketEvent<'a> {
    Open,
    Close,
    Text(&'a str),
    Binary(&'a [u8]),
    Ping(&'a [u8]),
    Pong(&'a [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSourceEvent {
    Open,
    Close,
}

pub trait LogSink: Send + Sync + 'static {
    fn http_start(&self, request: &Request);
    fn http_end(&self, request: &Request, status: u16);
    fn error(&self, request: &Request, error: &anyhow::Error);
    fn websocket(&self, connection: &WebSocketConnection, event: WebSocketEvent<'_>);
    fn event_source(&self, connection: &EventSourceConnection, event: EventSourceEvent);
}

pub type SharedLogSink = Arc<dyn LogSink>;

/// Writes every record as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn http_start(&self, request: &Request) {
        tracing::info!(
            peer = %request.remote_addr(),
            id = request.id(),
            method = %request.method(),
            uri = request.uri(),
            "http_start"
        );
    }

    fn http_end(&self, request: &Request, status: u16) {
        let elapsed = request.timestamp().elapsed().unwrap_or_default();
        tracing::info!(
            peer = %request.remote_addr(),
            id = request.id(),
            status,
            elapsed_ms = elapsed.as_millis() as u64,
            "http_end"
        );
    }

    fn error(&self, request: &Request, error: &anyhow::Error) {
        tracing::error!(
            peer = %request.remote_addr(),
            id = request.id(),
            error = %format!("{:#}", error),
            "http_error"
        );
    }

    fn websocket(&self, connection: &WebSocketConnection, event: WebSocketEvent<'_>) {
        let peer = connection.remote_addr();
        let id = connection.request().id();
        match event {
            WebSocketEvent::Open => tracing::info!(%peer, id, "websocket_open"),
            WebSocketEvent::Close => tracing::info!(%peer, id, "websocket_close"),
            WebSocketEvent::Text(text) => {
                tracing::debug!(%peer, id, len = text.len(), "websocket_text")
            }
            WebSocketEvent::Binary(data) => {
                tracing::debug!(%peer, id, len = data.len(), "websocket_binary")
            }
            WebSocketEvent::Ping(data) => {
                tracing::debug!(%peer, id, len = data.len(), "websocket_ping")
            }
            WebSocketEvent::Pong(data) => {
                tracing::debug!(%peer, id, len = data.len(), "websocket_pong")
            }
        }
    }

    fn event_source(&self, connection: &EventSourceConnection, event: EventSourceEvent) {
        let peer = connection.remote_addr();
        let id = connection.request().id();
        match event {
            EventSourceEvent::Open => tracing::info!(%peer, id, "eventsource_open"),
            EventSourceEvent::Close => tracing::info!(%peer, id, "eventsource_close"),
        }
    }
}

/// Records the start of each request and wraps the response to record its end.
pub struct LoggingHandler {
    sink: SharedLogSink,
}

impl LoggingHandler {
    pub fn new(sink: SharedLogSink) -> Self {
        Self { sink }
    }
}

impl HttpHandler for LoggingHandler {
    fn handle(
        &self,
        request: Request,
        response: SharedResponse,
        control: Control,
    ) -> anyhow::Result<()> {
        self.sink.http_start(&request);
        let logged = Arc::new(LoggingResponse {
            inner: response,
            request: request.clone(),
            sink: self.sink.clone(),
        });
        control.next_handler_with(request, logged);
        Ok(())
    }
}

/// Response decorator that reports `end()` and `error()` to a [`LogSink`].
pub struct LoggingResponse {
    inner: SharedResponse,
    request: Request,
    sink: SharedLogSink,
}

impl LoggingResponse {
    pub fn new(inner: SharedResponse, request: Request, sink: SharedLogSink) -> Self {
        Self {
            inner,
            request,
            sink,
        }
    }
}

impl HttpResponse for LoggingResponse {
    fn set_status(&self, status: u16) -> &dyn HttpResponse {
        self.inner.set_status(status);
        self
    }

    fn status(&self) -> u16 {
        self.inner.status()
    }

    fn header(&self, name: &str, value: &str) -> &dyn HttpResponse {
        self.inner.header(name, value);
        self
    }

    fn set_header(&self, name: &str, value: &str) -> &dyn HttpResponse {
        self.inner.set_header(name, value);
        self
    }

    fn remove_header(&self, name: &str) -> &dyn HttpResponse {
        self.inner.remove_header(name);
        self
    }

    fn header_value(&self, name: &str) -> Option<String> {
        self.inner.header_value(name)
    }

    fn contains_header(&self, name: &str) -> bool {
        self.inner.contains_header(name)
    }

    fn set_charset(&self, charset: Charset) -> &dyn HttpResponse {
        self.inner.set_charset(charset);
        self
    }

    fn charset(&self) -> Charset {
        self.inner.charset()
    }

    fn content(&self, bytes: &[u8]) -> &dyn HttpResponse {
        self.inner.content(bytes);
        self
    }

    fn content_str(&self, text: &str) -> &dyn HttpResponse {
        self.inner.content_str(text);
        self
    }

    fn end(&self) -> Result<(), ResponseError> {
        self.inner.end()?;
        self.sink.http_end(&self.request, self.inner.status());
        Ok(())
    }

    fn error(&self, error: anyhow::Error) -> Result<(), ResponseError> {
        self.sink.error(&self.request, &error);
        let result = self.inner.error(error);
        self.sink.http_end(&self.request, self.inner.status());
        result
    }

    fn is_sealed(&self) -> bool {
        self.inner.is_sealed()
    }
}

pub struct LoggingWebSocketHandler {
    inner: SharedWebSocketHandler,
    sink: SharedLogSink,
}

impl LoggingWebSocketHandler {
    pub fn new(inner: SharedWebSocketHandler, sink: SharedLogSink) -> Self {
        Self { inner, sink }
    }
}

impl WebSocketHandler for LoggingWebSocketHandler {
    fn on_open(&self, connection: &WebSocketConnection) -> anyhow::Result<()> {
        self.sink.websocket(connection, WebSocketEvent::Open);
        self.inner.on_open(connection)
    }

    fn on_close(&self, connection: &WebSocketConnection) -> anyhow::Result<()> {
        self.sink.websocket(connection, WebSocketEvent::Close);
        self.inner.on_close(connection)
    }

    fn on_message(&self, connection: &WebSocketConnection, message: &str) -> anyhow::Result<()> {
        self.sink.websocket(connection, WebSocketEvent::Text(message));
        self.inner.on_message(connection, message)
    }

    fn on_binary(&self, connection: &WebSocketConnection, data: &[u8]) -> anyhow::Result<()> {
        self.sink.websocket(connection, WebSocketEvent::Binary(data));
        self.inner.on_binary(connection, data)
    }

    fn on_ping(&self, connection: &WebSocketConnection, payload: &[u8]) -> anyhow::Result<()> {
        self.sink.websocket(connection, WebSocketEvent::Ping(payload));
        self.inner.on_ping(connection, payload)
    }

    fn on_pong(&self, connection: &WebSocketConnection, payload: &[u8]) -> anyhow::Result<()> {
        self.sink.websocket(connection, WebSocketEvent::Pong(payload));
        self.inner.on_pong(connection, payload)
    }
}

pub struct LoggingEventSourceHandler {
    inner: SharedEventSourceHandler,
    sink: SharedLogSink,
}

impl LoggingEventSourceHandler {
    pub fn new(inner: SharedEventSourceHandler, sink: SharedLogSink) -> Self {
        Self { inner, sink }
    }
}

impl EventSourceHandler for LoggingEventSourceHandler {
    fn on_open(&self, connection: &EventSourceConnection) -> anyhow::Result<()> {
        self.sink.event_source(connection, EventSourceEvent::Open);
        self.inner.on_open(connection)
    }

    fn on_close(&self, connection: &EventSourceConnection) -> anyhow::Result<()> {
        self.sink.event_source(connection, EventSourceEvent::Close);
        self.inner.on_close(connection)
    }
}
