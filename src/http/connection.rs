use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

use crate::error::{ConnectionKind, ContractViolation, ErrorContext, TransportError};
use crate::eventsource::{self, EventSourceUpgrade};
use crate::http::control::Control;
use crate::http::parser::{ParseError, parse_http_request_with};
use crate::http::request::{Method, Request};
use crate::http::response::{NativeResponse, Response};
use crate::http::writer::{ResponseWriter, serialize_response};
use crate::server::ServerContext;
use crate::websocket::frame::Frame;
use crate::websocket::{WebSocketUpgrade, dispatcher};

/// What the handler side hands to a connection's I/O task.
///
/// One channel per request. The response and, after an upgrade, every
/// connection handle hold senders; the I/O task owns the receiver.
pub(crate) enum Outbound {
    /// A complete serialized HTTP response.
    Response { bytes: Bytes, keep_alive: bool },
    WebSocket(WebSocketUpgrade),
    EventSource(EventSourceUpgrade),
    /// A WebSocket frame to write.
    Frame(Frame),
    /// A serialized event-stream message.
    Event(Bytes),
    /// Close the upgraded connection; WebSocket closes carry code and reason.
    Close(Option<(u16, String)>),
    /// Tear the connection down and report to the transport sink.
    Fault(anyhow::Error),
}

/// Connection lifecycle. Upgraded states own the request's outbound receiver
/// because the protocol loops keep reading from it.
pub(crate) enum ConnectionState {
    Reading,
    Processing(Request),
    Writing(ResponseWriter, bool), // bool = keep_alive?
    WebSocket(WebSocketUpgrade, UnboundedReceiver<Outbound>),
    EventSource(EventSourceUpgrade, UnboundedReceiver<Outbound>),
    Closed,
}

/// Drives one accepted TCP stream until it closes.
pub(crate) struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
    state: ConnectionState,
    server: Arc<ServerContext>,
    context: ErrorContext,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, server: Arc<ServerContext>) -> Self {
        let context = ErrorContext::new(peer, server.next_connection_id(), ConnectionKind::Http);
        Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
            state: ConnectionState::Reading,
            server,
            context,
        }
    }

    pub async fn run(&mut self) {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => match self.read_request().await {
                    Ok(Some(request)) => {
                        self.state = ConnectionState::Processing(request);
                    }
                    Ok(None) => {
                        self.state = ConnectionState::Closed;
                    }
                    Err(e) => {
                        self.reject(e).await;
                        self.state = ConnectionState::Closed;
                    }
                },

                ConnectionState::Processing(request) => {
                    self.state = self.process(request).await;
                }

                ConnectionState::Writing(mut writer, keep_alive) => {
                    match with_deadline(
                        self.server.stale_timeout,
                        writer.write_to_stream(&mut self.stream),
                    )
                    .await
                    {
                        Ok(Ok(())) if keep_alive => {
                            self.state = ConnectionState::Reading; // go back for next request
                        }
                        Ok(Ok(())) => {
                            self.state = ConnectionState::Closed;
                        }
                        Ok(Err(e)) => {
                            self.server.report_transport(&self.context, e.into());
                        }
                        Err(e) => {
                            self.server.report_transport(&self.context, e.into());
                        }
                    }
                }

                ConnectionState::WebSocket(upgrade, outbound) => {
                    let buffer = std::mem::take(&mut self.buffer);
                    dispatcher::run(&mut self.stream, buffer, outbound, upgrade, &self.server)
                        .await;
                }

                ConnectionState::EventSource(upgrade, outbound) => {
                    let buffer = std::mem::take(&mut self.buffer);
                    eventsource::stream::run(
                        &mut self.stream,
                        buffer,
                        outbound,
                        upgrade,
                        &self.server,
                    )
                    .await;
                }

                ConnectionState::Closed => {
                    let _ = self.stream.shutdown().await;
                    break;
                }
            }
        }

        tracing::debug!(
            peer = %self.context.remote_addr,
            connection = self.context.connection_id,
            "Connection closed"
        );
    }

    /// Reads until one whole request is buffered. `Ok(None)` is a clean close
    /// between requests.
    async fn read_request(&mut self) -> Result<Option<Request>, TransportError> {
        loop {
            // Try parsing whatever we already have
            match parse_http_request_with(&self.buffer, &self.server.limits) {
                Ok((parsed, consumed)) => {
                    // Remove consumed bytes
                    self.buffer.advance(consumed);
                    let id = self.server.next_request_id();
                    return Ok(Some(parsed.into_request(self.context.remote_addr, id)));
                }

                Err(ParseError::Incomplete) => {
                    // Need more data → fall through to read
                }

                Err(e) => return Err(e.into()),
            }

            // Read more data
            let n = with_deadline(
                self.server.stale_timeout,
                self.stream.read_buf(&mut self.buffer),
            )
            .await??;

            if n == 0 {
                // Client closed connection
                if self.buffer.iter().all(|b| b.is_ascii_whitespace()) {
                    return Ok(None);
                }
                return Err(TransportError::UnexpectedEof);
            }
        }
    }

    /// Runs the handler chain on the executor and waits for its outcome.
    async fn process(&mut self, request: Request) -> ConnectionState {
        let server = &self.server;
        let keep_alive = request.keep_alive();
        let context = self.context.clone().with_request(request.summary());
        let (tx, mut rx) = unbounded_channel();
        let response = Arc::new(NativeResponse::new(
            tx,
            keep_alive,
            request.version().eq_ignore_ascii_case("HTTP/1.0"),
            request.method() == Method::HEAD,
            server.app_sink.clone(),
            context.clone(),
        ));

        tracing::debug!(
            peer = %context.remote_addr,
            request = %request.summary(),
            id = request.id(),
            "Request received"
        );

        let control = Control::new(
            server.handlers.clone(),
            request,
            response,
            server.executor.clone(),
        );
        server
            .executor
            .spawn(Box::new(move || control.next_handler()));

        match with_deadline(server.stale_timeout, rx.recv()).await {
            Ok(Some(Outbound::Response { bytes, keep_alive })) => {
                ConnectionState::Writing(ResponseWriter::new(bytes), keep_alive)
            }
            Ok(Some(Outbound::WebSocket(upgrade))) => ConnectionState::WebSocket(upgrade, rx),
            Ok(Some(Outbound::EventSource(upgrade))) => ConnectionState::EventSource(upgrade, rx),
            Ok(Some(Outbound::Fault(e))) => {
                server.report_transport(&context, e);
                ConnectionState::Closed
            }
            Ok(Some(_)) => {
                tracing::warn!(
                    peer = %context.remote_addr,
                    "Connection message before upgrade, closing"
                );
                ConnectionState::Closed
            }
            Ok(None) => {
                tracing::error!(
                    peer = %context.remote_addr,
                    request = context.request.as_deref().unwrap_or("-"),
                    "Handler chain finished without ending the response"
                );
                server.report_application(&context, ContractViolation::ResponseNotEnded.into());
                ConnectionState::Closed
            }
            Err(e) => {
                server.report_transport(&context, e.into());
                ConnectionState::Closed
            }
        }
    }

    /// Answers an unreadable request where HTTP still allows it, then reports.
    async fn reject(&mut self, error: TransportError) {
        let response = match &error {
            TransportError::TooLarge(e) => Some(Response::payload_too_large(e)),
            TransportError::Parse(_) => Some(Response::bad_request()),
            _ => None,
        };

        if let Some(mut response) = response {
            tracing::debug!(
                peer = %self.context.remote_addr,
                status = response.status,
                error = %error,
                "Rejecting request"
            );
            response.headers.set("Connection", "close");
            let mut writer = ResponseWriter::new(serialize_response(&response, false));
            // best effort, the connection is going away either way
            let _ = with_deadline(
                self.server.stale_timeout,
                writer.write_to_stream(&mut self.stream),
            )
            .await;
        }

        self.server.report_transport(&self.context, error.into());
    }
}

/// Applies the idle limit to one read or write.
pub(crate) async fn with_deadline<F: Future>(
    limit: Option<Duration>,
    fut: F,
) -> Result<F::Output, TransportError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransportError::Stale(limit)),
        None => Ok(fut.await),
    }
}
