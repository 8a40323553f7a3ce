//! The framed half of a WebSocket connection's life.
//!
//! After the 101 is written the I/O task stays here until the connection is
//! gone: it decodes inbound frames and queues their callbacks on the handler
//! executor in wire order, and it writes whatever handlers send.

use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use crate::error::{ContractViolation, ErrorContext, TransportError, panic_message};
use crate::http::connection::{Outbound, with_deadline};
use crate::http::writer::ResponseWriter;
use crate::persistent::PersistentConnection;
use crate::server::ServerContext;
use crate::websocket::frame::{Frame, Reassembler, Role, close_code, decode_frame, encode_frame};
use crate::websocket::{
    SharedWebSocketHandler, WebSocketConnection, WebSocketHandler, WebSocketState,
    WebSocketUpgrade,
};

/// How long a server-initiated close waits for the peer's close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) async fn run(
    stream: &mut TcpStream,
    mut buffer: BytesMut,
    mut outbound: UnboundedReceiver<Outbound>,
    upgrade: WebSocketUpgrade,
    server: &ServerContext,
) {
    let WebSocketUpgrade {
        head,
        connection,
        handler,
    } = upgrade;
    let mut session = Session {
        context: connection.base().context().clone(),
        reassembler: Reassembler::new(server.max_frame_size),
        close_deadline: None,
        opened: false,
        connection,
        handler,
        server,
    };

    let result = session.pump(stream, &mut buffer, head, &mut outbound).await;
    if let Err(e) = result {
        tracing::debug!(
            peer = %session.context.remote_addr,
            error = %e,
            "WebSocket transport failure"
        );
        server.report_transport(&session.context, e.into());
    }
    session.finish();
}

enum Flow {
    Continue,
    Stop,
}

struct Session<'a> {
    connection: WebSocketConnection,
    handler: SharedWebSocketHandler,
    server: &'a ServerContext,
    context: ErrorContext,
    reassembler: Reassembler,
    close_deadline: Option<Instant>,
    /// Set once `on_open` has been queued; `on_close` only follows it.
    opened: bool,
}

impl Session<'_> {
    async fn pump(
        &mut self,
        stream: &mut TcpStream,
        buffer: &mut BytesMut,
        head: Bytes,
        outbound: &mut UnboundedReceiver<Outbound>,
    ) -> Result<(), TransportError> {
        write(stream, head, self.server.stale_timeout).await?;
        self.connection.set_state(WebSocketState::Open);
        self.opened = true;
        tracing::debug!(peer = %self.context.remote_addr, "WebSocket open");
        self.dispatch("on_open", |handler, connection| handler.on_open(connection));

        let mut outbound_open = true;
        loop {
            // Frames that arrived with the handshake or in the last read
            loop {
                let decoded = decode_frame(buffer, Role::Server, self.server.max_frame_size)
                    .and_then(|raw| match raw {
                        Some(raw) => self.reassembler.push(raw).map(Some),
                        None => Ok(None),
                    });
                match decoded {
                    Ok(Some(Some(frame))) => {
                        if let Flow::Stop = self.receive(stream, frame).await? {
                            return Ok(());
                        }
                    }
                    Ok(Some(None)) => continue,
                    Ok(None) => break,
                    Err(e) => {
                        let close = Frame::close(e.close_code(), "");
                        // best effort, the peer is misbehaving anyway
                        let _ = self.write_frame(stream, &close).await;
                        return Err(e.into());
                    }
                }
            }

            let closing = self.close_deadline;
            tokio::select! {
                read = with_deadline(self.server.stale_timeout, stream.read_buf(buffer)) => {
                    let n = read??;
                    if n == 0 {
                        if self.connection.state() == WebSocketState::Closing {
                            return Ok(());
                        }
                        return Err(TransportError::UnexpectedEof);
                    }
                }

                message = outbound.recv(), if outbound_open => match message {
                    Some(message) => {
                        if let Flow::Stop = self.send(stream, message).await? {
                            return Ok(());
                        }
                    }
                    None => outbound_open = false,
                },

                _ = tokio::time::sleep_until(closing.unwrap_or_else(Instant::now)),
                    if closing.is_some() =>
                {
                    tracing::debug!(peer = %self.context.remote_addr, "Peer never answered close");
                    return Ok(());
                }
            }
        }
    }

    /// Handles one complete inbound frame.
    async fn receive(
        &mut self,
        stream: &mut TcpStream,
        frame: Frame,
    ) -> Result<Flow, TransportError> {
        let open = self.connection.state() == WebSocketState::Open;
        match frame {
            Frame::Text(text) => {
                if open {
                    self.dispatch("on_message", move |h, c| h.on_message(c, &text));
                }
            }
            Frame::Binary(data) => {
                if open {
                    self.dispatch("on_binary", move |h, c| h.on_binary(c, &data));
                }
            }
            Frame::Ping(payload) => {
                if open {
                    self.dispatch("on_ping", move |h, c| h.on_ping(c, &payload));
                }
            }
            Frame::Pong(payload) => {
                if open {
                    self.dispatch("on_pong", move |h, c| h.on_pong(c, &payload));
                }
            }
            Frame::Close(close) => {
                tracing::debug!(peer = %self.context.remote_addr, ?close, "Peer sent close");
                if open {
                    self.connection.set_state(WebSocketState::Closing);
                    let reply = match close {
                        Some((code, _)) => Frame::close(code, ""),
                        None => Frame::Close(None),
                    };
                    self.write_frame(stream, &reply).await?;
                }
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Writes something a handler queued.
    async fn send(
        &mut self,
        stream: &mut TcpStream,
        message: Outbound,
    ) -> Result<Flow, TransportError> {
        let open = self.connection.state() == WebSocketState::Open;
        match message {
            Outbound::Frame(frame) if open => {
                self.write_frame(stream, &frame).await?;
            }
            Outbound::Close(close) if open => {
                let (code, reason) = close.unwrap_or((close_code::NORMAL, String::new()));
                self.write_frame(stream, &Frame::close(code, &reason)).await?;
                self.connection.set_state(WebSocketState::Closing);
                self.close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
            }
            Outbound::Fault(e) => {
                self.server.report_transport(&self.context, e);
                return Ok(Flow::Stop);
            }
            Outbound::Frame(_) | Outbound::Close(_) => {
                tracing::debug!(
                    peer = %self.context.remote_addr,
                    "Dropping write on closing connection"
                );
            }
            Outbound::Response { .. }
            | Outbound::WebSocket(_)
            | Outbound::EventSource(_)
            | Outbound::Event(_) => {
                tracing::warn!(peer = %self.context.remote_addr, "Ignoring non-WebSocket write");
            }
        }
        Ok(Flow::Continue)
    }

    async fn write_frame(
        &self,
        stream: &mut TcpStream,
        frame: &Frame,
    ) -> Result<(), TransportError> {
        write(stream, encode_frame(frame, None)?, self.server.stale_timeout).await
    }

    /// Queues a handler callback. Failures go to the application sink and
    /// leave the connection open.
    fn dispatch<F>(&self, callback: &'static str, f: F)
    where
        F: FnOnce(&dyn WebSocketHandler, &WebSocketConnection) -> anyhow::Result<()>
            + Send
            + 'static,
    {
        let handler = self.handler.clone();
        let connection = self.connection.clone();
        let sink = self.server.app_sink.clone();
        let context = self.context.clone();
        self.server.executor.spawn(Box::new(move || {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| f(handler.as_ref(), &connection)));
            let error = match result {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.context(format!("WebSocket {} failed", callback)),
                Err(payload) => {
                    anyhow::Error::new(ContractViolation::Panic(panic_message(payload.as_ref())))
                }
            };
            sink.report(&context, &error);
        }));
    }

    /// Marks the connection closed and queues `on_close` behind every
    /// callback already dispatched. A connection that never opened gets no
    /// `on_close`.
    fn finish(&self) {
        self.connection.set_state(WebSocketState::Closed);
        if self.opened && self.connection.claim_close() {
            tracing::debug!(peer = %self.context.remote_addr, "WebSocket closed");
            self.dispatch("on_close", |handler, connection| handler.on_close(connection));
        }
    }
}

async fn write(
    stream: &mut TcpStream,
    bytes: Bytes,
    limit: Option<Duration>,
) -> Result<(), TransportError> {
    with_deadline(limit, ResponseWriter::new(bytes).write_to_stream(stream)).await??;
    Ok(())
}
