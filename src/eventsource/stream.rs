use std::panic::{self, AssertUnwindSafe};

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::{ContractViolation, panic_message};
use crate::eventsource::{EventSourceState, EventSourceUpgrade};
use crate::http::connection::{Outbound, with_deadline};
use crate::http::writer::ResponseWriter;
use crate::persistent::PersistentConnection;
use crate::server::ServerContext;

/// Streams events until either side closes.
///
/// Clients have nothing to say on an event stream, so inbound bytes are only
/// read to notice the disconnect.
pub(crate) async fn run(
    stream: &mut TcpStream,
    mut buffer: BytesMut,
    mut outbound: UnboundedReceiver<Outbound>,
    upgrade: EventSourceUpgrade,
    server: &ServerContext,
) {
    let EventSourceUpgrade {
        head,
        connection,
        handler,
    } = upgrade;
    let context = connection.base().context().clone();
    let limit = server.stale_timeout;

    let result: anyhow::Result<()> = async {
        ResponseWriter::new(head).write_to_stream(stream).await?;
        tracing::debug!(peer = %context.remote_addr, "Event stream open");

        let mut outbound_open = true;
        loop {
            buffer.clear();
            tokio::select! {
                read = with_deadline(limit, stream.read_buf(&mut buffer)) => {
                    if read?? == 0 {
                        return Ok(());
                    }
                }

                message = outbound.recv(), if outbound_open => match message {
                    Some(Outbound::Event(bytes)) => {
                        let mut writer = ResponseWriter::new(bytes);
                        let write = writer.write_to_stream(stream);
                        with_deadline(limit, write).await??;
                    }
                    Some(Outbound::Close(_)) => return Ok(()),
                    Some(Outbound::Fault(e)) => return Err(e),
                    Some(_) => {
                        tracing::warn!(
                            peer = %context.remote_addr,
                            "Ignoring non-event write on event stream"
                        );
                    }
                    None => outbound_open = false,
                },
            }
        }
    }
    .await;

    if let Err(e) = result {
        tracing::debug!(peer = %context.remote_addr, error = %e, "Event stream failed");
        server.report_transport(&context, e);
    }

    connection.set_state(EventSourceState::Closed);
    if connection.claim_close() {
        tracing::debug!(peer = %context.remote_addr, "Event stream closed");
        let sink = server.app_sink.clone();
        server.executor.spawn(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler.on_close(&connection)));
            let error = match result {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.context("EventSource on_close failed"),
                Err(payload) => {
                    anyhow::Error::new(ContractViolation::Panic(panic_message(payload.as_ref())))
                }
            };
            sink.report(&context, &error);
        }));
    }
}
