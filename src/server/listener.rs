use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::info;

use crate::http::connection::Connection;
use crate::server::ServerContext;

/// Accepts connections until `shutdown` fires, then aborts the ones still open.
pub(crate) async fn run(
    listener: TcpListener,
    server: Arc<ServerContext>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    info!(peer = %peer, "Accepted connection");
                    if let Err(e) = socket.set_nodelay(true) {
                        tracing::debug!(peer = %peer, error = %e, "Could not disable Nagle");
                    }

                    let server = server.clone();
                    connections.spawn(async move {
                        let mut conn = Connection::new(socket, peer, server);
                        conn.run().await;
                    });
                }
                Err(e) => {
                    // Usually descriptor exhaustion; give in-flight connections a moment to finish
                    tracing::error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },

            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Connection task panicked");
                    }
                }
            }

            _ = &mut shutdown => break,
        }
    }

    info!(open = connections.len(), "Listener stopped");
    connections.shutdown().await;
}
