use std::sync::Arc;

use crate::websocket::connection::WebSocketConnection;

/// Callbacks for one WebSocket endpoint.
///
/// Every callback runs on the handler executor, in the order frames arrived.
/// Errors and panics are reported to the application error sink and leave the
/// connection open.
pub trait WebSocketHandler: Send + Sync + 'static {
    fn on_open(&self, _connection: &WebSocketConnection) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fires exactly once, whichever side closed.
    fn on_close(&self, _connection: &WebSocketConnection) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_message(&self, _connection: &WebSocketConnection, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_binary(&self, _connection: &WebSocketConnection, _data: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }

    /// Replies with a pong carrying the same payload.
    fn on_ping(&self, connection: &WebSocketConnection, payload: &[u8]) -> anyhow::Result<()> {
        connection.pong(payload)?;
        Ok(())
    }

    fn on_pong(&self, _connection: &WebSocketConnection, _payload: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

pub type SharedWebSocketHandler = Arc<dyn WebSocketHandler>;
