use std::sync::Arc;

use crate::eventsource::connection::EventSourceConnection;

/// Callbacks for one event-stream endpoint.
///
/// `on_open` runs synchronously inside the upgrade, on whatever thread the
/// handler chain was on. An error from it tears the stream down and goes to
/// the transport error sink. `on_close` runs on the handler executor, once.
pub trait EventSourceHandler: Send + Sync + 'static {
    fn on_open(&self, _connection: &EventSourceConnection) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_close(&self, _connection: &EventSourceConnection) -> anyhow::Result<()> {
        Ok(())
    }
}

pub type SharedEventSourceHandler = Arc<dyn EventSourceHandler>;
