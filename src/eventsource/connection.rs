use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::eventsource::EventSourceState;
use crate::eventsource::message::EventSourceMessage;
use crate::http::connection::Outbound;
use crate::persistent::{ConnectionBase, ConnectionClosed, PersistentConnection};

/// Handle to an open event stream.
#[derive(Clone)]
pub struct EventSourceConnection {
    base: ConnectionBase,
    state: Arc<Mutex<EventSourceState>>,
    close_fired: Arc<AtomicBool>,
}

impl EventSourceConnection {
    pub(crate) fn new(base: ConnectionBase) -> Self {
        Self {
            base,
            state: Arc::new(Mutex::new(EventSourceState::Streaming)),
            close_fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> EventSourceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Writes one message; the stream stays open.
    pub fn send(&self, message: &EventSourceMessage) -> Result<(), ConnectionClosed> {
        if self.state() != EventSourceState::Streaming {
            return Err(ConnectionClosed);
        }
        self.base.send(Outbound::Event(message.to_bytes()))
    }

    pub(crate) fn set_state(&self, state: EventSourceState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub(crate) fn claim_close(&self) -> bool {
        !self.close_fired.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn escalate(&self, error: anyhow::Error) {
        // Nothing else to do when the I/O side is already gone
        let _ = self.base.send(Outbound::Fault(error));
    }
}

impl PersistentConnection for EventSourceConnection {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn close(&self) -> Result<(), ConnectionClosed> {
        if self.state() != EventSourceState::Streaming {
            return Err(ConnectionClosed);
        }
        self.base.send(Outbound::Close(None))
    }
}

impl std::fmt::Debug for EventSourceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSourceConnection")
            .field("peer", &self.base.remote_addr())
            .field("state", &self.state())
            .finish()
    }
}
