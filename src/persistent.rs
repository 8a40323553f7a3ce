//! State shared by WebSocket and EventSource connections.
//!
//! A connection exists only after a successful upgrade. It carries the
//! request that opened it, its own data map, the handler executor and the
//! channel to the I/O task that owns the socket. Handles are cheap to clone;
//! every clone talks to the same socket.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::data::DataMap;
use crate::error::ErrorContext;
use crate::executor::{Job, SharedExecutor};
use crate::http::connection::Outbound;
use crate::http::request::Request;

/// Returned by writes on a connection that is closing or closed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("connection is closed")]
pub struct ConnectionClosed;

#[derive(Clone)]
pub struct ConnectionBase {
    request: Request,
    data: DataMap,
    executor: SharedExecutor,
    outbound: UnboundedSender<Outbound>,
    context: ErrorContext,
}

impl ConnectionBase {
    pub(crate) fn new(
        request: Request,
        executor: SharedExecutor,
        outbound: UnboundedSender<Outbound>,
        context: ErrorContext,
    ) -> Self {
        Self {
            request,
            data: DataMap::new(),
            executor,
            outbound,
            context,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Per-connection data. Separate from the request's data map.
    pub fn data(&self) -> &DataMap {
        &self.data
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.context.remote_addr
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn handler_executor(&self) -> &SharedExecutor {
        &self.executor
    }

    /// Runs `job` on the handler executor, inline when already there.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        self.executor.execute(Box::new(job) as Job);
    }

    pub(crate) fn send(&self, message: Outbound) -> Result<(), ConnectionClosed> {
        self.outbound.send(message).map_err(|_| ConnectionClosed)
    }
}

/// Operations common to every upgraded connection.
pub trait PersistentConnection {
    fn base(&self) -> &ConnectionBase;

    /// Starts closing the connection. `on_close` fires once the transport is
    /// down.
    fn close(&self) -> Result<(), ConnectionClosed>;

    fn request(&self) -> &Request {
        self.base().request()
    }

    fn data(&self) -> &DataMap {
        self.base().data()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.base().remote_addr()
    }

    fn handler_executor(&self) -> &SharedExecutor {
        self.base().handler_executor()
    }

    fn execute(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        self.base().handler_executor().execute(job);
    }
}
