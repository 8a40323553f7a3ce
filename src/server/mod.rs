//! Server bootstrap: the accept loop and the public builder.

pub mod listener;
pub mod web_server;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub use web_server::{RunningServer, WebServer};

use crate::error::ErrorContext;
use crate::executor::SharedExecutor;
use crate::http::handler::SharedHandler;
use crate::http::parser::ParseLimits;
use crate::sink::SharedSink;

/// Everything a connection task needs, shared by all of them.
pub(crate) struct ServerContext {
    pub handlers: Arc<[SharedHandler]>,
    pub executor: SharedExecutor,
    pub app_sink: SharedSink,
    pub transport_sink: SharedSink,
    pub limits: ParseLimits,
    pub max_frame_size: usize,
    pub stale_timeout: Option<Duration>,
    next_connection_id: AtomicU64,
    next_request_id: AtomicU64,
}

impl ServerContext {
    pub fn new(
        handlers: Arc<[SharedHandler]>,
        executor: SharedExecutor,
        app_sink: SharedSink,
        transport_sink: SharedSink,
        limits: ParseLimits,
        max_frame_size: usize,
        stale_timeout: Option<Duration>,
    ) -> Self {
        Self {
            handlers,
            executor,
            app_sink,
            transport_sink,
            limits,
            max_frame_size,
            stale_timeout,
            next_connection_id: AtomicU64::new(1),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Reports on the handler executor, behind any callbacks already queued.
    pub fn report_transport(&self, context: &ErrorContext, error: anyhow::Error) {
        let sink = self.transport_sink.clone();
        let context = context.clone();
        self.executor
            .spawn(Box::new(move || sink.report(&context, &error)));
    }

    pub fn report_application(&self, context: &ErrorContext, error: anyhow::Error) {
        let sink = self.app_sink.clone();
        let context = context.clone();
        self.executor
            .spawn(Box::new(move || sink.report(&context, &error)));
    }
}
