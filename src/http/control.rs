//! Per-request handler chain controller.
//!
//! A [`Control`] walks the server's handler list for one request. Each handler
//! decides to answer, to pass the request on with [`Control::next_handler`],
//! or to upgrade the connection. Handlers that run off the end of the chain
//! get a 404.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ConnectionKind, ContractViolation, UpgradeError, panic_message};
use crate::eventsource::{
    EventSourceConnection, EventSourceState, EventSourceUpgrade, SharedEventSourceHandler,
};
use crate::executor::{Job, SharedExecutor};
use crate::http::connection::Outbound;
use crate::http::handler::SharedHandler;
use crate::http::headers::Headers;
use crate::http::request::Request;
use crate::http::response::{NativeResponse, ResponseBuilder, SharedResponse, StatusCode};
use crate::http::writer::serialize_response;
use crate::persistent::ConnectionBase;
use crate::websocket::handshake;
use crate::websocket::{SharedWebSocketHandler, WebSocketConnection, WebSocketUpgrade};

/// Cursor through the handler chain for a single request.
///
/// Cheap to clone; clones share the cursor, so a position visited through one
/// clone is not visited again through another.
#[derive(Clone)]
pub struct Control {
    inner: Arc<ControlInner>,
}

struct ControlInner {
    handlers: Arc<[SharedHandler]>,
    cursor: AtomicUsize,
    bound: Mutex<Binding>,
    native_request: Request,
    native_response: Arc<NativeResponse>,
    executor: SharedExecutor,
    upgraded: Mutex<Upgraded>,
}

struct Binding {
    request: Request,
    response: SharedResponse,
    /// `None` means this control.
    control: Option<Control>,
}

enum Upgraded {
    No,
    WebSocket(WebSocketConnection),
    EventSource(EventSourceConnection),
}

impl Control {
    pub(crate) fn new(
        handlers: Arc<[SharedHandler]>,
        request: Request,
        response: Arc<NativeResponse>,
        executor: SharedExecutor,
    ) -> Self {
        let shared: SharedResponse = response.clone();
        Self {
            inner: Arc::new(ControlInner {
                handlers,
                cursor: AtomicUsize::new(0),
                bound: Mutex::new(Binding {
                    request: request.clone(),
                    response: shared,
                    control: None,
                }),
                native_request: request,
                native_response: response,
                executor,
                upgraded: Mutex::new(Upgraded::No),
            }),
        }
    }

    /// Passes the bound request and response to the next handler.
    ///
    /// A handler error or panic becomes `response.error(..)`; nothing
    /// propagates to the caller.
    pub fn next_handler(&self) {
        let (request, response, control) = self.binding();
        let index = self.inner.cursor.fetch_add(1, Ordering::AcqRel);

        let Some(handler) = self.inner.handlers.get(index).cloned() else {
            tracing::debug!(request = %request.summary(), "No handler matched");
            response.set_status(StatusCode::NotFound.as_u16());
            if let Err(e) = response.end() {
                tracing::debug!(error = %e, "Could not send 404");
            }
            return;
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.handle(request, response.clone(), control)
        }));
        let error = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(payload) => {
                anyhow::Error::new(ContractViolation::Panic(panic_message(payload.as_ref())))
            }
        };
        if let Err(e) = response.error(error) {
            tracing::debug!(error = %e, "Handler failed after the response was sealed");
        }
    }

    /// Rebinds the request and response, then continues the chain.
    pub fn next_handler_with(&self, request: Request, response: SharedResponse) {
        self.rebind(request, response, None);
        self.next_handler();
    }

    /// Rebinds request, response and the control later handlers receive.
    pub fn next_handler_with_control(
        &self,
        request: Request,
        response: SharedResponse,
        control: Control,
    ) {
        let control = (!Arc::ptr_eq(&control.inner, &self.inner)).then_some(control);
        self.rebind(request, response, control);
        self.next_handler();
    }

    /// Runs `task` on the handler executor (inline when already there). An
    /// error or panic from the task becomes `response.error(..)`.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let (_, response, _) = self.binding();
        let job: Job = Box::new(move || {
            let error = match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e,
                Err(payload) => {
                    anyhow::Error::new(ContractViolation::Panic(panic_message(payload.as_ref())))
                }
            };
            if let Err(e) = response.error(error) {
                tracing::debug!(error = %e, "Task failed after the response was sealed");
            }
        });
        self.inner.executor.execute(job);
    }

    pub fn handler_executor(&self) -> &SharedExecutor {
        &self.inner.executor
    }

    /// The request as it came off the wire, before any rebinding.
    pub fn native_request(&self) -> &Request {
        &self.inner.native_request
    }

    /// Switches the connection to WebSocket framing.
    ///
    /// On a handshake problem the client gets a 400 or 426, the response is
    /// sealed and `Err(UpgradeError::Handshake)` is returned. Neither error
    /// sink is involved. `on_open` fires on the executor once the 101 has
    /// been written.
    pub fn upgrade_to_websocket(
        &self,
        handler: SharedWebSocketHandler,
    ) -> Result<WebSocketConnection, UpgradeError> {
        let mut upgraded = self.upgraded()?;

        let response = &self.inner.native_response;
        let handshake = match handshake::validate(&self.inner.native_request) {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::debug!(
                    peer = %self.inner.native_request.remote_addr(),
                    error = %e,
                    "WebSocket handshake rejected"
                );
                if let Err(re) = response.reject(e.rejection()) {
                    tracing::debug!(error = %re, "Could not send handshake rejection");
                }
                return Err(e.into());
            }
        };

        let headers = response
            .mark_upgraded()
            .map_err(|_| UpgradeError::ResponseEnded)?;
        let head = serialize_response(&handshake::accept_response(&handshake, headers), false);

        let connection = WebSocketConnection::new(
            self.connection_base(ConnectionKind::WebSocket),
            format!("Sec-WebSocket-Version-{}", handshake.version),
        );
        response
            .outbound()
            .send(Outbound::WebSocket(WebSocketUpgrade {
                head,
                connection: connection.clone(),
                handler,
            }))
            .map_err(|_| UpgradeError::TransportClosed)?;

        tracing::debug!(
            peer = %self.inner.native_request.remote_addr(),
            version = connection.version(),
            "Upgrading to WebSocket"
        );
        *upgraded = Upgraded::WebSocket(connection.clone());
        Ok(connection)
    }

    /// Switches the connection to an event stream.
    ///
    /// Headers already set on the response are kept; the event-stream headers
    /// override them. `on_open` runs before this returns.
    pub fn upgrade_to_event_source(
        &self,
        handler: SharedEventSourceHandler,
    ) -> Result<EventSourceConnection, UpgradeError> {
        let mut upgraded = self.upgraded()?;

        let response = &self.inner.native_response;
        let mut headers: Headers = response
            .mark_upgraded()
            .map_err(|_| UpgradeError::ResponseEnded)?;
        headers.set("Content-Type", "text/event-stream");
        headers.set("Transfer-Encoding", "identity");
        headers.set("Connection", "keep-alive");
        headers.set("Cache-Control", "no-cache");
        headers.remove("Content-Length");
        let head = serialize_response(
            &ResponseBuilder::new(StatusCode::Ok)
                .headers(headers)
                .streaming()
                .build(),
            false,
        );

        let connection = EventSourceConnection::new(
            self.connection_base(ConnectionKind::EventSource),
        );
        response
            .outbound()
            .send(Outbound::EventSource(EventSourceUpgrade {
                head,
                connection: connection.clone(),
                handler: handler.clone(),
            }))
            .map_err(|_| UpgradeError::TransportClosed)?;
        *upgraded = Upgraded::EventSource(connection.clone());
        drop(upgraded);

        let opened = panic::catch_unwind(AssertUnwindSafe(|| handler.on_open(&connection)));
        let failure = match opened {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.context("EventSource on_open failed")),
            Err(payload) => Some(anyhow::Error::new(ContractViolation::Panic(panic_message(
                payload.as_ref(),
            )))),
        };
        if let Some(error) = failure {
            connection.set_state(EventSourceState::Closed);
            connection.escalate(error);
        }

        Ok(connection)
    }

    /// The connection from a successful WebSocket upgrade, if any.
    pub fn websocket_connection(&self) -> Option<WebSocketConnection> {
        match &*self.lock_upgraded() {
            Upgraded::WebSocket(connection) => Some(connection.clone()),
            _ => None,
        }
    }

    pub fn event_source_connection(&self) -> Option<EventSourceConnection> {
        match &*self.lock_upgraded() {
            Upgraded::EventSource(connection) => Some(connection.clone()),
            _ => None,
        }
    }

    fn binding(&self) -> (Request, SharedResponse, Control) {
        let bound = self.inner.bound.lock().unwrap_or_else(|e| e.into_inner());
        (
            bound.request.clone(),
            bound.response.clone(),
            bound.control.clone().unwrap_or_else(|| self.clone()),
        )
    }

    fn rebind(&self, request: Request, response: SharedResponse, control: Option<Control>) {
        let mut bound = self.inner.bound.lock().unwrap_or_else(|e| e.into_inner());
        *bound = Binding {
            request,
            response,
            control,
        };
    }

    fn lock_upgraded(&self) -> MutexGuard<'_, Upgraded> {
        self.inner.upgraded.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock on the upgrade slot, provided nothing has upgraded yet.
    fn upgraded(&self) -> Result<MutexGuard<'_, Upgraded>, UpgradeError> {
        let upgraded = self.lock_upgraded();
        if matches!(*upgraded, Upgraded::No) {
            return Ok(upgraded);
        }
        tracing::error!(
            peer = %self.inner.native_request.remote_addr(),
            request = %self.inner.native_request.summary(),
            "Connection upgraded twice"
        );
        Err(UpgradeError::AlreadyUpgraded)
    }

    fn connection_base(&self, kind: ConnectionKind) -> ConnectionBase {
        let (request, _, _) = self.binding();
        let response = &self.inner.native_response;
        ConnectionBase::new(
            request,
            self.inner.executor.clone(),
            response.outbound(),
            response.context().clone().with_kind(kind),
        )
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("request", &self.inner.native_request.summary())
            .field("cursor", &self.inner.cursor.load(Ordering::Acquire))
            .field("handlers", &self.inner.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorContext;
    use crate::executor::HandlerExecutor;
    use crate::http::request::{Method, RequestBuilder};
    use crate::sink::SharedSink;
    use crate::websocket::WebSocketHandler;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    struct Harness {
        control: Control,
        outbound: UnboundedReceiver<Outbound>,
        reports: Arc<StdMutex<Vec<String>>>,
    }

    fn harness(handlers: Vec<SharedHandler>, request: Request) -> Harness {
        let (tx, rx) = unbounded_channel();
        let reports = Arc::new(StdMutex::new(Vec::new()));
        let captured = reports.clone();
        let sink: SharedSink = Arc::new(move |_: &ErrorContext, e: &anyhow::Error| {
            captured.lock().unwrap().push(format!("{:#}", e));
        });
        let ctx = ErrorContext::new(request.remote_addr(), 1, ConnectionKind::Http)
            .with_request(request.summary());
        let response = Arc::new(NativeResponse::new(
            tx,
            request.keep_alive(),
            false,
            false,
            sink,
            ctx,
        ));
        let executor: SharedExecutor = HandlerExecutor::new("control-test").unwrap();
        Harness {
            control: Control::new(handlers.into(), request, response, executor),
            outbound: rx,
            reports,
        }
    }

    fn get(uri: &str) -> Request {
        RequestBuilder::new()
            .method(Method::GET)
            .uri(uri)
            .build()
            .unwrap()
    }

    fn response_text(rx: &mut UnboundedReceiver<Outbound>) -> String {
        match rx.try_recv() {
            Ok(Outbound::Response { bytes, .. }) => String::from_utf8(bytes.to_vec()).unwrap(),
            _ => panic!("expected a response"),
        }
    }

    fn handler<F>(f: F) -> SharedHandler
    where
        F: Fn(Request, SharedResponse, Control) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    #[test]
    fn empty_chain_is_a_404_without_sink() {
        let mut h = harness(Vec::new(), get("/"));
        h.control.next_handler();
        assert!(response_text(&mut h.outbound).starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(h.outbound.try_recv().is_err());
        assert!(h.reports.lock().unwrap().is_empty());
    }

    #[test]
    fn handlers_run_in_order_and_fall_through_once() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let first = order.clone();
        let second = order.clone();
        let mut h = harness(
            vec![
                handler(move |_, _, control| {
                    first.lock().unwrap().push(1);
                    control.next_handler();
                    Ok(())
                }),
                handler(move |_, _, control| {
                    second.lock().unwrap().push(2);
                    control.next_handler();
                    Ok(())
                }),
            ],
            get("/"),
        );
        h.control.next_handler();

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert!(response_text(&mut h.outbound).starts_with("HTTP/1.1 404"));
        assert!(h.outbound.try_recv().is_err());
        assert!(h.reports.lock().unwrap().is_empty());
    }

    #[test]
    fn handler_error_becomes_500_and_reaches_sink() {
        let mut h = harness(
            vec![handler(|_, _, _| Err(anyhow::anyhow!("no database")))],
            get("/"),
        );
        h.control.next_handler();
        let text = response_text(&mut h.outbound);
        assert!(text.starts_with("HTTP/1.1 500"));
        assert!(text.contains("no database"));
        assert_eq!(h.reports.lock().unwrap().as_slice(), ["no database"]);
    }

    #[test]
    fn handler_panic_becomes_500() {
        let mut h = harness(vec![handler(|_, _, _| panic!("kaboom"))], get("/"));
        h.control.next_handler();
        assert!(response_text(&mut h.outbound).starts_with("HTTP/1.1 500"));
        assert_eq!(
            h.reports.lock().unwrap().as_slice(),
            ["handler panicked: kaboom"]
        );
    }

    #[test]
    fn rebinding_changes_what_later_handlers_see() {
        let mut h = harness(
            vec![
                handler(|request, response, control| {
                    control.next_handler_with(request.with_uri("/rewritten"), response);
                    Ok(())
                }),
                handler(|request, response, _| {
                    response.content_str(request.uri());
                    response.end()?;
                    Ok(())
                }),
            ],
            get("/original"),
        );
        h.control.next_handler();
        assert!(response_text(&mut h.outbound).ends_with("\r\n\r\n/rewritten"));
    }

    #[test]
    fn execute_routes_task_errors_to_the_response() {
        let mut h = harness(
            vec![handler(|_, _, control| {
                control.execute(|| Err(anyhow::anyhow!("later failure")));
                Ok(())
            })],
            get("/"),
        );
        h.control.next_handler();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            match h.outbound.try_recv() {
                Ok(Outbound::Response { bytes, .. }) => {
                    assert!(bytes.starts_with(b"HTTP/1.1 500"));
                    break;
                }
                _ if std::time::Instant::now() < deadline => {
                    std::thread::sleep(std::time::Duration::from_millis(5))
                }
                _ => panic!("task failure never produced a response"),
            }
        }
    }

    struct Quiet;
    impl WebSocketHandler for Quiet {}

    #[test]
    fn failed_handshake_answers_without_sink() {
        let mut h = harness(Vec::new(), get("/ws"));
        let result = h.control.upgrade_to_websocket(Arc::new(Quiet));
        assert!(matches!(result, Err(UpgradeError::Handshake(_))));
        assert!(response_text(&mut h.outbound).starts_with("HTTP/1.1 400"));
        assert!(h.reports.lock().unwrap().is_empty());
        assert!(h.control.websocket_connection().is_none());
    }

    #[test]
    fn second_upgrade_is_rejected() {
        let request = RequestBuilder::new()
            .method(Method::GET)
            .uri("/ws")
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("Sec-WebSocket-Version", "13")
            .build()
            .unwrap();
        let mut h = harness(Vec::new(), request);

        let connection = h.control.upgrade_to_websocket(Arc::new(Quiet)).unwrap();
        assert_eq!(connection.version(), "Sec-WebSocket-Version-13");
        assert!(matches!(h.outbound.try_recv(), Ok(Outbound::WebSocket(_))));

        assert!(matches!(
            h.control.upgrade_to_websocket(Arc::new(Quiet)),
            Err(UpgradeError::AlreadyUpgraded)
        ));
        assert!(matches!(
            h.control.upgrade_to_event_source(Arc::new(QuietStream)),
            Err(UpgradeError::AlreadyUpgraded)
        ));
        assert!(h.control.websocket_connection().is_some());
    }

    struct QuietStream;
    impl crate::eventsource::EventSourceHandler for QuietStream {}

    #[test]
    fn event_source_head_overrides_headers() {
        let mut h = harness(
            vec![handler(|_, response, control| {
                response
                    .set_header("Content-Type", "text/html")
                    .header("X-Stream", "yes");
                control.upgrade_to_event_source(Arc::new(QuietStream))?;
                Ok(())
            })],
            get("/events"),
        );
        h.control.next_handler();

        let Ok(Outbound::EventSource(upgrade)) = h.outbound.try_recv() else {
            panic!("expected an event-source upgrade");
        };
        let head = String::from_utf8(upgrade.head.to_vec()).unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("X-Stream: yes\r\n"));
        assert!(head.contains("Content-Type: text/event-stream\r\n"));
        assert!(head.contains("Cache-Control: no-cache\r\n"));
        assert!(!head.contains("text/html"));
        assert!(!head.contains("Content-Length"));
    }
}
