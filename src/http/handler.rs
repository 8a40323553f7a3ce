//! The handler trait and the stock handlers.

use std::sync::Arc;
use std::time::SystemTime;

use crate::error::UpgradeError;
use crate::eventsource::SharedEventSourceHandler;
use crate::http::control::Control;
use crate::http::request::Request;
use crate::http::response::SharedResponse;
use crate::websocket::SharedWebSocketHandler;

/// One link in the handler chain.
///
/// A handler must do exactly one of: seal the response (`end()` or
/// `error()`), call `control.next_handler()`, upgrade the connection, or hand
/// the response to something that will do one of those later. Returning
/// `Err` is the same as calling `response.error(..)`.
pub trait HttpHandler: Send + Sync + 'static {
    fn handle(
        &self,
        request: Request,
        response: SharedResponse,
        control: Control,
    ) -> anyhow::Result<()>;
}

impl<F> HttpHandler for F
where
    F: Fn(Request, SharedResponse, Control) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(
        &self,
        request: Request,
        response: SharedResponse,
        control: Control,
    ) -> anyhow::Result<()> {
        self(request, response, control)
    }
}

pub type SharedHandler = Arc<dyn HttpHandler>;

/// Lets closures be written without spelling out their argument types.
///
/// ```
/// # use wicket::handler_fn;
/// let hello = handler_fn(|_request, response, _control| {
///     response.content_str("hello");
///     response.end()?;
///     Ok(())
/// });
/// # let _ = hello;
/// ```
pub fn handler_fn<F>(f: F) -> F
where
    F: Fn(Request, SharedResponse, Control) -> anyhow::Result<()> + Send + Sync + 'static,
{
    f
}

/// Sets the `Server` header and continues.
pub struct ServerHeaderHandler {
    value: String,
}

impl ServerHeaderHandler {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl HttpHandler for ServerHeaderHandler {
    fn handle(&self, _: Request, response: SharedResponse, control: Control) -> anyhow::Result<()> {
        response.set_header("Server", &self.value);
        control.next_handler();
        Ok(())
    }
}

/// Sets the `Date` header (RFC 7231 IMF-fixdate) and continues.
#[derive(Default)]
pub struct DateHeaderHandler;

impl HttpHandler for DateHeaderHandler {
    fn handle(&self, _: Request, response: SharedResponse, control: Control) -> anyhow::Result<()> {
        response.set_header("Date", &httpdate::fmt_http_date(SystemTime::now()));
        control.next_handler();
        Ok(())
    }
}

/// Runs the wrapped handler only for one exact path; anything else continues
/// down the chain.
pub struct PathMatchHandler {
    path: String,
    handler: SharedHandler,
}

impl PathMatchHandler {
    pub fn new(path: impl Into<String>, handler: SharedHandler) -> Self {
        Self {
            path: path.into(),
            handler,
        }
    }
}

impl HttpHandler for PathMatchHandler {
    fn handle(
        &self,
        request: Request,
        response: SharedResponse,
        control: Control,
    ) -> anyhow::Result<()> {
        if request.path() == self.path {
            self.handler.handle(request, response, control)
        } else {
            control.next_handler();
            Ok(())
        }
    }
}

/// Upgrades every request it sees to a WebSocket.
pub struct HttpToWebSocketHandler {
    handler: SharedWebSocketHandler,
}

impl HttpToWebSocketHandler {
    pub fn new(handler: SharedWebSocketHandler) -> Self {
        Self { handler }
    }
}

impl HttpHandler for HttpToWebSocketHandler {
    fn handle(&self, _: Request, _: SharedResponse, control: Control) -> anyhow::Result<()> {
        match control.upgrade_to_websocket(self.handler.clone()) {
            Ok(_) => Ok(()),
            // the client already has its 400/426
            Err(UpgradeError::Handshake(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Upgrades every request it sees to an event stream.
pub struct HttpToEventSourceHandler {
    handler: SharedEventSourceHandler,
}

impl HttpToEventSourceHandler {
    pub fn new(handler: SharedEventSourceHandler) -> Self {
        Self { handler }
    }
}

impl HttpHandler for HttpToEventSourceHandler {
    fn handle(&self, _: Request, _: SharedResponse, control: Control) -> anyhow::Result<()> {
        control.upgrade_to_event_source(self.handler.clone())?;
        Ok(())
    }
}
