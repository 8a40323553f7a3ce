//! Wicket - an embeddable, event-driven HTTP/1.1 server.
//!
//! Requests flow through an ordered chain of [`HttpHandler`]s. Any handler can
//! answer, pass the request on, or upgrade the connection to a WebSocket or a
//! Server-Sent Events stream. All handler code runs on one executor thread.

pub mod config;
pub mod data;
pub mod error;
pub mod eventsource;
pub mod executor;
pub mod http;
pub mod logging;
pub mod persistent;
pub mod server;
pub mod sink;
pub mod websocket;

pub use config::Config;
pub use data::DataMap;
pub use error::{
    ConnectionKind, ContractViolation, ErrorContext, PayloadTooLarge, ResponseError,
    TransportError, UpgradeError,
};
pub use eventsource::{EventSourceConnection, EventSourceHandler, EventSourceMessage};
pub use executor::{Executor, HandlerExecutor, SharedExecutor};
pub use http::control::Control;
pub use http::handler::{HttpHandler, SharedHandler, handler_fn};
pub use http::request::{Method, Request};
pub use http::response::{Charset, HttpResponse, SharedResponse};
pub use persistent::{ConnectionClosed, PersistentConnection};
pub use server::{RunningServer, WebServer};
pub use sink::{ErrorSink, PrintErrorSink, SilentErrorSink, TracingErrorSink};
pub use websocket::{SendError, WebSocketConnection, WebSocketHandler};
