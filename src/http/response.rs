use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{ErrorContext, PayloadTooLarge, ResponseError};
use crate::http::connection::Outbound;
use crate::http::headers::Headers;
use crate::http::writer::serialize_response;
use crate::sink::SharedSink;

/// HTTP status codes the server itself produces or recognises.
///
/// Handlers may set any numeric status; these are the ones with a known
/// reason phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 101 Switching Protocols
    SwitchingProtocols,
    /// 200 OK
    Ok,
    /// 201 Created
    Created,
    /// 204 No Content
    NoContent,
    /// 301 Moved Permanently
    MovedPermanently,
    /// 302 Found
    Found,
    /// 304 Not Modified
    NotModified,
    /// 400 Bad Request
    BadRequest,
    /// 401 Unauthorized
    Unauthorized,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
    /// 405 Method Not Allowed
    MethodNotAllowed,
    /// 413 Payload Too Large
    PayloadTooLarge,
    /// 426 Upgrade Required
    UpgradeRequired,
    /// 500 Internal Server Error
    InternalServerError,
    /// 501 Not Implemented
    NotImplemented,
    /// 503 Service Unavailable
    ServiceUnavailable,
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use wicket::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::NotFound.as_u16(), 404);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::SwitchingProtocols => 101,
            StatusCode::Ok => 200,
            StatusCode::Created => 201,
            StatusCode::NoContent => 204,
            StatusCode::MovedPermanently => 301,
            StatusCode::Found => 302,
            StatusCode::NotModified => 304,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::UpgradeRequired => 426,
            StatusCode::InternalServerError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::ServiceUnavailable => 503,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            101 => StatusCode::SwitchingProtocols,
            200 => StatusCode::Ok,
            201 => StatusCode::Created,
            204 => StatusCode::NoContent,
            301 => StatusCode::MovedPermanently,
            302 => StatusCode::Found,
            304 => StatusCode::NotModified,
            400 => StatusCode::BadRequest,
            401 => StatusCode::Unauthorized,
            403 => StatusCode::Forbidden,
            404 => StatusCode::NotFound,
            405 => StatusCode::MethodNotAllowed,
            413 => StatusCode::PayloadTooLarge,
            426 => StatusCode::UpgradeRequired,
            500 => StatusCode::InternalServerError,
            501 => StatusCode::NotImplemented,
            503 => StatusCode::ServiceUnavailable,
            _ => return None,
        })
    }

    /// Returns the standard HTTP reason phrase for this status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use wicket::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::NotFound.reason_phrase(), "Not Found");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::SwitchingProtocols => "Switching Protocols",
            StatusCode::Ok => "OK",
            StatusCode::Created => "Created",
            StatusCode::NoContent => "No Content",
            StatusCode::MovedPermanently => "Moved Permanently",
            StatusCode::Found => "Found",
            StatusCode::NotModified => "Not Modified",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::UpgradeRequired => "Upgrade Required",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// Reason phrase for any numeric status.
pub fn reason_phrase(code: u16) -> &'static str {
    StatusCode::from_u16(code)
        .map(|s| s.reason_phrase())
        .unwrap_or("Unknown")
}

/// Represents a complete HTTP response ready to be sent to a client.
#[derive(Debug, Clone)]
pub struct Response {
    /// Numeric HTTP status code
    pub status: u16,
    /// HTTP headers
    pub headers: Headers,
    /// Response body as bytes
    pub body: Bytes,
}

/// Builder for constructing HTTP responses in a fluent style.
///
/// # Example
///
/// ```ignore
/// let response = ResponseBuilder::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(b"{}".to_vec())
///     .build();
/// ```
pub struct ResponseBuilder {
    status: u16,
    headers: Headers,
    body: Bytes,
    content_length: bool,
}

impl ResponseBuilder {
    /// Creates a new response builder with the specified status code.
    pub fn new(status: StatusCode) -> Self {
        Self::with_status(status.as_u16())
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            content_length: true,
        }
    }

    /// Adds a header, keeping earlier values with the same name.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(key, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the response body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Leaves Content-Length off, for heads that open a stream.
    pub fn streaming(mut self) -> Self {
        self.content_length = false;
        self
    }

    /// Builds the final Response.
    ///
    /// Adds the Content-Length header from the body size if not already present.
    pub fn build(mut self) -> Response {
        if self.content_length && !self.headers.contains("Content-Length") {
            self.headers
                .add("Content-Length", self.body.len().to_string());
        }

        Response {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

impl Response {
    /// Creates a 400 Bad Request response.
    pub fn bad_request() -> Self {
        ResponseBuilder::new(StatusCode::BadRequest)
            .header("Content-Type", "text/plain")
            .body(&b"400 Bad Request"[..])
            .build()
    }

    /// Creates a 413 response describing the limit that was hit.
    pub fn payload_too_large(error: &PayloadTooLarge) -> Self {
        ResponseBuilder::new(StatusCode::PayloadTooLarge)
            .header("Content-Type", "text/plain")
            .body(error.to_string())
            .build()
    }
}

/// Character set used to encode text content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Utf8,
    UsAscii,
    Iso8859_1,
}

impl Charset {
    pub fn name(&self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::UsAscii => "US-ASCII",
            Charset::Iso8859_1 => "ISO-8859-1",
        }
    }

    /// Encodes `text`; characters the charset cannot represent become `?`.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        let max = match self {
            Charset::Utf8 => return text.as_bytes().to_vec(),
            Charset::UsAscii => 0x7F,
            Charset::Iso8859_1 => 0xFF,
        };
        text.chars()
            .map(|c| if (c as u32) <= max { c as u32 as u8 } else { b'?' })
            .collect()
    }
}

/// The mutable, write-once response handed to handlers.
///
/// Setters return the response itself so calls can be chained. `end()` and
/// `error()` seal it; exactly one of them must be called per request that is
/// not upgraded. Decorators implement this trait around another
/// [`SharedResponse`] and forward what they do not override.
pub trait HttpResponse: Send + Sync + 'static {
    fn set_status(&self, status: u16) -> &dyn HttpResponse;
    fn status(&self) -> u16;

    /// Adds a header value, keeping existing values.
    fn header(&self, name: &str, value: &str) -> &dyn HttpResponse;
    /// Replaces all values of a header.
    fn set_header(&self, name: &str, value: &str) -> &dyn HttpResponse;
    fn remove_header(&self, name: &str) -> &dyn HttpResponse;
    fn header_value(&self, name: &str) -> Option<String>;
    fn contains_header(&self, name: &str) -> bool;

    fn set_charset(&self, charset: Charset) -> &dyn HttpResponse;
    fn charset(&self) -> Charset;

    /// Appends raw bytes to the body.
    fn content(&self, bytes: &[u8]) -> &dyn HttpResponse;
    /// Appends text to the body, encoded with the current charset.
    fn content_str(&self, text: &str) -> &dyn HttpResponse;

    /// Sends the response and seals it.
    fn end(&self) -> Result<(), ResponseError>;
    /// Replaces the response with a diagnostic 500 (or 413), sends it, seals
    /// it and reports `error` to the application sink.
    fn error(&self, error: anyhow::Error) -> Result<(), ResponseError>;

    /// True once `end()`/`error()` succeeded or the connection was upgraded.
    fn is_sealed(&self) -> bool;
}

pub type SharedResponse = Arc<dyn HttpResponse>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Ended,
    Upgraded,
}

struct ResponseState {
    status: u16,
    headers: Headers,
    charset: Charset,
    body: BytesMut,
    phase: Phase,
}

/// Response bound to a live connection.
///
/// Content accumulates in a buffer owned by this response. Sealing freezes it
/// and moves it to the connection's I/O task.
pub struct NativeResponse {
    state: Mutex<ResponseState>,
    outbound: UnboundedSender<Outbound>,
    keep_alive: bool,
    http10: bool,
    head_only: bool,
    app_sink: SharedSink,
    context: ErrorContext,
}

impl NativeResponse {
    pub(crate) fn new(
        outbound: UnboundedSender<Outbound>,
        keep_alive: bool,
        http10: bool,
        head_only: bool,
        app_sink: SharedSink,
        context: ErrorContext,
    ) -> Self {
        Self {
            state: Mutex::new(ResponseState {
                status: StatusCode::Ok.as_u16(),
                headers: Headers::new(),
                charset: Charset::Utf8,
                body: BytesMut::new(),
                phase: Phase::Open,
            }),
            outbound,
            keep_alive,
            http10,
            head_only,
            app_sink,
            context,
        }
    }

    pub(crate) fn outbound(&self) -> UnboundedSender<Outbound> {
        self.outbound.clone()
    }

    pub(crate) fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Hands the connection over to a persistent protocol. Returns the headers
    /// handlers set so far.
    pub(crate) fn mark_upgraded(&self) -> Result<Headers, ResponseError> {
        let mut state = self.lock();
        match state.phase {
            Phase::Open => {
                state.phase = Phase::Upgraded;
                Ok(std::mem::take(&mut state.headers))
            }
            Phase::Ended => Err(ResponseError::AlreadyEnded),
            Phase::Upgraded => Err(ResponseError::Upgraded),
        }
    }

    /// Sends a protocol rejection in place of whatever the handlers built.
    pub(crate) fn reject(&self, response: Response) -> Result<(), ResponseError> {
        self.seal()?;
        self.flush(response)
    }

    fn lock(&self) -> MutexGuard<'_, ResponseState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies `f` unless the response is sealed.
    fn mutate(&self, what: &str, f: impl FnOnce(&mut ResponseState)) -> &dyn HttpResponse {
        let mut state = self.lock();
        if state.phase == Phase::Open {
            f(&mut state);
        } else {
            tracing::error!(
                peer = %self.context.remote_addr,
                request = self.context.request.as_deref().unwrap_or("-"),
                operation = what,
                "Response modified after it was sealed, ignoring"
            );
        }
        self
    }

    fn seal(&self) -> Result<(), ResponseError> {
        let mut state = self.lock();
        match state.phase {
            Phase::Open => {
                state.phase = Phase::Ended;
                Ok(())
            }
            Phase::Ended => Err(self.violation(ResponseError::AlreadyEnded)),
            Phase::Upgraded => Err(self.violation(ResponseError::Upgraded)),
        }
    }

    fn violation(&self, error: ResponseError) -> ResponseError {
        tracing::error!(
            peer = %self.context.remote_addr,
            request = self.context.request.as_deref().unwrap_or("-"),
            error = %error,
            "Response terminated twice"
        );
        error
    }

    /// Builds the wire response from the sealed state.
    fn take_response(&self) -> Response {
        let mut state = self.lock();
        let body = state.body.split().freeze();
        ResponseBuilder::with_status(state.status)
            .headers(std::mem::take(&mut state.headers))
            .body(body)
            .build()
    }

    fn flush(&self, mut response: Response) -> Result<(), ResponseError> {
        if !self.keep_alive {
            response.headers.set("Connection", "close");
        } else if self.http10 {
            response.headers.set("Connection", "keep-alive");
        }

        let bytes = serialize_response(&response, self.head_only);
        tracing::debug!(
            peer = %self.context.remote_addr,
            request = self.context.request.as_deref().unwrap_or("-"),
            status = response.status,
            bytes = bytes.len(),
            "Response complete"
        );
        self.outbound
            .send(Outbound::Response {
                bytes,
                keep_alive: self.keep_alive,
            })
            .map_err(|_| ResponseError::TransportClosed)
    }
}

impl HttpResponse for NativeResponse {
    fn set_status(&self, status: u16) -> &dyn HttpResponse {
        self.mutate("status", |s| s.status = status)
    }

    fn status(&self) -> u16 {
        self.lock().status
    }

    fn header(&self, name: &str, value: &str) -> &dyn HttpResponse {
        self.mutate("header", |s| s.headers.add(name, value))
    }

    fn set_header(&self, name: &str, value: &str) -> &dyn HttpResponse {
        self.mutate("header", |s| s.headers.set(name, value))
    }

    fn remove_header(&self, name: &str) -> &dyn HttpResponse {
        self.mutate("header", |s| {
            s.headers.remove(name);
        })
    }

    fn header_value(&self, name: &str) -> Option<String> {
        self.lock().headers.get(name).map(str::to_string)
    }

    fn contains_header(&self, name: &str) -> bool {
        self.lock().headers.contains(name)
    }

    fn set_charset(&self, charset: Charset) -> &dyn HttpResponse {
        self.mutate("charset", |s| s.charset = charset)
    }

    fn charset(&self) -> Charset {
        self.lock().charset
    }

    fn content(&self, bytes: &[u8]) -> &dyn HttpResponse {
        self.mutate("content", |s| s.body.extend_from_slice(bytes))
    }

    fn content_str(&self, text: &str) -> &dyn HttpResponse {
        self.mutate("content", |s| {
            let encoded = s.charset.encode(text);
            s.body.extend_from_slice(&encoded);
        })
    }

    fn end(&self) -> Result<(), ResponseError> {
        self.seal()?;
        let response = self.take_response();
        self.flush(response)
    }

    fn error(&self, error: anyhow::Error) -> Result<(), ResponseError> {
        if let Err(e) = self.seal() {
            // The request already has its answer, but the failure still
            // belongs in the sink.
            self.app_sink.report(&self.context, &error);
            return Err(e);
        }

        let status = if error.downcast_ref::<PayloadTooLarge>().is_some() {
            StatusCode::PayloadTooLarge
        } else {
            StatusCode::InternalServerError
        };
        {
            let mut state = self.lock();
            state.status = status.as_u16();
            state.headers.set("Content-Type", "text/plain");
            state.body.clear();
            let diagnostic = format!("{:?}", error);
            state.body.extend_from_slice(diagnostic.as_bytes());
        }

        let response = self.take_response();
        let flushed = self.flush(response);
        self.app_sink.report(&self.context, &error);
        flushed
    }

    fn is_sealed(&self) -> bool {
        self.lock().phase != Phase::Open
    }
}
