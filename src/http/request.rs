use std::borrow::Cow;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use bytes::Bytes;

use crate::data::DataMap;
use crate::http::headers::Headers;
use crate::http::query::QueryParameters;

/// HTTP request methods.
///
/// Anything outside this set is rejected by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// CONNECT - Establish a tunnel
    CONNECT,
    /// TRACE - Loop-back test
    TRACE,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// # Example
    ///
    /// ```
    /// # use wicket::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            "CONNECT" => Some(Method::CONNECT),
            "TRACE" => Some(Method::TRACE),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed HTTP request.
///
/// The protocol facts are fixed once parsed. Cloning is cheap, and clones share
/// the [`DataMap`] side-channel, so annotations made by one handler are visible
/// to every later handler and to connections upgraded from this request.
#[derive(Clone)]
pub struct Request {
    method: Method,
    uri: String,
    version: String,
    headers: Arc<Headers>,
    body: Bytes,
    remote_addr: SocketAddr,
    id: u64,
    timestamp: SystemTime,
    data: DataMap,
    query: Arc<OnceLock<QueryParameters>>,
    form: Arc<OnceLock<QueryParameters>>,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn received(
        method: Method,
        uri: String,
        version: String,
        headers: Headers,
        body: Bytes,
        remote_addr: SocketAddr,
        id: u64,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            method,
            uri,
            version,
            headers: Arc::new(headers),
            body,
            remote_addr,
            id,
            timestamp,
            data: DataMap::new(),
            query: Arc::new(OnceLock::new()),
            form: Arc::new(OnceLock::new()),
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// The request target as sent, query string included.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The request target without its query string.
    pub fn path(&self) -> &str {
        self.uri.split(['?', '#']).next().unwrap_or("")
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// First value of a header, looked up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// All values of a header.
    pub fn headers(&self, name: &str) -> Vec<&str> {
        self.headers.get_all(name)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    pub fn all_headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body decoded as UTF-8, invalid sequences replaced.
    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Server-wide request sequence number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the request finished arriving.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn data(&self) -> &DataMap {
        &self.data
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query_parameters().first(key)
    }

    pub fn query_params(&self, key: &str) -> Vec<Option<&str>> {
        self.query_parameters().all(key)
    }

    pub fn query_param_keys(&self) -> Vec<&str> {
        self.query_parameters().keys()
    }

    /// Form parameter from a urlencoded body.
    pub fn post_param(&self, key: &str) -> Option<&str> {
        self.form_parameters().first(key)
    }

    pub fn post_params(&self, key: &str) -> Vec<Option<&str>> {
        self.form_parameters().all(key)
    }

    pub fn post_param_keys(&self) -> Vec<&str> {
        self.form_parameters().keys()
    }

    fn query_parameters(&self) -> &QueryParameters {
        self.query.get_or_init(|| QueryParameters::from_uri(&self.uri))
    }

    fn form_parameters(&self) -> &QueryParameters {
        self.form
            .get_or_init(|| QueryParameters::from_form(&self.body_str()))
    }

    /// Parses the Content-Length header as a usize.
    ///
    /// Returns 0 if the header is missing or not a valid number.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Whether the connection should stay open after the response.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is present.
    /// HTTP/1.0 defaults to close unless `Connection: keep-alive` is present.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return false;
        }
        if self.version.eq_ignore_ascii_case("HTTP/1.0") {
            return self.headers.has_token("Connection", "keep-alive");
        }
        true
    }

    /// A copy of this request with a different target. Data is still shared.
    pub fn with_uri(&self, uri: impl Into<String>) -> Request {
        Request {
            uri: uri.into(),
            query: Arc::new(OnceLock::new()),
            ..self.clone()
        }
    }

    /// `METHOD uri`, used in logs and failure context.
    pub fn summary(&self) -> String {
        format!("{} {}", self.method, self.uri)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .field("remote_addr", &self.remote_addr)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.remote_addr, self.method, self.uri)
    }
}

/// Builder for constructing Request objects.
pub struct RequestBuilder {
    method: Option<Method>,
    uri: Option<String>,
    version: Option<String>,
    headers: Headers,
    body: Bytes,
    remote_addr: SocketAddr,
    id: u64,
    timestamp: Option<SystemTime>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            uri: None,
            version: None,
            headers: Headers::new(),
            body: Bytes::new(),
            remote_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            id: 0,
            timestamp: None,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(key, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = addr;
        self
    }

    pub fn id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        Ok(Request::received(
            self.method.ok_or("method missing")?,
            self.uri.ok_or("uri missing")?,
            self.version.unwrap_or_else(|| "HTTP/1.1".to_string()),
            self.headers,
            self.body,
            self.remote_addr,
            self.id,
            self.timestamp.unwrap_or_else(SystemTime::now),
        ))
    }
}
