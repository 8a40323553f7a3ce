//! Opening handshake (RFC 6455 §4.2).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::http::headers::Headers;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Protocol versions accepted, newest first. 7 and 8 are the late drafts
/// that share the final framing.
pub const SUPPORTED_VERSIONS: [&str; 3] = ["13", "8", "7"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("websocket upgrade requires GET, got {0}")]
    Method(Method),
    #[error("missing or invalid Upgrade header")]
    Upgrade,
    #[error("Connection header does not contain 'upgrade'")]
    Connection,
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("Sec-WebSocket-Key is not 16 bytes of base64")]
    InvalidKey,
    #[error("missing Sec-WebSocket-Version header")]
    MissingVersion,
    #[error("unsupported websocket version {0}")]
    UnsupportedVersion(String),
}

impl HandshakeError {
    /// The rejection sent on the wire in place of the 101.
    pub fn rejection(&self) -> Response {
        match self {
            HandshakeError::UnsupportedVersion(_) => {
                ResponseBuilder::new(StatusCode::UpgradeRequired)
                    .header("Sec-WebSocket-Version", SUPPORTED_VERSIONS[0])
                    .header("Content-Type", "text/plain")
                    .body(self.to_string())
                    .build()
            }
            _ => ResponseBuilder::new(StatusCode::BadRequest)
                .header("Content-Type", "text/plain")
                .body(self.to_string())
                .build(),
        }
    }
}

/// What a validated upgrade request asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub key: String,
    pub version: String,
}

/// Compute the `Sec-WebSocket-Accept` value from the client's
/// `Sec-WebSocket-Key` header (RFC 6455 §4.2.2 step 4).
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Checks that a request is a well-formed upgrade request.
pub fn validate(request: &Request) -> Result<Handshake, HandshakeError> {
    if request.method() != Method::GET {
        return Err(HandshakeError::Method(request.method()));
    }

    let headers = request.all_headers();
    if !headers.has_token("Upgrade", "websocket") {
        return Err(HandshakeError::Upgrade);
    }
    if !headers.has_token("Connection", "upgrade") {
        return Err(HandshakeError::Connection);
    }

    let key = headers
        .get("Sec-WebSocket-Key")
        .map(str::trim)
        .ok_or(HandshakeError::MissingKey)?;
    match STANDARD.decode(key) {
        Ok(decoded) if decoded.len() == 16 => {}
        _ => return Err(HandshakeError::InvalidKey),
    }

    let version = headers
        .get("Sec-WebSocket-Version")
        .map(str::trim)
        .ok_or(HandshakeError::MissingVersion)?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(HandshakeError::UnsupportedVersion(version.to_string()));
    }

    Ok(Handshake {
        key: key.to_string(),
        version: version.to_string(),
    })
}

/// The 101 response. `extra` carries headers handlers set before upgrading.
pub fn accept_response(handshake: &Handshake, extra: Headers) -> Response {
    let mut headers = extra;
    headers.set("Upgrade", "websocket");
    headers.set("Connection", "Upgrade");
    headers.set("Sec-WebSocket-Accept", accept_key(&handshake.key));
    headers.remove("Content-Length");
    ResponseBuilder::new(StatusCode::SwitchingProtocols)
        .headers(headers)
        .streaming()
        .build()
}
