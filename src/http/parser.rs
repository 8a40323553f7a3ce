use std::net::SocketAddr;
use std::time::SystemTime;

use bytes::Bytes;

use crate::http::headers::Headers;
use crate::http::request::{Method, Request};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidVersion,
    InvalidHeader,
    InvalidContentLength,
    InvalidChunk,
    TooLarge { what: &'static str, limit: usize },
    Incomplete,
}

/// Size limits enforced while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    pub max_initial_line_length: usize,
    pub max_header_size: usize,
    pub max_content_length: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_initial_line_length: 4096,
            max_header_size: 8192,
            max_content_length: 65536,
        }
    }
}

/// Request as it came off the wire, before the connection attaches its
/// address, id and arrival time.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl ParsedRequest {
    pub fn into_request(self, remote_addr: SocketAddr, id: u64) -> Request {
        Request::received(
            self.method,
            self.uri,
            self.version,
            self.headers,
            Bytes::from(self.body),
            remote_addr,
            id,
            SystemTime::now(),
        )
    }
}

/// Parses one request from the front of `buf` using default limits.
///
/// Returns the request and the number of bytes it occupied, or
/// `ParseError::Incomplete` when more input is needed.
pub fn parse_http_request(buf: &[u8]) -> Result<(ParsedRequest, usize), ParseError> {
    parse_http_request_with(buf, &ParseLimits::default())
}

pub fn parse_http_request_with(
    buf: &[u8],
    limits: &ParseLimits,
) -> Result<(ParsedRequest, usize), ParseError> {
    // Tolerate stray CRLFs between pipelined requests
    let skipped = leading_crlf(buf);
    let buf = &buf[skipped..];

    // Look for header/body separator
    let Some(headers_end) = find_headers_end(buf) else {
        check_partial_head(buf, limits)?;
        return Err(ParseError::Incomplete);
    };
    let header_bytes = &buf[..headers_end];
    let body_bytes = &buf[headers_end + 4..];

    let headers_str = std::str::from_utf8(header_bytes).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    if request_line.len() > limits.max_initial_line_length {
        return Err(ParseError::TooLarge {
            what: "request line",
            limit: limits.max_initial_line_length,
        });
    }
    if headers_end - request_line.len() > limits.max_header_size {
        return Err(ParseError::TooLarge {
            what: "header section",
            limit: limits.max_header_size,
        });
    }

    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let uri = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;
    if !version.starts_with("HTTP/1.") {
        return Err(ParseError::InvalidVersion);
    }

    // Headers
    let mut headers = Headers::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(ParseError::InvalidHeader);
        }

        headers.add(key, value.trim());
    }

    // Body
    let (body, body_consumed) = if headers.has_token("Transfer-Encoding", "chunked") {
        decode_chunked(body_bytes, limits.max_content_length)?
    } else {
        let content_length = headers
            .get("Content-Length")
            .map(|v| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| ParseError::InvalidContentLength)
            })
            .transpose()?
            .unwrap_or(0);

        if content_length > limits.max_content_length {
            return Err(ParseError::TooLarge {
                what: "request body",
                limit: limits.max_content_length,
            });
        }

        if body_bytes.len() < content_length {
            return Err(ParseError::Incomplete);
        }

        (body_bytes[..content_length].to_vec(), content_length)
    };

    let request = ParsedRequest {
        method,
        uri: uri.to_string(),
        version: version.to_string(),
        headers,
        body,
    };

    let total_consumed = skipped + headers_end + 4 + body_consumed;
    Ok((request, total_consumed))
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn leading_crlf(buf: &[u8]) -> usize {
    buf.chunks(2).take_while(|c| *c == b"\r\n").count() * 2
}

/// Rejects a head that can no longer fit the limits even before it is complete.
fn check_partial_head(buf: &[u8], limits: &ParseLimits) -> Result<(), ParseError> {
    match find_crlf(buf) {
        None if buf.len() > limits.max_initial_line_length => Err(ParseError::TooLarge {
            what: "request line",
            limit: limits.max_initial_line_length,
        }),
        Some(line_end) if buf.len() - line_end > limits.max_header_size + 4 => {
            Err(ParseError::TooLarge {
                what: "header section",
                limit: limits.max_header_size,
            })
        }
        _ => Ok(()),
    }
}

/// Decodes a chunked body. Returns the body and the bytes consumed, trailers
/// included.
fn decode_chunked(buf: &[u8], limit: usize) -> Result<(Vec<u8>, usize), ParseError> {
    let mut pos = 0;
    let mut body = Vec::new();

    loop {
        let line_end = find_crlf(&buf[pos..]).ok_or(ParseError::Incomplete)?;
        let size_line =
            std::str::from_utf8(&buf[pos..pos + line_end]).map_err(|_| ParseError::InvalidChunk)?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).map_err(|_| ParseError::InvalidChunk)?;
        pos += line_end + 2;

        if size == 0 {
            // Trailer section, ends with an empty line
            loop {
                let end = find_crlf(&buf[pos..]).ok_or(ParseError::Incomplete)?;
                pos += end + 2;
                if end == 0 {
                    return Ok((body, pos));
                }
            }
        }

        if body.len().saturating_add(size) > limit {
            return Err(ParseError::TooLarge {
                what: "request body",
                limit,
            });
        }
        if buf.len() < pos + size + 2 {
            return Err(ParseError::Incomplete);
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Err(ParseError::InvalidChunk);
        }
        pos += size + 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (parsed, consumed) = parse_http_request(req).unwrap();

        assert_eq!(parsed.uri, "/");
        assert_eq!(parsed.headers.get("host").unwrap(), "example.com");
        assert_eq!(consumed, req.len());
    }

    #[test]
    fn parse_chunked_body_with_trailer() {
        let req = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
            5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\nGET";

        let (parsed, consumed) = parse_http_request(req).unwrap();

        assert_eq!(parsed.body, b"hello world".to_vec());
        assert_eq!(&req[consumed..], b"GET");
    }

    #[test]
    fn partial_chunked_body_is_incomplete() {
        let req = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhel";
        assert_eq!(parse_http_request(req).unwrap_err(), ParseError::Incomplete);
    }

    #[test]
    fn oversized_request_line_is_rejected_before_completion() {
        let limits = ParseLimits {
            max_initial_line_length: 16,
            ..ParseLimits::default()
        };
        let req = b"GET /a-very-long-path-indeed";
        assert!(matches!(
            parse_http_request_with(req, &limits),
            Err(ParseError::TooLarge { what: "request line", .. })
        ));
    }

    #[test]
    fn oversized_body_is_rejected() {
        let limits = ParseLimits {
            max_content_length: 4,
            ..ParseLimits::default()
        };
        let req = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        assert!(matches!(
            parse_http_request_with(req, &limits),
            Err(ParseError::TooLarge { what: "request body", limit: 4 })
        ));
    }

    #[test]
    fn leading_blank_lines_are_skipped() {
        let req = b"\r\n\r\nGET /x HTTP/1.1\r\n\r\n";
        let (parsed, consumed) = parse_http_request(req).unwrap();
        assert_eq!(parsed.uri, "/x");
        assert_eq!(consumed, req.len());
    }
}
