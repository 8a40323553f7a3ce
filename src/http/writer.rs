use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::headers::Headers;
use crate::http::response::{Response, reason_phrase};

const HTTP_VERSION: &str = "HTTP/1.1";

/// Status line and header section, terminated by the blank line.
pub fn serialize_head(status: u16, headers: &Headers) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128 + headers.len() * 32);

    // Status line
    let status_line = format!("{} {} {}\r\n", HTTP_VERSION, status, reason_phrase(status));
    buf.extend_from_slice(status_line.as_bytes());

    // Headers
    for (k, v) in headers.iter() {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");

    buf
}

/// Serializes a complete response. `head_only` leaves the body off (HEAD
/// requests) while keeping the Content-Length the body would have had.
pub fn serialize_response(resp: &Response, head_only: bool) -> Bytes {
    let mut buf = serialize_head(resp.status, &resp.headers);

    // Body
    if !head_only {
        buf.extend_from_slice(&resp.body);
    }

    buf.freeze()
}

/// Writes one pre-serialized chunk to a stream, tracking partial progress.
pub struct ResponseWriter {
    buffer: Bytes,
    written: usize,
}

impl ResponseWriter {
    pub fn new(buffer: Bytes) -> Self {
        Self { buffer, written: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.written
    }

    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while self.written < self.buffer.len() {
            let n = stream.write(&self.buffer[self.written..]).await?;

            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "connection closed while writing",
                ));
            }

            self.written += n;
        }

        stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::{ResponseBuilder, StatusCode};

    #[test]
    fn head_only_keeps_content_length() {
        let response = ResponseBuilder::new(StatusCode::Ok).body("hello").build();
        let bytes = serialize_response(&response, true);
        assert_eq!(
            &bytes[..],
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n"
        );
    }

    #[test]
    fn unknown_status_gets_generic_phrase() {
        let head = serialize_head(599, &Headers::new());
        assert_eq!(&head[..], b"HTTP/1.1 599 Unknown\r\n\r\n");
    }

    #[tokio::test]
    async fn writes_everything_to_the_stream() {
        let mut out = Vec::new();
        let mut writer = ResponseWriter::new(Bytes::from_static(b"abc"));
        writer.write_to_stream(&mut out).await.unwrap();
        assert_eq!(out, b"abc");
        assert_eq!(writer.remaining(), 0);
    }
}
