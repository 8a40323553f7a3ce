//! Loopback helpers shared by the server tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use wicket::websocket::frame::{Frame, Reassembler, Role, decode_frame, encode_frame};
use wicket::{Config, ErrorContext, ErrorSink};

pub const WAIT: Duration = Duration::from_secs(5);

/// Config bound to a free loopback port.
pub fn config() -> Config {
    Config {
        listen_addr: "127.0.0.1:0".to_string(),
        ..Config::default()
    }
}

/// Error sink that forwards each report as `"{context} | {error:#}"`.
pub struct Reports(UnboundedSender<String>);

impl ErrorSink for Reports {
    fn report(&self, context: &ErrorContext, error: &anyhow::Error) {
        let _ = self.0.send(format!("{} | {:#}", context, error));
    }
}

pub fn reports() -> (Reports, UnboundedReceiver<String>) {
    let (tx, rx) = unbounded_channel();
    (Reports(tx), rx)
}

pub async fn next_report(rx: &mut UnboundedReceiver<String>) -> String {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no report arrived")
        .expect("sink dropped")
}

/// Writes `raw` and reads until the server closes the connection.
pub async fn exchange(addr: SocketAddr, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    read_to_close(&mut stream).await
}

pub async fn read_to_close(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut out))
        .await
        .expect("server did not close the connection")
        .unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

/// Reads until a full response head has arrived. Returns the head and
/// whatever followed it.
pub async fn read_head(stream: &mut TcpStream) -> (String, BytesMut) {
    let mut buf = BytesMut::new();
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = buf.split_to(end + 4);
            return (String::from_utf8_lossy(&head).into_owned(), buf);
        }
        let n = tokio::time::timeout(WAIT, stream.read_buf(&mut buf))
            .await
            .expect("head did not arrive")
            .unwrap();
        assert!(n > 0, "connection closed before the head was complete");
    }
}

pub fn upgrade_request(path: &str, version: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: {}\r\n\r\n",
        path, version
    )
}

/// Client end of a WebSocket.
pub struct WsClient {
    pub stream: TcpStream,
    pub head: String,
    buffer: BytesMut,
    reassembler: Reassembler,
}

impl WsClient {
    pub async fn connect(addr: SocketAddr, path: &str) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(upgrade_request(path, "13").as_bytes())
            .await
            .unwrap();
        let (head, buffer) = read_head(&mut stream).await;
        Self {
            stream,
            head,
            buffer,
            reassembler: Reassembler::new(1 << 20),
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        let bytes = encode_frame(&frame, Some([0x37, 0xfa, 0x21, 0x3d])).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Next complete frame, or `None` if the server closed the socket.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            while let Some(raw) = decode_frame(&mut self.buffer, Role::Client, 1 << 20).unwrap() {
                if let Some(frame) = self.reassembler.push(raw).unwrap() {
                    return Some(frame);
                }
            }
            let n = tokio::time::timeout(WAIT, self.stream.read_buf(&mut self.buffer))
                .await
                .expect("no frame arrived")
                .unwrap();
            if n == 0 {
                return None;
            }
        }
    }
}
