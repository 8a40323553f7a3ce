//! WebSocket upgrade and framing against a live server.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{WsClient, config, exchange, next_report, reports, upgrade_request};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use wicket::websocket::frame::{Frame, close_code};
use wicket::{Config, PersistentConnection, WebServer, WebSocketConnection, WebSocketHandler};

/// Echoes messages back and reports lifecycle callbacks.
struct Recorder(UnboundedSender<String>);

impl WebSocketHandler for Recorder {
    fn on_open(&self, connection: &WebSocketConnection) -> anyhow::Result<()> {
        let _ = self.0.send(format!("open {}", connection.version()));
        Ok(())
    }

    fn on_close(&self, _connection: &WebSocketConnection) -> anyhow::Result<()> {
        let _ = self.0.send("close".to_string());
        Ok(())
    }

    fn on_message(&self, connection: &WebSocketConnection, message: &str) -> anyhow::Result<()> {
        let _ = self.0.send(format!("message {}", message));
        match message {
            "bye" => connection.close()?,
            "fail" => anyhow::bail!("refused"),
            "big ping" => match connection.ping(&[7u8; 200]) {
                Ok(()) => connection.send("sent")?,
                Err(e) => connection.send(&e.to_string())?,
            },
            _ => connection.send(message)?,
        }
        Ok(())
    }

    fn on_binary(&self, connection: &WebSocketConnection, data: &[u8]) -> anyhow::Result<()> {
        connection.send_binary(data)?;
        Ok(())
    }
}

async fn next_event(rx: &mut UnboundedReceiver<String>) -> String {
    tokio::time::timeout(common::WAIT, rx.recv())
        .await
        .expect("no callback fired")
        .expect("handler dropped")
}

async fn echo_server(cfg: Config) -> (wicket::RunningServer, UnboundedReceiver<String>) {
    let (tx, rx) = unbounded_channel();
    let server = WebServer::new(cfg)
        .add_websocket("/ws", Recorder(tx))
        .start()
        .await
        .unwrap();
    (server, rx)
}

fn masked(first: u8, payload: &[u8]) -> Vec<u8> {
    let key = [1u8, 2, 3, 4];
    let mut out = vec![first, 0x80 | payload.len() as u8];
    out.extend_from_slice(&key);
    out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    out
}

#[tokio::test]
async fn test_handshake_and_echo() {
    let (server, mut events) = echo_server(config()).await;
    let mut client = WsClient::connect(server.local_addr(), "/ws").await;

    assert!(client.head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(client.head.contains("Upgrade: websocket\r\n"));
    assert!(client.head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    assert!(!client.head.contains("Content-Length"));
    assert_eq!(next_event(&mut events).await, "open Sec-WebSocket-Version-13");

    client.send(Frame::Text("ping".to_string())).await;
    assert_eq!(client.recv().await, Some(Frame::Text("ping".to_string())));

    client.send(Frame::Binary(Bytes::from_static(&[0, 1, 2]))).await;
    assert_eq!(
        client.recv().await,
        Some(Frame::Binary(Bytes::from_static(&[0, 1, 2])))
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_ping_is_answered_with_matching_pong() {
    let (server, _events) = echo_server(config()).await;
    let mut client = WsClient::connect(server.local_addr(), "/ws").await;

    client.send(Frame::Ping(Bytes::from_static(b"abc"))).await;

    assert_eq!(
        client.recv().await,
        Some(Frame::Pong(Bytes::from_static(b"abc")))
    );
    server.stop().await.unwrap();
}

/// Records pings and never answers them.
struct Silent(UnboundedSender<String>);

impl WebSocketHandler for Silent {
    fn on_message(&self, connection: &WebSocketConnection, message: &str) -> anyhow::Result<()> {
        connection.send(message)?;
        Ok(())
    }

    fn on_ping(&self, _connection: &WebSocketConnection, payload: &[u8]) -> anyhow::Result<()> {
        let _ = self.0.send(format!("ping {}", String::from_utf8_lossy(payload)));
        Ok(())
    }
}

#[tokio::test]
async fn test_overridden_on_ping_suppresses_the_pong() {
    let (tx, mut events) = unbounded_channel();
    let server = WebServer::new(config())
        .add_websocket("/ws", Silent(tx))
        .start()
        .await
        .unwrap();
    let mut client = WsClient::connect(server.local_addr(), "/ws").await;

    client.send(Frame::Ping(Bytes::from_static(b"abc"))).await;
    client.send(Frame::Text("after".to_string())).await;

    assert_eq!(next_event(&mut events).await, "ping abc");
    assert_eq!(client.recv().await, Some(Frame::Text("after".to_string())));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_oversized_ping_is_refused_before_the_wire() {
    let (server, _events) = echo_server(config()).await;
    let mut client = WsClient::connect(server.local_addr(), "/ws").await;

    client.send(Frame::Text("big ping".to_string())).await;

    assert_eq!(
        client.recv().await,
        Some(Frame::Text(
            "refusing to send invalid frame: control frame payload of 200 bytes exceeds 125"
                .to_string()
        ))
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_fragmented_message_is_reassembled() {
    let (server, _events) = echo_server(config()).await;
    let mut client = WsClient::connect(server.local_addr(), "/ws").await;

    // text without FIN, a ping in between, then the final continuation
    let mut wire = masked(0x01, b"hel");
    wire.extend(masked(0x89, b"p"));
    wire.extend(masked(0x80, b"lo"));
    client.stream.write_all(&wire).await.unwrap();

    assert_eq!(
        client.recv().await,
        Some(Frame::Pong(Bytes::from_static(b"p")))
    );
    assert_eq!(client.recv().await, Some(Frame::Text("hello".to_string())));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_close_is_echoed_and_on_close_fires_once() {
    let (server, mut events) = echo_server(config()).await;
    let mut client = WsClient::connect(server.local_addr(), "/ws").await;
    next_event(&mut events).await;

    client
        .send(Frame::close(close_code::GOING_AWAY, "leaving"))
        .await;

    assert_eq!(
        client.recv().await,
        Some(Frame::close(close_code::GOING_AWAY, ""))
    );
    assert_eq!(client.recv().await, None);
    assert_eq!(next_event(&mut events).await, "close");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_close_waits_for_peer() {
    let (server, mut events) = echo_server(config()).await;
    let mut client = WsClient::connect(server.local_addr(), "/ws").await;
    next_event(&mut events).await;

    client.send(Frame::Text("bye".to_string())).await;
    assert_eq!(
        client.recv().await,
        Some(Frame::close(close_code::NORMAL, ""))
    );
    assert_eq!(next_event(&mut events).await, "message bye");

    // data arriving while closing is dropped
    client.send(Frame::Text("too late".to_string())).await;
    client.send(Frame::close(close_code::NORMAL, "")).await;
    assert_eq!(client.recv().await, None);
    assert_eq!(next_event(&mut events).await, "close");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_abrupt_disconnect_is_a_transport_error() {
    let (tx, mut events) = unbounded_channel();
    let (app_sink, mut app_errors) = reports();
    let (transport_sink, mut transport_errors) = reports();
    let server = WebServer::new(config())
        .add_websocket("/ws", Recorder(tx))
        .application_error_sink(app_sink)
        .connection_error_sink(transport_sink)
        .start()
        .await
        .unwrap();
    let client = WsClient::connect(server.local_addr(), "/ws").await;
    next_event(&mut events).await;

    drop(client);

    let report = next_report(&mut transport_errors).await;
    assert!(report.contains("(websocket)"), "{}", report);
    assert!(
        report.contains("peer closed the connection without a close handshake"),
        "{}",
        report
    );
    assert_eq!(next_event(&mut events).await, "close");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(app_errors.try_recv().is_err());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_callback_error_is_reported_and_connection_survives() {
    let (tx, _events) = unbounded_channel();
    let (sink, mut errors) = reports();
    let server = WebServer::new(config())
        .add_websocket("/ws", Recorder(tx))
        .application_error_sink(sink)
        .start()
        .await
        .unwrap();
    let mut client = WsClient::connect(server.local_addr(), "/ws").await;

    client.send(Frame::Text("fail".to_string())).await;
    let report = next_report(&mut errors).await;
    assert!(report.contains("(websocket)"), "{}", report);
    assert!(report.contains("WebSocket on_message failed: refused"), "{}", report);

    client.send(Frame::Text("still here".to_string())).await;
    assert_eq!(
        client.recv().await,
        Some(Frame::Text("still here".to_string()))
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unmasked_frame_closes_with_protocol_error() {
    let (tx, mut events) = unbounded_channel();
    let (sink, mut errors) = reports();
    let server = WebServer::new(config())
        .add_websocket("/ws", Recorder(tx))
        .connection_error_sink(sink)
        .start()
        .await
        .unwrap();
    let mut client = WsClient::connect(server.local_addr(), "/ws").await;
    next_event(&mut events).await;

    client.stream.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();

    assert_eq!(
        client.recv().await,
        Some(Frame::close(close_code::PROTOCOL_ERROR, ""))
    );
    assert!(next_report(&mut errors).await.contains("websocket framing error"));
    assert_eq!(next_event(&mut events).await, "close");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_oversized_frame_closes_with_message_too_big() {
    let (server, _events) = echo_server(Config {
        max_websocket_frame_size: 8,
        ..config()
    })
    .await;
    let mut client = WsClient::connect(server.local_addr(), "/ws").await;

    client
        .send(Frame::Text("this is far too long".to_string()))
        .await;

    assert_eq!(
        client.recv().await,
        Some(Frame::close(close_code::MESSAGE_TOO_BIG, ""))
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unsupported_version_gets_426() {
    let (server, mut events) = echo_server(config()).await;

    let mut stream = tokio::net::TcpStream::connect(server.local_addr())
        .await
        .unwrap();
    stream
        .write_all(upgrade_request("/ws", "99").as_bytes())
        .await
        .unwrap();
    let (head, _) = common::read_head(&mut stream).await;

    assert!(head.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
    assert!(head.contains("Sec-WebSocket-Version: 13\r\n"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_plain_get_to_websocket_path_gets_400() {
    let (server, _events) = echo_server(config()).await;

    let reply = exchange(
        server.local_addr(),
        b"GET /ws HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_older_protocol_versions_are_accepted() {
    let (server, mut events) = echo_server(config()).await;
    let mut stream = tokio::net::TcpStream::connect(server.local_addr())
        .await
        .unwrap();
    stream
        .write_all(upgrade_request("/ws", "8").as_bytes())
        .await
        .unwrap();

    let (head, _) = common::read_head(&mut stream).await;

    assert!(head.starts_with("HTTP/1.1 101 "));
    assert_eq!(next_event(&mut events).await, "open Sec-WebSocket-Version-8");
    server.stop().await.unwrap();
}
