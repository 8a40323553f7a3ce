use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use wicket::logging::{LoggingHandler, TracingLogSink};
use wicket::{
    Config, EventSourceConnection, EventSourceHandler, EventSourceMessage, TracingErrorSink,
    WebServer, WebSocketConnection, WebSocketHandler, handler_fn,
};

struct Echo;

impl WebSocketHandler for Echo {
    fn on_message(&self, connection: &WebSocketConnection, message: &str) -> anyhow::Result<()> {
        connection.send(message)?;
        Ok(())
    }

    fn on_binary(&self, connection: &WebSocketConnection, data: &[u8]) -> anyhow::Result<()> {
        connection.send_binary(data)?;
        Ok(())
    }
}

struct Greeting;

impl EventSourceHandler for Greeting {
    fn on_open(&self, connection: &EventSourceConnection) -> anyhow::Result<()> {
        connection.send(
            &EventSourceMessage::new("hello")
                .event("greeting")
                .retry(Duration::from_secs(5)),
        )?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;

    let server = WebServer::new(cfg)
        .add(LoggingHandler::new(Arc::new(TracingLogSink)))
        .add_websocket("/ws", Echo)
        .add_event_source("/events", Greeting)
        .add_path(
            "/",
            handler_fn(|_request, response, _control| {
                response
                    .header("Content-Type", "text/plain")
                    .content_str("Hello World");
                response.end()?;
                Ok(())
            }),
        )
        .application_error_sink(TracingErrorSink::default())
        .start()
        .await?;

    tracing::info!(uri = %server.uri()?, "Serving");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    server.stop().await
}
