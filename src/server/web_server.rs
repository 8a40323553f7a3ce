use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::Config;
use crate::eventsource::EventSourceHandler;
use crate::executor::{HandlerExecutor, SharedExecutor};
use crate::http::handler::{
    DateHeaderHandler, HttpHandler, HttpToEventSourceHandler, HttpToWebSocketHandler,
    PathMatchHandler, ServerHeaderHandler, SharedHandler,
};
use crate::server::{ServerContext, listener};
use crate::sink::{ErrorSink, PrintErrorSink, SharedSink, SilentErrorSink};
use crate::websocket::WebSocketHandler;

/// Builder for a server.
///
/// Handlers run in the order they were added, after the default `Server` and
/// `Date` header handlers.
///
/// ```no_run
/// # use wicket::{Config, WebServer, handler_fn};
/// # async fn demo() -> anyhow::Result<()> {
/// let server = WebServer::new(Config::default())
///     .add(handler_fn(|_req, res, _ctl| {
///         res.header("Content-Type", "text/plain").content_str("Hello World");
///         res.end()?;
///         Ok(())
///     }))
///     .start()
///     .await?;
/// println!("listening on {}", server.uri()?);
/// # Ok(())
/// # }
/// ```
pub struct WebServer {
    config: Config,
    handlers: Vec<SharedHandler>,
    executor: Option<SharedExecutor>,
    app_sink: SharedSink,
    transport_sink: SharedSink,
}

impl WebServer {
    pub fn new(config: Config) -> Self {
        let handlers: Vec<SharedHandler> = vec![
            Arc::new(ServerHeaderHandler::new(config.server_header.clone())),
            Arc::new(DateHeaderHandler),
        ];
        Self {
            config,
            handlers,
            executor: None,
            app_sink: Arc::new(PrintErrorSink),
            transport_sink: Arc::new(SilentErrorSink),
        }
    }

    pub fn add(mut self, handler: impl HttpHandler) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn add_shared(mut self, handler: SharedHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Adds a handler that only sees requests for exactly `path`.
    pub fn add_path(self, path: &str, handler: impl HttpHandler) -> Self {
        self.add(PathMatchHandler::new(path, Arc::new(handler)))
    }

    pub fn add_websocket(self, path: &str, handler: impl WebSocketHandler) -> Self {
        self.add(PathMatchHandler::new(
            path,
            Arc::new(HttpToWebSocketHandler::new(Arc::new(handler))),
        ))
    }

    pub fn add_event_source(self, path: &str, handler: impl EventSourceHandler) -> Self {
        self.add(PathMatchHandler::new(
            path,
            Arc::new(HttpToEventSourceHandler::new(Arc::new(handler))),
        ))
    }

    /// Where handler failures go. Defaults to [`PrintErrorSink`].
    pub fn application_error_sink(mut self, sink: impl ErrorSink) -> Self {
        self.app_sink = Arc::new(sink);
        self
    }

    /// Where transport failures go. Defaults to [`SilentErrorSink`].
    pub fn connection_error_sink(mut self, sink: impl ErrorSink) -> Self {
        self.transport_sink = Arc::new(sink);
        self
    }

    /// Runs handlers on `executor` instead of a dedicated thread.
    pub fn executor(mut self, executor: SharedExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Binds the listener and starts accepting connections.
    pub async fn start(self) -> anyhow::Result<RunningServer> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.config.listen_addr))?;
        let local_addr = listener.local_addr()?;

        let (executor, owned_executor) = match self.executor {
            Some(executor) => (executor, None),
            None => {
                let owned = HandlerExecutor::new(self.config.executor_thread_name.clone())
                    .context("starting handler executor")?;
                (owned.clone() as SharedExecutor, Some(owned))
            }
        };

        let context = Arc::new(ServerContext::new(
            self.handlers.into(),
            executor,
            self.app_sink,
            self.transport_sink,
            self.config.parse_limits(),
            self.config.max_websocket_frame_size,
            self.config.stale_timeout(),
        ));

        let (shutdown, shutdown_rx) = oneshot::channel();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let task = tokio::spawn(async move {
            listener::run(listener, context, shutdown_rx).await;
            flag.store(false, Ordering::Release);
        });

        tracing::info!(addr = %local_addr, "Listening");
        Ok(RunningServer {
            local_addr,
            shutdown: Some(shutdown),
            task: Some(task),
            running,
            owned_executor,
        })
    }
}

/// Handle to a started server.
pub struct RunningServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    owned_executor: Option<Arc<HandlerExecutor>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://host:port/` for the bound address.
    pub fn uri(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("http://{}/", self.local_addr))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops accepting, drops open connections and drains the handler
    /// executor if the server owns it.
    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.context("listener task failed")?;
        }
        if let Some(executor) = self.owned_executor.take() {
            tokio::task::spawn_blocking(move || executor.shutdown())
                .await
                .context("stopping handler executor")?;
        }
        tracing::info!(addr = %self.local_addr, "Server stopped");
        Ok(())
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}
