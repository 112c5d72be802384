//! Transport configuration and lifecycle
//!
//! [`HttpTransport`] owns the shared state (sessions, correlations, reply
//! waiters) for its whole life. `start()` binds the listener and spawns the
//! accept loop; `close()` stops it, ends every stream and tells the upstream.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tandem_json_rpc::JsonRpcMessage;

use crate::correlator::PendingRequests;
use crate::handler::RequestHandler;
use crate::protocol::DEFAULT_PROTOCOL_VERSION;
use crate::reply_waiters::ReplyWaiters;
use crate::router::{Delivery, OutboundRouter};
use crate::session_registry::{SessionRegistry, StreamConfig};
use crate::upstream::{MessageHandler, NoopHandler};
use crate::{Result, TransportError};

/// Configuration for the HTTP transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address to bind to
    pub bind_address: SocketAddr,
    /// Path of the single endpoint serving GET and POST
    pub path: String,
    /// Accepted values of the protocol version header
    pub protocol_versions: Vec<String>,
    /// Origins (full origin or bare host) allowed besides loopback
    pub allowed_origins: Vec<String>,
    /// Enable CORS
    pub enable_cors: bool,
    /// Maximum request body size
    pub max_body_size: usize,
    /// Request method whose reply is returned inline in the POST response
    pub handshake_method: String,
    /// Also reply inline to any request from a client that accepts JSON but not event streams
    pub sync_reply_for_json_only: bool,
    /// Answer a correlated POST with its own event stream when the session has none open
    pub enable_post_sse: bool,
    /// Per-session stream settings
    pub stream: StreamConfig,
    /// Age at which the background sweeper drops an unanswered correlation
    pub pending_max_age: Duration,
    /// Run a sweeper at this interval; `None` leaves sweeping to the host
    pub pending_sweep_interval: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8000)),
            path: "/mcp".to_string(),
            protocol_versions: vec![DEFAULT_PROTOCOL_VERSION.to_string()],
            allowed_origins: Vec::new(),
            enable_cors: true,
            max_body_size: 1024 * 1024, // 1MB
            handshake_method: "initialize".to_string(),
            sync_reply_for_json_only: false,
            enable_post_sse: false,
            stream: StreamConfig::default(),
            pending_max_age: Duration::from_secs(30),
            pending_sweep_interval: None,
        }
    }
}

/// Builder for [`HttpTransport`]
pub struct HttpTransportBuilder {
    config: TransportConfig,
    handler: Option<Arc<dyn MessageHandler>>,
}

impl HttpTransportBuilder {
    pub fn new() -> Self {
        Self {
            config: TransportConfig::default(),
            handler: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the bind address
    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.config.bind_address = addr;
        self
    }

    /// Set the endpoint path
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Replace the list of supported protocol versions
    pub fn protocol_versions<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.protocol_versions = versions.into_iter().map(Into::into).collect();
        self
    }

    /// Allow an origin in addition to loopback
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.config.allowed_origins.push(origin.into());
        self
    }

    /// Enable or disable CORS
    pub fn cors(mut self, enable: bool) -> Self {
        self.config.enable_cors = enable;
        self
    }

    /// Set maximum request body size
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    pub fn handshake_method(mut self, method: impl Into<String>) -> Self {
        self.config.handshake_method = method.into();
        self
    }

    pub fn sync_reply_for_json_only(mut self, enable: bool) -> Self {
        self.config.sync_reply_for_json_only = enable;
        self
    }

    /// Enable or disable per-call POST event streams (disabled by default)
    pub fn post_sse(mut self, enable: bool) -> Self {
        self.config.enable_post_sse = enable;
        self
    }

    /// Configure SSE streaming settings
    pub fn stream_config(mut self, config: StreamConfig) -> Self {
        self.config.stream = config;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.stream.keepalive_interval = interval;
        self
    }

    pub fn pending_max_age(mut self, max_age: Duration) -> Self {
        self.config.pending_max_age = max_age;
        self
    }

    /// Sweep stale correlations in the background every `interval`
    pub fn pending_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.pending_sweep_interval = Some(interval);
        self
    }

    /// Set the upstream message handler
    pub fn handler<H>(mut self, handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn shared_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Build the transport. Nothing is bound until `start()`.
    pub fn build(self) -> HttpTransport {
        let config = Arc::new(self.config);
        let upstream = self
            .handler
            .unwrap_or_else(|| Arc::new(NoopHandler) as Arc<dyn MessageHandler>);

        let sessions = Arc::new(SessionRegistry::with_config(config.stream.clone()));
        let pending = Arc::new(PendingRequests::new());
        let waiters = Arc::new(ReplyWaiters::new());
        let shutdown = CancellationToken::new();

        let router = OutboundRouter::new(
            Arc::clone(&sessions),
            Arc::clone(&pending),
            Arc::clone(&waiters),
            Arc::clone(&upstream),
        );
        let handler = RequestHandler::new(
            Arc::clone(&config),
            Arc::clone(&sessions),
            Arc::clone(&pending),
            Arc::clone(&waiters),
            router.clone(),
            Arc::clone(&upstream),
            shutdown.clone(),
        );

        HttpTransport {
            inner: Arc::new(TransportInner {
                config,
                sessions,
                pending,
                waiters,
                router,
                handler,
                upstream,
                shutdown,
                state: Mutex::new(Lifecycle::Idle),
            }),
        }
    }
}

impl Default for HttpTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

enum Lifecycle {
    Idle,
    Starting,
    Running {
        local_addr: SocketAddr,
        tasks: Vec<JoinHandle<()>>,
    },
    Closed,
}

struct TransportInner {
    config: Arc<TransportConfig>,
    sessions: Arc<SessionRegistry>,
    pending: Arc<PendingRequests>,
    waiters: Arc<ReplyWaiters>,
    router: OutboundRouter,
    handler: RequestHandler,
    upstream: Arc<dyn MessageHandler>,
    shutdown: CancellationToken,
    state: Mutex<Lifecycle>,
}

/// Bidirectional JSON-RPC transport over HTTP POST and SSE
#[derive(Clone)]
pub struct HttpTransport {
    inner: Arc<TransportInner>,
}

impl HttpTransport {
    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder::new()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Bind the listener and start serving. Returns the bound address, which
    /// differs from the configured one when port 0 was requested.
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                Lifecycle::Idle => *state = Lifecycle::Starting,
                Lifecycle::Closed => return Err(TransportError::Closed),
                _ => return Err(TransportError::AlreadyStarted),
            }
        }

        let address = self.inner.config.bind_address;
        let listener = match TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(source) => {
                self.reset_if_starting();
                return Err(TransportError::Bind { address, source });
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                self.reset_if_starting();
                return Err(err.into());
            }
        };

        let mut state = self.inner.state.lock();
        if !matches!(*state, Lifecycle::Starting) {
            // closed while binding
            return Err(TransportError::Closed);
        }

        let mut tasks = vec![tokio::spawn(accept_loop(
            listener,
            self.inner.handler.clone(),
            self.inner.shutdown.clone(),
        ))];
        if let Some(interval) = self.inner.config.pending_sweep_interval {
            tasks.push(tokio::spawn(sweep_loop(
                Arc::clone(&self.inner.pending),
                interval,
                self.inner.config.pending_max_age,
                self.inner.shutdown.clone(),
            )));
        }
        *state = Lifecycle::Running { local_addr, tasks };

        info!("HTTP transport listening on {}", local_addr);
        info!("Endpoint available at: {}", self.inner.config.path);
        Ok(local_addr)
    }

    fn reset_if_starting(&self) {
        let mut state = self.inner.state.lock();
        if matches!(*state, Lifecycle::Starting) {
            *state = Lifecycle::Idle;
        }
    }

    /// Stop accepting connections, end every stream, drop all correlations
    /// and fail waiting handshakes. The close hook runs once; later calls
    /// are no-ops.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), Lifecycle::Closed);
        let tasks = match previous {
            Lifecycle::Closed => return,
            Lifecycle::Running { tasks, .. } => tasks,
            Lifecycle::Idle | Lifecycle::Starting => Vec::new(),
        };

        self.inner.shutdown.cancel();
        let streams = self.inner.sessions.clear();
        let correlations = self.inner.pending.clear();
        let waiting = self.inner.waiters.clear();

        for task in tasks {
            if let Err(err) = task.await {
                error!("Transport task ended abnormally: {}", err);
            }
        }

        info!(
            "HTTP transport closed ({} stream(s), {} pending request(s), {} waiting handshake(s))",
            streams, correlations, waiting
        );
        self.inner.upstream.on_close();
    }

    /// Route an outbound message; see [`OutboundRouter::send`]
    pub fn send(&self, message: impl Into<JsonRpcMessage>) -> Delivery {
        self.inner.router.send(message)
    }

    pub fn send_value(&self, value: Value) -> Delivery {
        self.inner.router.send_value(value)
    }

    /// A handle for sending from elsewhere (e.g. a background task)
    pub fn router(&self) -> OutboundRouter {
        self.inner.router.clone()
    }

    /// Drop correlations at least `max_age` old. Without a configured sweep
    /// interval the host must call this periodically.
    pub fn sweep_pending(&self, max_age: Duration) -> usize {
        let removed = self.inner.pending.sweep(max_age);
        if removed > 0 {
            info!("Swept {} stale pending request(s)", removed);
        }
        removed
    }

    /// The request handler, for serving the transport from an existing HTTP stack
    pub fn request_handler(&self) -> RequestHandler {
        self.inner.handler.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.inner.state.lock() {
            Lifecycle::Running { local_addr, .. } => Some(*local_addr),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            open_sessions: self.inner.sessions.len(),
            pending_requests: self.inner.pending.len(),
            awaiting_handshakes: self.inner.waiters.len(),
        }
    }
}

/// Transport statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub open_sessions: usize,
    pub pending_requests: usize,
    pub awaiting_handshakes: usize,
}

async fn accept_loop(listener: TcpListener, handler: RequestHandler, shutdown: CancellationToken) {
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!("Failed to accept connection: {}", err);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };
        debug!("New connection from {}", peer_addr);

        let handler = handler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req: Request<Incoming>| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler.handle(req).await) }
            });

            let mut connection =
                std::pin::pin!(http1::Builder::new().serve_connection(io, service));
            let mut draining = false;
            let result = loop {
                tokio::select! {
                    result = connection.as_mut() => break result,
                    _ = shutdown.cancelled(), if !draining => {
                        draining = true;
                        connection.as_mut().graceful_shutdown();
                    }
                }
            };

            if let Err(err) = result {
                // Filter out common client disconnection errors that aren't actual problems
                let err_str = err.to_string();
                if err_str.contains("connection closed before message completed") {
                    debug!("Client disconnected (normal): {}", err);
                } else {
                    error!("Error serving connection: {}", err);
                }
            }
        });
    }
    debug!("Accept loop stopped");
}

async fn sweep_loop(
    pending: Arc<PendingRequests>,
    every: Duration,
    max_age: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = pending.sweep(max_age);
                if removed > 0 {
                    info!("Swept {} stale pending request(s)", removed);
                }
            }
        }
    }
}
