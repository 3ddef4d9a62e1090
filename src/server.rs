//! Mock server lifecycle and HTTP listener.

use crate::bridge::{InterceptionBridge, InterceptionHost};
use crate::config::{MappingEntry, MockServerConfig, PortValue, RequestPattern, ResponsePlan, ServerSettings};
use crate::error::{Error, Result};
use crate::matcher::{find_match, RequestDescriptor};
use crate::responder::{deliver, not_found, synthesize, FileSource, FsFileSource};
use crate::store::{MappingStore, SnapshotHandle};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`MockServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
}

/// Inbound request counters of the current listener.
#[derive(Debug, Default)]
pub struct RequestStats {
    total: AtomicU64,
    matched: AtomicU64,
    unmatched: AtomicU64,
}

impl RequestStats {
    /// Total requests received.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Requests answered from a mapping.
    pub fn matched(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }

    /// Requests answered with 404.
    pub fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.matched.store(0, Ordering::Relaxed);
        self.unmatched.store(0, Ordering::Relaxed);
    }
}

/// State shared between the control side and request handlers.
struct Shared {
    mappings: SnapshotHandle,
    files: Arc<dyn FileSource>,
    settings: ServerSettings,
    stats: Arc<RequestStats>,
}

struct Listener {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A programmable HTTP test double.
///
/// Mappings are defined with [`when`](Self::when) followed by
/// [`response`](Self::response) and matched first-match-wins in the order
/// they were added.
///
/// ```no_run
/// # async fn demo() -> mock_request_server::Result<()> {
/// use mock_request_server::{MockServer, RequestPattern, ResponsePlan};
///
/// let mut server = MockServer::new();
/// server
///     .start(8080)
///     .await?
///     .when(RequestPattern::new().method("GET").url("ajax_info_1"))
///     .response(ResponsePlan::new().status(200).response_text("Mock Response 1"))?;
/// # Ok(())
/// # }
/// ```
pub struct MockServer {
    store: MappingStore,
    bridge: InterceptionBridge,
    settings: ServerSettings,
    files: Arc<dyn FileSource>,
    stats: Arc<RequestStats>,
    state: ServerState,
    port: u16,
    listener: Option<Listener>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::with_settings(ServerSettings::default())
    }

    pub fn with_settings(settings: ServerSettings) -> Self {
        let store = MappingStore::new();
        let bridge = InterceptionBridge::new(None, store.handle());
        Self {
            files: Arc::new(FsFileSource::new(settings.response_dir.clone())),
            store,
            bridge,
            settings,
            stats: Arc::new(RequestStats::default()),
            state: ServerState::Stopped,
            port: 0,
            listener: None,
        }
    }

    /// Build a stopped server preloaded with the configured mappings.
    pub fn from_config(config: &MockServerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        let mut server = Self::with_settings(config.settings.clone());
        for MappingEntry { request, response } in &config.mappings {
            server.when(request.clone()).response(response.clone())?;
        }
        Ok(server)
    }

    /// Replace the capability used to read `responseFile` paths.
    /// Takes effect on the next `start()`.
    pub fn with_file_source(mut self, files: impl FileSource + 'static) -> Self {
        self.files = Arc::new(files);
        self
    }

    /// Enable request interception through a browser-automation host.
    pub fn with_interception_host(mut self, host: Arc<dyn InterceptionHost>) -> Self {
        self.bridge.set_host(Some(host));
        self
    }

    /// Bind to `port` and start serving.
    ///
    /// Already running on the same port only resets the mappings. Running on
    /// another port closes the current listener first.
    pub async fn start(&mut self, port: impl Into<PortValue>) -> Result<&mut Self> {
        let port = port.into().validate()?;

        if self.state == ServerState::Running {
            if self.port == port {
                debug!(port, "Server already running, resetting mappings");
                self.reset();
                self.bridge.install(port);
                return Ok(self);
            }
            info!(from = self.port, to = port, "Moving server to a new port");
            self.close().await;
        }

        self.state = ServerState::Starting;
        let addr = SocketAddr::new(self.settings.bind_address, port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state = ServerState::Stopped;
                return Err(Error::Bind(addr, e));
            }
        };
        let addr = listener.local_addr().unwrap_or(addr);

        let shared = Arc::new(Shared {
            mappings: self.store.handle(),
            files: self.files.clone(),
            settings: self.settings.clone(),
            stats: self.stats.clone(),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, shared, shutdown_rx));

        self.listener = Some(Listener {
            addr,
            shutdown,
            task,
        });
        self.port = port;
        self.state = ServerState::Running;
        self.bridge.install(port);

        info!(address = %addr, mappings = self.store.len(), "Mock server listening");
        Ok(self)
    }

    /// Reset mappings, stop the listener and forget the port. Idempotent.
    ///
    /// Connections held open by simulated timeouts and replies still
    /// waiting out their delay are dropped.
    pub async fn close(&mut self) -> &mut Self {
        self.reset();
        if let Some(listener) = self.listener.take() {
            listener.shutdown.send_replace(true);
            if let Err(e) = listener.task.await {
                error!(error = %e, "Listener task failed");
            }
            info!(address = %listener.addr, "Mock server closed");
        }
        self.stats.reset();
        self.port = 0;
        self.state = ServerState::Stopped;
        self
    }

    /// Define the request pattern the next [`response`](Self::response)
    /// answers.
    pub fn when(&mut self, pattern: RequestPattern) -> &mut Self {
        self.store.define_pattern(pattern);
        if self.state == ServerState::Running {
            self.bridge.install(self.port);
        }
        self
    }

    /// Attach `plan` to the pending pattern.
    ///
    /// Fails with [`Error::UnmatchedPattern`] when no `when()` is pending.
    pub fn response(&mut self, plan: ResponsePlan) -> Result<&mut Self> {
        self.store.attach_response(plan)?;
        if self.state == ServerState::Running {
            self.bridge.install(self.port);
        }
        Ok(self)
    }

    /// Drop all mappings and release the interception hook.
    pub fn reset(&mut self) -> &mut Self {
        self.store.reset();
        self.bridge.release();
        self
    }

    pub fn is_server_up(&self) -> bool {
        self.state == ServerState::Running
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Bound port, 0 when stopped.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.addr)
    }

    pub fn base_url(&self) -> Option<String> {
        self.local_addr().map(|addr| format!("http://{}", addr))
    }

    pub fn mappings(&self) -> impl Iterator<Item = &MappingEntry> {
        self.store.entries()
    }

    pub fn pending_pattern(&self) -> Option<&RequestPattern> {
        self.store.pending()
    }

    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let mut conn_shutdown = shutdown.clone();
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, shared.clone()));
                            let connection = http1::Builder::new()
                                .keep_alive(false)
                                .serve_connection(TokioIo::new(stream), service);
                            tokio::select! {
                                result = connection => {
                                    if let Err(e) = result {
                                        debug!(%remote, error = %e, "Connection error");
                                    }
                                }
                                _ = conn_shutdown.wait_for(|stop| *stop) => {
                                    debug!(%remote, "Connection dropped on shutdown");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                    }
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => {
                debug!("Listener shutting down");
                break;
            }
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    shared: Arc<Shared>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    shared.stats.total.fetch_add(1, Ordering::Relaxed);

    let method = req.method().as_str().to_string();
    let url = req.uri().to_string();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            Bytes::new()
        }
    };
    let request = RequestDescriptor::new(&method, url, Some(&body[..]));

    let reply = {
        let snapshot = shared.mappings.load();
        let Some(matched) = find_match(&snapshot.entries, &request) else {
            shared.stats.unmatched.fetch_add(1, Ordering::Relaxed);
            if shared.settings.log_unmatched {
                warn!(method = %request.method, url = %request.url, "No matching mapping found");
            }
            return Ok(not_found());
        };

        shared.stats.matched.fetch_add(1, Ordering::Relaxed);
        if shared.settings.log_matches {
            info!(method = %request.method, url = %request.url, "Request matched mapping");
        }
        synthesize(&matched.entry.response, shared.files.as_ref())
    };

    Ok(deliver(reply).await.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{HookContext, HookSlot, OutboundRequest};

    /// Find a port in the accepted range that is currently free.
    fn free_port() -> u16 {
        for _ in 0..100 {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            if (PortValue::MIN..=PortValue::MAX).contains(&port) {
                return port;
            }
        }
        (20_000..40_000)
            .find(|p| std::net::TcpListener::bind(("127.0.0.1", *p)).is_ok())
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_and_close() {
        let mut server = MockServer::new();
        assert!(!server.is_server_up());
        assert_eq!(server.state(), ServerState::Stopped);

        let port = free_port();
        server.start(port).await.unwrap();
        assert!(server.is_server_up());
        assert_eq!(server.port(), port);
        assert_eq!(server.local_addr().unwrap().port(), port);

        server.close().await;
        assert!(!server.is_server_up());
        assert_eq!(server.port(), 0);
        assert!(server.local_addr().is_none());

        server.close().await;
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.port(), 0);

        // The port is released.
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_ports_rejected() {
        let mut server = MockServer::new();
        for port in [PortValue::from(0), PortValue::from(1024), PortValue::from(49152), PortValue::from("http")] {
            let err = server.start(port).await.err().unwrap();
            assert!(matches!(err, Error::InvalidPort(_)));
            assert!(!server.is_server_up());
            assert_eq!(server.state(), ServerState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_numeric_string_port() {
        let mut server = MockServer::new();
        let port = free_port();
        server.start(port.to_string()).await.unwrap();
        assert_eq!(server.port(), port);
        server.close().await;
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_server_stopped() {
        let port = free_port();
        let _occupied = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();

        let mut server = MockServer::new();
        let err = server.start(port).await.err().unwrap();
        assert!(matches!(err, Error::Bind(..)));
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.port(), 0);
    }

    #[tokio::test]
    async fn test_restart_same_port_resets_mappings() {
        let mut server = MockServer::new();
        let port = free_port();
        server.start(port).await.unwrap();
        server
            .when(RequestPattern::new().url("/a"))
            .response(ResponsePlan::new())
            .unwrap();
        assert_eq!(server.mappings().count(), 1);

        server.start(port).await.unwrap();
        assert!(server.is_server_up());
        assert_eq!(server.mappings().count(), 0);
        server.close().await;
    }

    #[tokio::test]
    async fn test_restart_other_port_rebinds() {
        let mut server = MockServer::new();
        let first = free_port();
        server.start(first).await.unwrap();
        server
            .when(RequestPattern::new())
            .response(ResponsePlan::new())
            .unwrap();

        let second = free_port();
        server.start(second).await.unwrap();
        assert_eq!(server.port(), second);
        assert_eq!(server.mappings().count(), 0);
        assert!(std::net::TcpListener::bind(("127.0.0.1", first)).is_ok());
        server.close().await;
    }

    #[test]
    fn test_response_without_when() {
        let mut server = MockServer::new();
        let err = server.response(ResponsePlan::new()).err().unwrap();
        assert!(matches!(err, Error::UnmatchedPattern));
        assert_eq!(server.mappings().count(), 0);
    }

    #[test]
    fn test_reset_clears_pending_and_mappings() {
        let mut server = MockServer::new();
        server
            .when(RequestPattern::new().url("/1"))
            .response(ResponsePlan::new())
            .unwrap()
            .when(RequestPattern::new().url("/2"));
        assert!(server.pending_pattern().is_some());

        server.reset();
        assert_eq!(server.mappings().count(), 0);
        assert!(server.pending_pattern().is_none());
    }

    #[test]
    fn test_from_config() {
        let config = MockServerConfig::from_yaml(
            r#"
mappings:
  - request: { url: /a }
    response: { status: 201 }
  - request: { url: /b }
    response: { status: 202 }
"#,
        )
        .unwrap();
        let server = MockServer::from_config(&config).unwrap();
        let statuses: Vec<_> = server.mappings().map(|m| m.response.status).collect();
        assert_eq!(statuses, vec![Some(201), Some(202)]);
        assert!(!server.is_server_up());
    }

    #[test]
    fn test_from_invalid_config() {
        let config = MockServerConfig {
            port: Some(PortValue::from(80)),
            ..Default::default()
        };
        let err = MockServer::from_config(&config).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_interception_follows_lifecycle() {
        let slot = Arc::new(HookSlot::new());
        let mut server = MockServer::new().with_interception_host(slot.clone());
        let ctx = HookContext::default();
        let request = OutboundRequest::new("GET", "https://remote.test/ajax_info_1.txt");

        server
            .when(RequestPattern::new().url("ajax_info_1"))
            .response(ResponsePlan::new())
            .unwrap();
        assert!(slot.is_empty());

        let port = free_port();
        server.start(port).await.unwrap();
        assert_eq!(
            slot.dispatch(&ctx, &request),
            Some(format!("http://127.0.0.1:{}/ajax_info_1.txt", port))
        );

        server.reset();
        assert!(slot.is_empty());

        server
            .when(RequestPattern::new().url("ajax_info"))
            .response(ResponsePlan::new())
            .unwrap();
        assert!(slot.dispatch(&ctx, &request).is_some());

        server.close().await;
        assert!(slot.is_empty());
    }

    #[tokio::test]
    async fn test_pending_pattern_intercepted_after_reset() {
        let slot = Arc::new(HookSlot::new());
        let mut server = MockServer::new().with_interception_host(slot.clone());
        let ctx = HookContext::default();
        let request = OutboundRequest::new("GET", "https://remote.test/ajax_info_1.txt");
        let port = free_port();
        let expected = Some(format!("http://127.0.0.1:{}/ajax_info_1.txt", port));

        server.start(port).await.unwrap();
        server.reset();
        assert!(slot.is_empty());
        server.when(RequestPattern::new().url("ajax_info_1"));
        assert_eq!(slot.dispatch(&ctx, &request), expected);

        // Restarting on the same port resets, then reinstalls the hook.
        server.start(port).await.unwrap();
        assert!(!slot.is_empty());
        assert!(slot.dispatch(&ctx, &request).is_none());
        server.when(RequestPattern::new().url("ajax_info_1"));
        assert_eq!(slot.dispatch(&ctx, &request), expected);

        server.close().await;
        assert!(slot.is_empty());
    }
}
