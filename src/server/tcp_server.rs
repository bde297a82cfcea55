//! Listener and lifecycle coordinator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};

use log::{debug, error, info, trace, warn};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;

use crate::blob::BlobCache;
use crate::server::adapter::DeviceBus;
use crate::server::config::ServerConfig;
use crate::server::discovery::{LogDiscovery, ServiceDiscovery, ServiceRecord};
use crate::server::error::Error;
use crate::server::resource::ResourceRegistry;
use crate::server::worker::{ConnectionWorker, ServerContext};

/// Listen backlog of the server socket.
const LISTEN_BACKLOG: u32 = 64;

fn cannot_start(context: &'static str) -> impl FnOnce(std::io::Error) -> Error {
    move |source| Error::CannotStart { context, source }
}

/// Lifecycle notifications delivered to the server callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// The listener is bound; `port` is the actual port, also for ephemeral binds.
    Started { port: u16 },
    /// A connection was accepted or finished; carries the new live count.
    ClientsChanged(usize),
    /// The accept loop has exited.
    Stopped,
}

/// Type alias for the lifecycle callback. May be invoked concurrently from
/// several connection tasks.
pub type EventCallback = Arc<dyn Fn(ServerEvent) + Send + Sync>;

/// Mutable lifecycle state of one server instance.
struct ServerState {
    port: AtomicU16,
    ephemeral: AtomicBool,
    running: AtomicBool,
    /// `true` from `shutdown()` until the accept loop has exited.
    shutdown: watch::Sender<bool>,
    clients: AtomicUsize,
    next_connection: AtomicU64,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            port: AtomicU16::new(0),
            ephemeral: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown: watch::Sender::new(false),
            clients: AtomicUsize::new(0),
            next_connection: AtomicU64::new(0),
        }
    }
}

impl ServerState {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// The INDIGO TCP server.
///
/// Cloning is cheap and yields a handle to the same server, which is how
/// one task runs [`IndigoServer::start`] while another calls
/// [`IndigoServer::shutdown`].
#[derive(Clone)]
pub struct IndigoServer {
    ctx: ServerContext,
    discovery: Arc<dyn ServiceDiscovery>,
    state: Arc<ServerState>,
}

impl IndigoServer {
    /// Create a server handing XML/JSON clients to `bus`.
    pub fn new(config: ServerConfig, bus: Arc<dyn DeviceBus>) -> Self {
        Self {
            ctx: ServerContext {
                config: Arc::new(config),
                resources: Arc::new(ResourceRegistry::new()),
                blobs: Arc::new(BlobCache::new()),
                bus,
            },
            discovery: Arc::new(LogDiscovery),
            state: Arc::new(ServerState::default()),
        }
    }

    /// Use an externally owned BLOB cache (typically one with a populator).
    pub fn with_blob_cache(mut self, blobs: Arc<BlobCache>) -> Self {
        self.ctx.blobs = blobs;
        self
    }

    /// Use a real discovery backend instead of [`LogDiscovery`].
    pub fn with_discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    /// The resource table.
    pub fn resources(&self) -> &Arc<ResourceRegistry> {
        &self.ctx.resources
    }

    /// The BLOB cache.
    pub fn blobs(&self) -> &Arc<BlobCache> {
        &self.ctx.blobs
    }

    /// The port the server is bound to; the configured port before start.
    pub fn port(&self) -> u16 {
        match self.state.port.load(Ordering::SeqCst) {
            0 => self.ctx.config.port,
            port => port,
        }
    }

    /// Whether the bound port was assigned by the OS.
    pub fn is_ephemeral_port(&self) -> bool {
        self.state.ephemeral.load(Ordering::SeqCst)
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Number of live connections.
    pub fn client_count(&self) -> usize {
        self.state.clients.load(Ordering::SeqCst)
    }

    /// Log the registered resources.
    fn display_server_info(&self) {
        let prefixes = self.ctx.resources.prefixes();
        if prefixes.is_empty() {
            return;
        }
        debug!("Registered resources:");
        for prefix in prefixes {
            debug!("  {prefix}");
        }
    }

    /// Create, configure, bind and listen on the server socket.
    fn setup_listener(&self) -> Result<TcpListener, Error> {
        let addr = SocketAddr::new(self.ctx.config.bind_addr, self.ctx.config.port);
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(cannot_start("can't open server socket"))?;
        socket
            .set_reuseaddr(true)
            .map_err(cannot_start("can't set SO_REUSEADDR on server socket"))?;
        socket.bind(addr).map_err(cannot_start("can't bind server socket"))?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(cannot_start("can't listen on server socket"))
    }

    /// The callback used when the caller supplies none: advertises the
    /// service while running and logs client counts.
    fn default_callback(&self) -> EventCallback {
        let discovery = self.discovery.clone();
        let config = self.ctx.config.clone();
        let state = self.state.clone();
        Arc::new(move |event: ServerEvent| match event {
            ServerEvent::Started { port } => {
                if config.use_discovery {
                    for record in ServiceRecord::for_server(&config.service_name, port) {
                        if let Err(e) = discovery.register(&record) {
                            error!("Can't register {} service ({e})", record.service_type);
                        }
                    }
                    info!("Service registered as {}", config.service_name);
                }
            }
            ServerEvent::Stopped => {
                if config.use_discovery {
                    let port = state.port.load(Ordering::SeqCst);
                    for record in ServiceRecord::for_server(&config.service_name, port).iter().rev() {
                        discovery.deregister(record);
                    }
                    info!("Service unregistered");
                }
            }
            ServerEvent::ClientsChanged(count) => trace!("{count} clients"),
        })
    }

    /// Bind, announce readiness through `callback` and accept connections
    /// until [`IndigoServer::shutdown`] is called.
    ///
    /// Only socket setup failures are returned; faults inside a connection
    /// stay inside that connection.
    pub async fn start(&self, callback: Option<EventCallback>) -> Result<(), Error> {
        if self.state.running.swap(true, Ordering::SeqCst) {
            return Err(Error::CannotStart {
                context: "server is already running",
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "already running"),
            });
        }

        let listener = match self.setup_listener() {
            Ok(listener) => listener,
            Err(e) => {
                error!("{e}");
                self.state.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(source) => {
                self.state.running.store(false, Ordering::SeqCst);
                return Err(cannot_start("can't read server socket address")(source));
            }
        };
        self.state.ephemeral.store(self.ctx.config.port == 0, Ordering::SeqCst);
        self.state.port.store(port, Ordering::SeqCst);
        info!("Server started on port {port}");
        self.display_server_info();

        let callback = callback.unwrap_or_else(|| self.default_callback());
        callback(ServerEvent::Started { port });

        let mut stop = self.state.shutdown.subscribe();
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            tokio::select! {
                // The flag is re-checked at the top of the loop.
                _ = stop.changed() => continue,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.handle_new_connection(stream, addr, callback.clone()),
                    Err(e) => {
                        if self.state.is_shutting_down() {
                            break;
                        }
                        error!("Can't accept connection ({e})");
                        // Avoid spinning on persistent errors such as EMFILE.
                        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }

        // Closing the listener refuses further connections; accepted ones
        // keep running in their own tasks.
        drop(listener);
        info!("Server stopped, {} connections still active", self.client_count());
        callback(ServerEvent::Stopped);
        // Re-arm for the next start on this handle.
        self.state.shutdown.send_replace(false);
        self.state.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stop accepting connections. Idempotent; live connections drain on their own.
    pub fn shutdown(&self) {
        let initiated = self
            .state
            .shutdown
            .send_if_modified(|stopping| !std::mem::replace(stopping, true));
        if initiated {
            debug!("Shutdown initiated");
        }
    }

    /// Configure an accepted socket and spawn its worker task.
    fn handle_new_connection(&self, stream: TcpStream, addr: SocketAddr, callback: EventCallback) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Can't set TCP_NODELAY for {addr} ({e})");
        }

        let id = self.state.next_connection.fetch_add(1, Ordering::Relaxed);
        let client = ClientSlot::open(self.state.clone(), callback);
        let worker = ConnectionWorker::new(self.ctx.clone(), id);

        tokio::spawn(async move {
            // Decrements the live count however the worker ends.
            let _client = client;
            trace!("{id} <- // Worker started for {addr}");
            match worker.handle_connection(stream).await {
                Ok(()) => {}
                Err(e) if e.is_client_error() => debug!("{id} <- // {e}"),
                Err(e) => warn!("{id} <- // Connection failed: {e}"),
            }
            trace!("{id} <- // Worker finished");
        });
    }
}

/// One live connection in the client count.
struct ClientSlot {
    state: Arc<ServerState>,
    callback: EventCallback,
}

impl ClientSlot {
    fn open(state: Arc<ServerState>, callback: EventCallback) -> Self {
        let count = state.clients.fetch_add(1, Ordering::SeqCst) + 1;
        callback(ServerEvent::ClientsChanged(count));
        Self { state, callback }
    }
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        let count = self.state.clients.fetch_sub(1, Ordering::SeqCst) - 1;
        (self.callback)(ServerEvent::ClientsChanged(count));
    }
}
