//! Device-protocol adapters.
//!
//! Once a connection has been identified as an XML, JSON or JSON-over-WebSocket
//! client, the socket is handed over to the device bus, which attaches a
//! protocol adapter, runs the dialect's parse loop until the peer goes away and
//! finally detaches it again. The server only owns that attach/detach bracket.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use log::trace;

use crate::server::handler::Transport;

/// The device-protocol dialects a client can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Raw XML message stream.
    Xml,
    /// Raw JSON message stream.
    Json,
    /// JSON messages framed as WebSocket text frames.
    JsonWebSocket,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Xml => write!(f, "XML"),
            Dialect::Json => write!(f, "JSON"),
            Dialect::JsonWebSocket => write!(f, "JSON-over-WebSockets"),
        }
    }
}

/// Identifies one attached adapter on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

/// Type alias for the future returned by a parse loop.
pub type AdapterFuture<'a> = Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + 'a>>;

/// The device layer, as seen from the network server.
pub trait DeviceBus: Send + Sync {
    /// Create and attach an adapter for a client speaking `dialect`.
    fn attach(&self, dialect: Dialect) -> ClientId;

    /// Drive the adapter's message loop over `stream` until the peer
    /// disconnects or the stream fails.
    fn parse<'a>(&'a self, client: ClientId, stream: &'a mut dyn Transport) -> AdapterFuture<'a>;

    /// Detach and release the adapter.
    fn detach(&self, client: ClientId);
}

/// An attached adapter; detaches from the bus when dropped.
pub(crate) struct AttachedClient<'a> {
    bus: &'a dyn DeviceBus,
    id: ClientId,
}

impl<'a> AttachedClient<'a> {
    pub(crate) fn attach(bus: &'a dyn DeviceBus, dialect: Dialect) -> Self {
        let id = bus.attach(dialect);
        trace!("Adapter {id:?} attached ({dialect})");
        Self { bus, id }
    }

    pub(crate) fn id(&self) -> ClientId {
        self.id
    }
}

impl Drop for AttachedClient<'_> {
    fn drop(&mut self) {
        self.bus.detach(self.id);
        trace!("Adapter {:?} detached", self.id);
    }
}
