//! The INDIGO TCP server.
//!
//! One listener serves three wire protocols. Each accepted connection gets
//! its own task, which picks the protocol from the first byte and either
//! hands the socket to the device bus or serves minimal HTTP: BLOBs,
//! registered resources and the WebSocket upgrade.

mod adapter;
mod config;
mod discovery;
mod error;
mod handler;
mod protocol;
mod resource;
mod response;
mod tcp_server;
mod websocket;
mod worker;

// Re-export public items
pub use adapter::{AdapterFuture, ClientId, DeviceBus, Dialect};
pub use config::{DEFAULT_PORT, ServerConfig};
pub use discovery::{HTTP_SERVICE_TYPE, INDIGO_SERVICE_TYPE, LogDiscovery, ServiceDiscovery, ServiceRecord};
pub use error::Error;
pub use handler::{HandlerFuture, HandlerRequest, ResourceHandler, Transport};
pub use protocol::Protocol;
pub use resource::{Resource, ResourceRegistry};
pub use response::{HttpResponse, SERVER_HEADER, StatusCode};
pub use tcp_server::{EventCallback, IndigoServer, ServerEvent};
pub use websocket::{accept_token, handshake_response};
pub use worker::{ConnectionWorker, ServerContext};
