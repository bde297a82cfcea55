//! Network front-end of the INDIGO device bus.
//!
//! A single TCP port carries three wire protocols, told apart by the first
//! byte a client sends:
//!
//! - `<` starts a raw XML device-protocol stream,
//! - `{` starts a raw JSON device-protocol stream,
//! - `G` / `P` start a minimal HTTP/1.1 exchange (GET and PUT only), used for
//!   the WebSocket upgrade on `/`, BLOB transfers under `/blob/` and any
//!   registered static or handler resources.
//!
//! The device layer itself is not part of this crate; it plugs in through
//! [`DeviceBus`] (protocol adapters), [`BlobPopulator`] (lazy BLOB content),
//! [`ResourceHandler`] (dynamic resources) and [`ServiceDiscovery`]
//! (service advertisement).
//!
//! # Examples
//!
//! ## Running a server
//!
//! ```no_run
//! use std::sync::Arc;
//! use indigo_server_tcp::{AdapterFuture, ClientId, DeviceBus, Dialect, IndigoServer, ServerConfig, Transport};
//!
//! struct Bus;
//!
//! impl DeviceBus for Bus {
//!     fn attach(&self, _dialect: Dialect) -> ClientId {
//!         ClientId(1)
//!     }
//!
//!     fn parse<'a>(&'a self, _client: ClientId, _stream: &'a mut dyn Transport) -> AdapterFuture<'a> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn detach(&self, _client: ClientId) {}
//! }
//!
//! # async fn run() -> Result<(), indigo_server_tcp::ServerError> {
//! let server = IndigoServer::new(ServerConfig::default(), Arc::new(Bus));
//! server.resources().add_file("/log", "indigo.log", "text/plain");
//! let blob = server.blobs().declare(".fits");
//! server.blobs().replace(blob, vec![0u8; 2880]).await?;
//! server.start(None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## WebSocket accept token
//!
//! ```
//! use indigo_server_tcp::accept_token;
//!
//! assert_eq!(accept_token("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
//! ```

// Export the parser module
pub mod parser;

// Export the server module
pub mod server;

pub mod blob;
pub mod sha1;

// Re-export commonly used items for convenience
pub use blob::{BlobCache, BlobError, BlobId, BlobPopulator, PopulatedBlob};
pub use parser::{Error as ParserError, HttpVersion, Method, RequestHead, RequestLine};
pub use server::{
    AdapterFuture, ClientId, DeviceBus, Dialect, Error as ServerError, EventCallback, HttpResponse, IndigoServer,
    ResourceHandler, ServerConfig, ServerEvent, StatusCode, Transport, accept_token,
};
