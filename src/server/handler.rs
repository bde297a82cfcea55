//! Handler resources and the transport they write to.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::parser::RequestHead;
use crate::server::Error;

/// A bidirectional byte stream a connection runs over.
///
/// Implemented for every `AsyncRead + AsyncWrite` type, so handlers and
/// device adapters can be given sockets and test doubles alike.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Type alias for the boxed future a handler returns; resolves to the keep-alive decision.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<bool, Error>> + Send + 'a>>;

/// Everything a handler resource gets to see of a request.
pub struct HandlerRequest<'a> {
    /// `GET`, `GET/GZIP`, `GET/IMAGEBYTES` or `PUT`
    pub method: &'a str,
    /// The full request path, without the query string
    pub path: &'a str,
    /// Query parameters
    pub params: HashMap<String, String>,
    /// The parsed request headers
    pub head: &'a RequestHead,
    /// The connection; the handler writes the complete response itself and
    /// reads any `PUT` body from here
    pub stream: &'a mut dyn Transport,
}

/// A resource whose response is produced by code rather than stored content.
pub trait ResourceHandler: Send + Sync {
    /// Serve one request. Resolve to `true` to keep the connection open for
    /// the next request, `false` to close it.
    ///
    /// Failing with [`Error::InternalError`] before anything was written
    /// makes the server answer `500 Internal Server Error`.
    fn handle<'a>(&'a self, request: HandlerRequest<'a>) -> HandlerFuture<'a>;
}
