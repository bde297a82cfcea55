//! The per-connection worker.
//!
//! A worker owns one accepted socket. It peeks at the first byte to decide
//! which protocol the client speaks, then either hands the socket to the
//! device bus (XML, JSON) or serves a loop of minimal HTTP requests: BLOB
//! transfers, registered resources and the WebSocket upgrade on `/`.
//!
//! Sockets, BLOB locks, scratch buffers and adapter attachments are all
//! scoped values, so every exit path (including write failures half-way
//! through a body) releases them.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, trace, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time;

use crate::blob::{BLOB_PATH_PREFIX, BlobCache, BlobError, BlobId, JPEG_FORMAT, is_compressible};
use crate::parser::{Error as ParserError, MAX_LINE_LENGTH, Method, RequestHead, RequestLine};
use crate::server::adapter::{AttachedClient, DeviceBus, Dialect};
use crate::server::config::ServerConfig;
use crate::server::error::Error;
use crate::server::handler::{HandlerRequest, ResourceHandler, Transport};
use crate::server::protocol::Protocol;
use crate::server::resource::{Resource, ResourceRegistry};
use crate::server::response::{HttpResponse, StatusCode};
use crate::server::websocket;

/// Chunk size for streaming file resources.
const FILE_CHUNK_SIZE: usize = 128 * 1024;

/// State shared by all connections of one server.
#[derive(Clone)]
pub struct ServerContext {
    /// The server configuration.
    pub config: Arc<ServerConfig>,
    /// Registered resources.
    pub resources: Arc<ResourceRegistry>,
    /// BLOB entries.
    pub blobs: Arc<BlobCache>,
    /// The device layer XML/JSON clients are handed to.
    pub bus: Arc<dyn DeviceBus>,
}

/// Serves one accepted connection.
pub struct ConnectionWorker {
    ctx: ServerContext,
    id: u64,
    send_timeout: Duration,
}

impl ConnectionWorker {
    /// Create a worker for connection number `id`.
    pub fn new(ctx: ServerContext, id: u64) -> Self {
        let send_timeout = ctx.config.send_timeout();
        Self { ctx, id, send_timeout }
    }

    /// Serve the connection to completion, then shut it down.
    ///
    /// The returned error, if any, is what ended the connection; it has
    /// already been reported to the client where that was possible.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut conn = BufReader::with_capacity(self.ctx.config.read_buffer_size, stream);
        let result = self.dispatch(&mut conn).await;
        if let Err(e) = conn.shutdown().await {
            trace!("{} <- // shutdown failed: {e}", self.id);
        }
        result
    }

    async fn dispatch<S>(&self, conn: &mut BufReader<S>) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // fill_buf does not consume, so the adapter still sees the first byte.
        let Some(first) = conn.fill_buf().await?.first().copied() else {
            return Ok(());
        };

        match Protocol::classify(first) {
            Protocol::Xml => self.run_adapter(Dialect::Xml, conn).await,
            Protocol::Json => self.run_adapter(Dialect::Json, conn).await,
            Protocol::Http => self.serve_http(conn).await,
            Protocol::Unknown => {
                trace!("{} -> // Unrecognised protocol", self.id);
                Ok(())
            }
        }
    }

    async fn run_adapter(&self, dialect: Dialect, conn: &mut dyn Transport) -> Result<(), Error> {
        debug!("{} <- // Protocol switched to {dialect}", self.id);
        let client = AttachedClient::attach(self.ctx.bus.as_ref(), dialect);
        self.ctx.bus.parse(client.id(), conn).await?;
        Ok(())
    }

    async fn serve_http<S>(&self, conn: &mut BufReader<S>) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let line = match read_line(conn).await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(e) => return self.reject(conn, e).await,
            };
            if line.is_empty() {
                continue;
            }

            let request = match RequestLine::parse(&line) {
                Ok(request) => request,
                Err(e) => return self.reject(conn, Error::ParseError(e)).await,
            };
            let head = match read_head(conn).await {
                Ok(head) => head,
                Err(e) => return self.reject(conn, e).await,
            };
            trace!("{} -> {} {}", self.id, request.method, request.path);

            let keep_alive = match request.method {
                Method::GET => self.handle_get(conn, &request, &head).await?,
                Method::PUT => self.handle_put(conn, &request, &head).await?,
            };
            if !keep_alive {
                return Ok(());
            }
        }
    }

    /// Answer a request that could not be parsed and end the connection.
    async fn reject(&self, conn: &mut dyn Transport, error: Error) -> Result<(), Error> {
        if let Error::ParseError(e) = &error {
            let response = HttpResponse::plain_text(StatusCode::BadRequest, format!("Error parsing request: {e}"));
            self.send(conn, &response.to_bytes()).await?;
        }
        Err(error)
    }

    async fn handle_get(
        &self,
        conn: &mut dyn Transport,
        request: &RequestLine,
        head: &RequestHead,
    ) -> Result<bool, Error> {
        if request.path == "/" {
            self.handle_root(conn, head).await?;
            return Ok(false);
        }
        if request.path.starts_with(BLOB_PATH_PREFIX) {
            return self.send_blob(conn, &request.path, head).await;
        }

        let Some(resource) = self.ctx.resources.lookup(&request.path) else {
            return self.not_found(conn, &request.path).await;
        };
        match resource {
            Resource::Handler(handler) => {
                self.run_handler(conn, handler.as_ref(), head.get_method_token(), request, head)
                    .await
            }
            Resource::Bytes { data, content_type } => {
                let response = HttpResponse::new(StatusCode::Ok)
                    .with_content_type(content_type)
                    .with_content_length(data.len())
                    .with_header("Content-Encoding", "gzip");
                self.send(conn, &response.head_bytes()).await?;
                self.send(conn, &data).await?;
                trace!("{} <- // {} bytes", self.id, data.len());
                Ok(head.keep_alive)
            }
            Resource::File { path, content_type } => {
                self.send_file(conn, &path, &content_type).await?;
                Ok(head.keep_alive)
            }
        }
    }

    /// `GET /`: WebSocket upgrade when a key was sent, otherwise a redirect
    /// to the management page. Either way the connection ends afterwards.
    async fn handle_root(&self, conn: &mut dyn Transport, head: &RequestHead) -> Result<(), Error> {
        match &head.websocket_key {
            Some(key) if !key.is_empty() => {
                let response = websocket::handshake_response(key);
                self.send(conn, &response.head_bytes()).await?;
                self.run_adapter(Dialect::JsonWebSocket, conn).await
            }
            _ => {
                let page = &self.ctx.config.management_page;
                let response = HttpResponse::new(StatusCode::MovedPermanently)
                    .with_header("Location", page.as_str())
                    .with_content_type("text/html")
                    .with_body_string(format!("<a href='{page}'>INDIGO Server Manager</a>"));
                self.send(conn, &response.to_bytes()).await
            }
        }
    }

    async fn send_blob(&self, conn: &mut dyn Transport, path: &str, head: &RequestHead) -> Result<bool, Error> {
        let Some(id) = BlobId::from_url_path(path) else {
            return self.not_found_blob_path(conn, path).await;
        };
        let guard = match self.ctx.blobs.get_or_populate(id).await {
            Ok(guard) => guard,
            Err(e) => return self.blob_failure(conn, e).await,
        };

        let config = &self.ctx.config;
        if config.use_blob_buffering {
            let compress = head.accepts_gzip && config.use_blob_compression && is_compressible(guard.format());
            let snapshot = match guard.snapshot(compress) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    drop(guard);
                    return self.blob_failure(conn, e).await;
                }
            };
            // Release the entry before the (possibly slow) network transfer.
            drop(guard);

            let mut response = blob_response(id, &snapshot.format, snapshot.body.len(), head.keep_alive);
            if let Some(original) = snapshot.uncompressed_len {
                response = response
                    .with_header("Content-Encoding", "gzip")
                    .with_header("X-Uncompressed-Content-Length", original.to_string());
            }
            self.send(conn, &response.head_bytes()).await?;
            self.send(conn, &snapshot.body).await?;
            trace!("{} <- // {} bytes", self.id, snapshot.body.len());
        } else {
            // Unbuffered: the entry stays locked for the whole transfer.
            let response = blob_response(id, guard.format(), guard.size(), head.keep_alive);
            self.send(conn, &response.head_bytes()).await?;
            self.send(conn, guard.content()).await?;
            trace!("{} <- // {} bytes", self.id, guard.size());
        }
        Ok(head.keep_alive)
    }

    async fn send_file(&self, conn: &mut dyn Transport, file: &Path, content_type: &str) -> Result<(), Error> {
        let file_name = if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.ctx.config.resource_base_dir().join(file)
        };

        let opened = async {
            let metadata = tokio::fs::metadata(&file_name).await?;
            let handle = tokio::fs::File::open(&file_name).await?;
            Ok::<_, std::io::Error>((metadata, handle))
        }
        .await;
        let (metadata, mut handle) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                trace!("{} <- // Failed to stat/open file ({}, {e})", self.id, file_name.display());
                let response = HttpResponse::plain_text(
                    StatusCode::NotFound,
                    format!("{} not found ({e})\r\n", file_name.display()),
                );
                self.send(conn, &response.to_bytes()).await?;
                return Err(Error::NotFound(file_name.display().to_string()));
            }
        };

        let base_name = base_name(&file_name);
        let length = metadata.len();
        let response = HttpResponse::new(StatusCode::Ok)
            .with_content_type(content_type)
            .with_header("Content-Disposition", format!("attachment; filename={base_name}"))
            .with_header("Content-Length", length.to_string());
        self.send(conn, &response.head_bytes()).await?;

        let mut remaining = length;
        let mut buffer = vec![0u8; FILE_CHUNK_SIZE];
        while remaining > 0 {
            let wanted = usize::try_from(remaining).map_or(FILE_CHUNK_SIZE, |r| r.min(FILE_CHUNK_SIZE));
            // Content-Length is already out, so a short body must end the connection.
            let count = match handle.read(&mut buffer[..wanted]).await {
                Ok(0) => {
                    warn!("{} -> // {} shrank while being sent", self.id, file_name.display());
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("{} shrank while being sent", file_name.display()),
                    )
                    .into());
                }
                Ok(count) => count,
                Err(e) => {
                    warn!("{} -> // {e}", self.id);
                    return Err(e.into());
                }
            };
            self.send(conn, &buffer[..count]).await?;
            trace!("{} <- // {count} bytes", self.id);
            remaining -= count as u64;
        }
        Ok(())
    }

    async fn handle_put(
        &self,
        conn: &mut dyn Transport,
        request: &RequestLine,
        head: &RequestHead,
    ) -> Result<bool, Error> {
        if request.path.starts_with(BLOB_PATH_PREFIX) {
            return self.receive_blob(conn, &request.path, head).await;
        }

        match self.ctx.resources.lookup(&request.path) {
            None => self.not_found(conn, &request.path).await,
            Some(Resource::Handler(handler)) => {
                self.run_handler(conn, handler.as_ref(), "PUT", request, head).await
            }
            // Static resources cannot be written to.
            Some(_) => Ok(head.keep_alive),
        }
    }

    async fn receive_blob(&self, conn: &mut dyn Transport, path: &str, head: &RequestHead) -> Result<bool, Error> {
        let id = match BlobId::from_url_path(path) {
            Some(id) if self.ctx.blobs.contains(id) => id,
            _ => return self.not_found_blob_path(conn, path).await,
        };

        let length = head.content_length.unwrap_or(0);
        let size = usize::try_from(length).unwrap_or(usize::MAX);
        let mut body = Vec::new();
        if body.try_reserve_exact(size).is_err() {
            return self.blob_failure(conn, BlobError::OutOfMemory(size)).await;
        }
        // Only bytes that actually arrive are written into the reservation.
        (&mut *conn).take(length).read_to_end(&mut body).await?;
        if body.len() != size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("BLOB {id} body ended after {} of {size} bytes", body.len()),
            )
            .into());
        }

        // The new buffer is complete before it is installed.
        if let Err(e) = self.ctx.blobs.replace(id, body).await {
            return self.blob_failure(conn, e).await;
        }
        trace!("{} -> // {size} bytes into BLOB {id}", self.id);

        let response = HttpResponse::new(StatusCode::Ok).with_content_length(0);
        self.send(conn, &response.head_bytes()).await?;
        Ok(head.keep_alive)
    }

    /// Invoke a handler resource. A handler failing with
    /// [`Error::InternalError`] before writing anything gets a `500` sent on
    /// its behalf.
    async fn run_handler(
        &self,
        conn: &mut dyn Transport,
        handler: &dyn ResourceHandler,
        method: &str,
        request: &RequestLine,
        head: &RequestHead,
    ) -> Result<bool, Error> {
        let result = handler
            .handle(HandlerRequest {
                method,
                path: &request.path,
                params: request.query_params(),
                head,
                stream: &mut *conn,
            })
            .await;
        match result {
            Err(Error::InternalError(message)) => {
                let response = HttpResponse::plain_text(StatusCode::InternalServerError, format!("{message}\r\n"));
                self.send(conn, &response.to_bytes()).await?;
                Err(Error::InternalError(message))
            }
            other => other,
        }
    }

    async fn not_found(&self, conn: &mut dyn Transport, path: &str) -> Result<bool, Error> {
        let response = HttpResponse::plain_text(StatusCode::NotFound, format!("{path} not found!\r\n"));
        self.send(conn, &response.to_bytes()).await?;
        trace!("{} <- // {path} not found", self.id);
        Err(Error::NotFound(path.to_string()))
    }

    async fn not_found_blob_path(&self, conn: &mut dyn Transport, path: &str) -> Result<bool, Error> {
        let response = HttpResponse::plain_text(StatusCode::NotFound, "BLOB not found!\r\n");
        self.send(conn, &response.to_bytes()).await?;
        trace!("{} <- // BLOB not found", self.id);
        Err(Error::NotFound(path.to_string()))
    }

    /// Report a failed BLOB read or write with a plain-text `404`.
    async fn blob_failure(&self, conn: &mut dyn Transport, error: BlobError) -> Result<bool, Error> {
        let message = match &error {
            BlobError::NotFound(_) => "BLOB not found!",
            BlobError::OutOfMemory(_) => "Out of buffer memory!",
            BlobError::Unavailable { .. } | BlobError::Compression(_) => "BLOB not available!",
        };
        let response = HttpResponse::plain_text(StatusCode::NotFound, format!("{message}\r\n"));
        self.send(conn, &response.to_bytes()).await?;
        if matches!(error, BlobError::NotFound(_)) {
            trace!("{} <- // {error}", self.id);
        } else {
            error!("{} <- // {error}", self.id);
        }
        Err(error.into())
    }

    /// Write all of `bytes`, bounded by the send timeout.
    async fn send(&self, conn: &mut dyn Transport, bytes: &[u8]) -> Result<(), Error> {
        let write = async {
            conn.write_all(bytes).await?;
            conn.flush().await
        };
        match time::timeout(self.send_timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout(self.send_timeout)),
        }
    }
}

/// Response head for a BLOB body of `length` bytes.
fn blob_response(id: BlobId, format: &str, length: usize, keep_alive: bool) -> HttpResponse {
    let mut response = HttpResponse::new(StatusCode::Ok);
    if format == JPEG_FORMAT {
        response = response.with_content_type("image/jpeg");
    } else {
        response = response
            .with_content_type("application/octet-stream")
            .with_header("Content-Disposition", format!("attachment; filename=\"{id}{format}\""));
    }
    if keep_alive {
        response = response.with_header("Connection", "keep-alive");
    }
    response.with_content_length(length)
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Read one line, without its `\n` / `\r\n` terminator.
///
/// Returns `None` at end of stream. Lines longer than [`MAX_LINE_LENGTH`]
/// are rejected.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>, Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(MAX_LINE_LENGTH as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    } else if read >= MAX_LINE_LENGTH {
        return Err(ParserError::LineTooLong(MAX_LINE_LENGTH).into());
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// Read header lines up to the blank line that ends the request head.
async fn read_head<R>(reader: &mut R) -> Result<RequestHead, Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = RequestHead::default();
    while let Some(line) = read_line(reader).await? {
        if line.is_empty() {
            break;
        }
        if let Err(e) = head.apply_header_line(&line) {
            // Unparseable headers carry nothing the server acts on.
            debug!("Ignoring header: {e}");
        }
    }
    Ok(head)
}
