//! An INDIGO server whose device bus simply echoes every protocol message back.
//!
//! Try it with:
//!
//! ```text
//! printf '<getProperties version="2.0"/>' | nc 127.0.0.1 7624
//! curl -v http://127.0.0.1:7624/status?name=demo
//! curl -v http://127.0.0.1:7624/blob/1.fits -o frame.fits
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indigo_server_tcp::{
    AdapterFuture, BlobCache, BlobId, BlobPopulator, ClientId, DeviceBus, Dialect, IndigoServer, PopulatedBlob,
    ResourceHandler, ServerConfig, Transport,
};
use indigo_server_tcp::server::{HandlerFuture, HandlerRequest};
use log::info;
use tokio::io::{AsyncWriteExt, copy_buf, split, BufReader};

struct EchoBus {
    next_id: AtomicU64,
}

impl DeviceBus for EchoBus {
    fn attach(&self, dialect: Dialect) -> ClientId {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::SeqCst));
        info!("Client {id:?} attached speaking {dialect}");
        id
    }

    fn parse<'a>(&'a self, _client: ClientId, stream: &'a mut dyn Transport) -> AdapterFuture<'a> {
        Box::pin(async move {
            let (reader, mut writer) = split(stream);
            let mut reader = BufReader::new(reader);
            let echoed = copy_buf(&mut reader, &mut writer).await?;
            info!("Echoed {echoed} bytes");
            Ok(())
        })
    }

    fn detach(&self, client: ClientId) {
        info!("Client {client:?} detached");
    }
}

struct Status;

impl ResourceHandler for Status {
    fn handle<'a>(&'a self, mut request: HandlerRequest<'a>) -> HandlerFuture<'a> {
        Box::pin(async move {
            let name = request.params.get("name").map_or("world", |s| s.as_str());
            let body = format!("{{ \"hello\": \"{name}\", \"method\": \"{}\" }}", request.method);
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
                body.len()
            );
            request.stream.write_all(head.as_bytes()).await?;
            request.stream.write_all(body.as_bytes()).await?;
            Ok(request.head.keep_alive)
        })
    }
}

/// Produces a synthetic FITS header the first time a BLOB is requested.
struct FakeCamera;

impl BlobPopulator for FakeCamera {
    fn populate(&self, id: BlobId, format: &str) -> std::io::Result<PopulatedBlob> {
        let mut content = format!("SIMPLE  =                    T / frame {id}").into_bytes();
        content.resize(2880, b' ');
        Ok(PopulatedBlob {
            content,
            format: format.to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the logger
    env_logger::init();

    let config = ServerConfig {
        bind_addr: "127.0.0.1".parse()?,
        ..ServerConfig::default()
    };
    let blobs = Arc::new(BlobCache::with_populator(Arc::new(FakeCamera)));
    let frame = blobs.declare(".fits");

    let server = IndigoServer::new(config, Arc::new(EchoBus { next_id: AtomicU64::new(1) })).with_blob_cache(blobs);
    server.resources().add_handler("/status", Arc::new(Status));
    info!("Frame available at {}", server.blobs().url_path(frame).await?);

    let stopper = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            stopper.shutdown();
        }
    });

    server.start(None).await?;
    Ok(())
}
