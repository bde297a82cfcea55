//! Server configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::server::error::Error;

/// Default TCP port of the INDIGO wire protocol.
pub const DEFAULT_PORT: u16 = 7624;

/// Server configuration.
///
/// Every field has a default, so a JSON document only needs the keys it
/// wants to change.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The address to bind to.
    pub bind_addr: IpAddr,
    /// The port to listen on; 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Name under which the service is advertised on the local network.
    pub service_name: String,
    /// Whether to advertise the service at all.
    pub use_discovery: bool,
    /// Copy BLOBs to a scratch buffer before sending, releasing the entry lock early.
    pub use_blob_buffering: bool,
    /// Gzip buffered BLOBs for clients that accept it.
    pub use_blob_compression: bool,
    /// Upper bound for a single response write, in seconds.
    pub send_timeout_secs: u64,
    /// The read buffer size.
    pub read_buffer_size: usize,
    /// Base directory for relative file resources; the user's home when unset.
    pub home_dir: Option<PathBuf>,
    /// Where `GET /` without a WebSocket upgrade is redirected.
    pub management_page: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            service_name: default_service_name(),
            use_discovery: true,
            use_blob_buffering: true,
            use_blob_compression: false,
            send_timeout_secs: 5,
            read_buffer_size: 8192,
            home_dir: None,
            management_page: "/mng.html".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parse a configuration from JSON, filling missing keys with defaults.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// The send timeout as a [`Duration`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Base directory for relative file resources.
    pub fn resource_base_dir(&self) -> PathBuf {
        self.home_dir
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn default_service_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .map(|host| host.split('.').next().unwrap_or_default().to_string())
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "INDIGO Server".to_string())
}
