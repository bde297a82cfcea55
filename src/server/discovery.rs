//! Service advertisement on the local network.

use log::info;

/// Service type of the generic HTTP record.
pub const HTTP_SERVICE_TYPE: &str = "_http._tcp";
/// Service type of the INDIGO protocol record.
pub const INDIGO_SERVICE_TYPE: &str = "_indigo._tcp";

/// One advertised service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Human-readable instance name
    pub name: String,
    /// DNS-SD service type, e.g. `_indigo._tcp`
    pub service_type: String,
    /// Port the service listens on
    pub port: u16,
}

impl ServiceRecord {
    /// The two records the server advertises while running.
    pub fn for_server(name: &str, port: u16) -> [ServiceRecord; 2] {
        [HTTP_SERVICE_TYPE, INDIGO_SERVICE_TYPE].map(|service_type| ServiceRecord {
            name: name.to_string(),
            service_type: service_type.to_string(),
            port,
        })
    }
}

/// A local-network discovery backend (mDNS / DNS-SD or similar).
pub trait ServiceDiscovery: Send + Sync {
    /// Start advertising `record`.
    fn register(&self, record: &ServiceRecord) -> std::io::Result<()>;

    /// Stop advertising `record`.
    fn deregister(&self, record: &ServiceRecord);
}

/// Discovery backend that only logs; used when the host provides none.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDiscovery;

impl ServiceDiscovery for LogDiscovery {
    fn register(&self, record: &ServiceRecord) -> std::io::Result<()> {
        info!("Service {} ({}) would be advertised on port {}", record.name, record.service_type, record.port);
        Ok(())
    }

    fn deregister(&self, record: &ServiceRecord) {
        info!("Service {} ({}) withdrawn", record.name, record.service_type);
    }
}
