//! The resource table: path prefixes mapped to content or handlers.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use log::trace;

use crate::server::handler::ResourceHandler;

/// What a registered path serves.
#[derive(Clone)]
pub enum Resource {
    /// Pre-gzipped in-memory content, always sent with `Content-Encoding: gzip`.
    Bytes {
        data: Arc<[u8]>,
        content_type: String,
    },
    /// A file on disk; relative paths are resolved against the home directory.
    File {
        path: PathBuf,
        content_type: String,
    },
    /// A callback that writes its own response.
    Handler(Arc<dyn ResourceHandler>),
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Bytes { data, content_type } => write!(f, "Bytes({} bytes, {content_type})", data.len()),
            Resource::File { path, content_type } => write!(f, "File({}, {content_type})", path.display()),
            Resource::Handler(_) => write!(f, "Handler"),
        }
    }
}

struct Registration {
    prefix: String,
    resource: Resource,
}

/// Insertion-ordered resource table.
///
/// Lookups scan from the most recent registration backwards and return the
/// first entry whose prefix matches, so a later registration shadows an
/// earlier one with an overlapping prefix. The mutex is only held while the
/// table is scanned or edited; matches are handed out as cheap clones.
#[derive(Default)]
pub struct ResourceRegistry {
    entries: Mutex<Vec<Registration>>,
}

impl ResourceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<Registration>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `resource` under `prefix`, ahead of everything registered before.
    pub fn register(&self, prefix: impl Into<String>, resource: Resource) {
        let prefix = prefix.into();
        trace!("Resource {prefix} {resource:?} added");
        self.entries().push(Registration { prefix, resource });
    }

    /// Register pre-compressed in-memory content.
    pub fn add_bytes(&self, prefix: impl Into<String>, data: impl Into<Arc<[u8]>>, content_type: impl Into<String>) {
        self.register(
            prefix,
            Resource::Bytes {
                data: data.into(),
                content_type: content_type.into(),
            },
        );
    }

    /// Register a file.
    pub fn add_file(&self, prefix: impl Into<String>, path: impl Into<PathBuf>, content_type: impl Into<String>) {
        self.register(
            prefix,
            Resource::File {
                path: path.into(),
                content_type: content_type.into(),
            },
        );
    }

    /// Register a handler.
    pub fn add_handler(&self, prefix: impl Into<String>, handler: Arc<dyn ResourceHandler>) {
        self.register(prefix, Resource::Handler(handler));
    }

    /// Remove the most recent registration whose prefix equals `prefix` exactly.
    pub fn unregister(&self, prefix: &str) -> bool {
        let mut entries = self.entries();
        match entries.iter().rposition(|entry| entry.prefix == prefix) {
            Some(index) => {
                entries.remove(index);
                trace!("Resource {prefix} removed");
                true
            }
            None => false,
        }
    }

    /// Remove every registration.
    pub fn unregister_all(&self) {
        let mut entries = self.entries();
        for entry in entries.iter() {
            trace!("Resource {} removed", entry.prefix);
        }
        entries.clear();
    }

    /// Find the newest registration whose prefix is a prefix of `path`.
    pub fn lookup(&self, path: &str) -> Option<Resource> {
        self.entries()
            .iter()
            .rev()
            .find(|entry| path.starts_with(&entry.prefix))
            .map(|entry| entry.resource.clone())
    }

    /// Registered prefixes in lookup order, newest first.
    pub fn prefixes(&self) -> Vec<String> {
        self.entries().iter().rev().map(|entry| entry.prefix.clone()).collect()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(resource: Option<Resource>) -> Option<Vec<u8>> {
        match resource {
            Some(Resource::Bytes { data, .. }) => Some(data.to_vec()),
            _ => None,
        }
    }

    #[test]
    fn test_lookup_prefers_newest_match() {
        let registry = ResourceRegistry::new();
        registry.add_bytes("/", &b"root"[..], "text/plain");
        registry.add_bytes("/ctrl", &b"ctrl"[..], "text/plain");

        assert_eq!(body(registry.lookup("/ctrl.html")), Some(b"ctrl".to_vec()));
        assert_eq!(body(registry.lookup("/mng.html")), Some(b"root".to_vec()));

        // A later, broader prefix shadows the narrower one.
        registry.add_bytes("/", &b"new root"[..], "text/plain");
        assert_eq!(body(registry.lookup("/ctrl.html")), Some(b"new root".to_vec()));
        assert_eq!(registry.prefixes(), vec!["/", "/ctrl", "/"]);
    }

    #[test]
    fn test_unregister_removes_newest_exact_match_only() {
        let registry = ResourceRegistry::new();
        registry.add_bytes("/a", &b"old"[..], "text/plain");
        registry.add_bytes("/a", &b"new"[..], "text/plain");

        assert!(!registry.unregister("/a/b"));
        assert!(registry.unregister("/a"));
        assert_eq!(body(registry.lookup("/a")), Some(b"old".to_vec()));
        assert!(registry.unregister("/a"));
        assert!(registry.lookup("/a").is_none());
        assert!(!registry.unregister("/a"));
    }

    #[test]
    fn test_unregister_all() {
        let registry = ResourceRegistry::new();
        registry.add_file("/log", "indigo.log", "text/plain");
        registry.add_bytes("/", &b"x"[..], "text/html");
        assert_eq!(registry.len(), 2);

        registry.unregister_all();
        assert!(registry.is_empty());
        assert!(registry.lookup("/log").is_none());
    }
}
