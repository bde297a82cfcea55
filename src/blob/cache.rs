//! Per-entry locked BLOB storage.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use flate2::Compression;
use flate2::write::GzEncoder;
use log::{debug, error, trace};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::blob::error::BlobError;

/// URL prefix under which BLOBs are served.
pub const BLOB_PATH_PREFIX: &str = "/blob/";

/// Opaque, server-issued identifier of a BLOB entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(u64);

impl BlobId {
    /// Extract the id from a `/blob/<id>.<ext>` request path.
    ///
    /// The extension is informational only and is not checked.
    pub fn from_url_path(path: &str) -> Option<Self> {
        let rest = path.strip_prefix(BLOB_PATH_PREFIX)?;
        let id = rest.split_once('.').map_or(rest, |(id, _)| id);
        id.parse().ok()
    }

    /// The raw numeric value.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BlobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(BlobId)
    }
}

/// Content handed back by a [`BlobPopulator`].
#[derive(Debug, Clone)]
pub struct PopulatedBlob {
    /// The payload
    pub content: Vec<u8>,
    /// Format extension including the leading dot, e.g. `.fits`
    pub format: String,
}

/// Produces the content of an entry the first time it is read.
///
/// Implemented by the device layer. Runs on tokio's blocking pool, so it may
/// talk to hardware synchronously. The entry lock is held meanwhile, and a
/// concurrent `PUT` on the same entry waits for population to finish.
pub trait BlobPopulator: Send + Sync {
    /// Produce the payload for `id`, currently declared with `format`.
    fn populate(&self, id: BlobId, format: &str) -> std::io::Result<PopulatedBlob>;
}

/// The mutable part of an entry, behind the entry lock.
#[derive(Debug)]
struct BlobContent {
    content: Vec<u8>,
    format: String,
}

impl BlobContent {
    // An empty buffer doubles as "not yet populated".
    fn is_populated(&self) -> bool {
        !self.content.is_empty()
    }
}

type Entry = Arc<Mutex<BlobContent>>;

/// Index of BLOB entries with one lock per entry.
///
/// The index itself is behind a short-lived `RwLock` that is only held to
/// clone an entry handle out; all content access goes through the entry's
/// own async mutex, which may be held across network writes.
pub struct BlobCache {
    entries: RwLock<HashMap<BlobId, Entry>>,
    next_id: AtomicU64,
    populator: Option<Arc<dyn BlobPopulator>>,
}

impl Default for BlobCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobCache")
            .field("entries", &self.len())
            .field("has_populator", &self.populator.is_some())
            .finish()
    }
}

impl BlobCache {
    /// Create a cache without a populator; entries must be filled via [`BlobCache::replace`].
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            populator: None,
        }
    }

    /// Create a cache that fills empty entries on first read.
    pub fn with_populator(populator: Arc<dyn BlobPopulator>) -> Self {
        Self {
            populator: Some(populator),
            ..Self::new()
        }
    }

    /// Declare a new, unpopulated entry and return its id.
    pub fn declare(&self, format: impl Into<String>) -> BlobId {
        let id = BlobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(Mutex::new(BlobContent {
            content: Vec::new(),
            format: format.into(),
        }));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, entry);
        trace!("BLOB {id} declared");
        id
    }

    /// Drop an entry. Readers already holding its lock finish undisturbed.
    pub fn forget(&self, id: BlobId) -> bool {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            trace!("BLOB {id} removed");
        }
        removed
    }

    /// Check whether an entry exists.
    pub fn contains(&self, id: BlobId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Number of declared entries.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no entries are declared.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The URL path clients use to fetch `id`, e.g. `/blob/7.fits`.
    pub async fn url_path(&self, id: BlobId) -> Result<String, BlobError> {
        let guard = self.lock(id).await?;
        Ok(format!("{BLOB_PATH_PREFIX}{id}{}", guard.format()))
    }

    fn entry(&self, id: BlobId) -> Result<Entry, BlobError> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(BlobError::NotFound(id))
    }

    /// Acquire the entry lock without populating.
    pub async fn lock(&self, id: BlobId) -> Result<BlobGuard, BlobError> {
        let entry = self.entry(id)?;
        let guard = entry.lock_owned().await;
        Ok(BlobGuard { id, guard })
    }

    /// Acquire the entry lock, populating the entry first if it is empty.
    ///
    /// On population failure the lock is released and the entry stays
    /// unpopulated so a later read can try again.
    pub async fn get_or_populate(&self, id: BlobId) -> Result<BlobGuard, BlobError> {
        let mut guard = self.lock(id).await?;
        if guard.guard.is_populated() {
            return Ok(guard);
        }

        let Some(populator) = self.populator.clone() else {
            return Err(BlobError::Unavailable {
                id,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no content and no populator"),
            });
        };

        let format = guard.guard.format.clone();
        let populated = tokio::task::spawn_blocking(move || populator.populate(id, &format))
            .await
            .unwrap_or_else(|join| Err(std::io::Error::new(std::io::ErrorKind::Other, join)));
        match populated {
            Ok(populated) => {
                debug!("BLOB {id} populated with {} bytes", populated.content.len());
                guard.guard.content = populated.content;
                guard.guard.format = populated.format;
                Ok(guard)
            }
            Err(source) => {
                error!("Failed to populate BLOB {id}: {source}");
                Err(BlobError::Unavailable { id, source })
            }
        }
    }

    /// Install new content for `id`, releasing the previous buffer.
    pub async fn replace(&self, id: BlobId, content: Vec<u8>) -> Result<(), BlobError> {
        let mut guard = self.lock(id).await?;
        let size = content.len();
        // The old buffer is dropped here, while the lock is still held.
        guard.guard.content = content;
        trace!("BLOB {id} replaced with {size} bytes");
        Ok(())
    }

    /// Replace the content and the format of `id` in one step.
    pub async fn replace_with_format(
        &self,
        id: BlobId,
        content: Vec<u8>,
        format: impl Into<String>,
    ) -> Result<(), BlobError> {
        let mut guard = self.lock(id).await?;
        guard.guard.content = content;
        guard.guard.format = format.into();
        Ok(())
    }

    /// Discard the content of `id` so that the next read populates it again.
    pub async fn invalidate(&self, id: BlobId) -> Result<(), BlobError> {
        let mut guard = self.lock(id).await?;
        guard.guard.content = Vec::new();
        Ok(())
    }
}

/// Exclusive access to one entry. The entry lock is released on drop.
pub struct BlobGuard {
    id: BlobId,
    guard: OwnedMutexGuard<BlobContent>,
}

impl fmt::Debug for BlobGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobGuard")
            .field("id", &self.id)
            .field("size", &self.size())
            .field("format", &self.format())
            .finish()
    }
}

impl BlobGuard {
    /// The id of the locked entry.
    pub fn id(&self) -> BlobId {
        self.id
    }

    /// The current content; empty if unpopulated.
    pub fn content(&self) -> &[u8] {
        &self.guard.content
    }

    /// The size of the current content in bytes.
    pub fn size(&self) -> usize {
        self.guard.content.len()
    }

    /// The format extension, including the leading dot.
    pub fn format(&self) -> &str {
        &self.guard.format
    }

    /// Copy (and optionally gzip) the content into a private scratch buffer.
    ///
    /// The caller is expected to drop the guard right after this returns so
    /// the lock is held only for the copy, not for the network transfer.
    pub fn snapshot(&self, compress: bool) -> Result<BlobSnapshot, BlobError> {
        let size = self.size();
        let mut scratch = Vec::new();
        scratch
            .try_reserve_exact(size)
            .map_err(|_| BlobError::OutOfMemory(size))?;

        if compress {
            let mut encoder = GzEncoder::new(scratch, Compression::default());
            encoder.write_all(self.content()).map_err(BlobError::Compression)?;
            let body = encoder.finish().map_err(BlobError::Compression)?;
            trace!("BLOB {} compressed {size} -> {} bytes", self.id, body.len());
            Ok(BlobSnapshot {
                body,
                format: self.format().to_string(),
                uncompressed_len: Some(size),
            })
        } else {
            scratch.extend_from_slice(self.content());
            Ok(BlobSnapshot {
                body: scratch,
                format: self.format().to_string(),
                uncompressed_len: None,
            })
        }
    }
}

/// A private copy of a BLOB, detached from the entry lock.
#[derive(Debug, Clone)]
pub struct BlobSnapshot {
    /// The bytes to transfer
    pub body: Vec<u8>,
    /// The format extension at the time of the copy
    pub format: String,
    /// Original length when `body` is gzip-compressed
    pub uncompressed_len: Option<usize>,
}

impl BlobSnapshot {
    /// Whether `body` holds gzip-compressed data.
    pub fn is_compressed(&self) -> bool {
        self.uncompressed_len.is_some()
    }
}
