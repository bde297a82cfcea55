//! BLOB cache.
//!
//! Devices publish large binary payloads (images, mostly) out-of-band from the
//! protocol stream. Each payload lives in an entry keyed by a server-issued
//! [`BlobId`] and guarded by its own lock, so traffic on one BLOB never waits
//! on another. Content is populated lazily on first read and can be replaced
//! wholesale by a `PUT`.

mod cache;
mod error;

pub use cache::{BLOB_PATH_PREFIX, BlobCache, BlobGuard, BlobId, BlobPopulator, BlobSnapshot, PopulatedBlob};
pub use error::BlobError;

/// Format of JPEG payloads; these are already compressed.
pub const JPEG_FORMAT: &str = ".jpeg";

/// Whether a payload in `format` is worth gzip-compressing before transfer.
pub fn is_compressible(format: &str) -> bool {
    format != JPEG_FORMAT
}
