//! Error types for the BLOB cache.

use thiserror::Error;

use crate::blob::BlobId;

/// Errors that can occur while reading or replacing a BLOB.
#[derive(Debug, Error)]
pub enum BlobError {
    /// No entry is registered under this id.
    #[error("BLOB {0} not found")]
    NotFound(BlobId),

    /// The populator could not produce content; the entry stays unpopulated.
    #[error("BLOB {id} could not be populated: {source}")]
    Unavailable {
        id: BlobId,
        #[source]
        source: std::io::Error,
    },

    /// A transfer buffer of the given size could not be allocated.
    #[error("Out of buffer memory ({0} bytes)")]
    OutOfMemory(usize),

    /// Gzip compression of the scratch buffer failed.
    #[error("Compression failed: {0}")]
    Compression(#[source] std::io::Error),
}
