//! Error types for the server.

use std::time::Duration;

use thiserror::Error;

use crate::blob::BlobError;
use crate::parser::Error as ParserError;

/// Errors that can occur during server operation.
///
/// Only [`Error::CannotStart`] and [`Error::Config`] ever reach the caller of
/// the lifecycle API; everything else stays inside the connection it came
/// from and is logged there.
#[derive(Debug, Error)]
pub enum Error {
    /// The listening socket could not be set up.
    #[error("Can't start server: {context} ({source})")]
    CannotStart {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Error parsing an HTTP request.
    #[error("Parse error: {0}")]
    ParseError(#[from] ParserError),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A response write did not complete within the send timeout.
    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    /// Requested resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// BLOB lookup, population or allocation failed.
    #[error("BLOB error: {0}")]
    Blob(#[from] BlobError),

    /// Internal server error, typically raised by a handler resource.
    #[error("Internal server error: {0}")]
    InternalError(String),

    /// The configuration document could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error is an ordinary client mistake rather than a fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::ParseError(_) | Error::NotFound(_) | Error::Blob(BlobError::NotFound(_))
        )
    }
}
