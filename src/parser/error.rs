//! Error types for the HTTP parser.

use thiserror::Error;

/// Errors that can occur while parsing an HTTP request head.
#[derive(Debug, Error)]
pub enum Error {
    /// The HTTP method in the request is not supported.
    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    /// The request path is invalid or missing.
    #[error("Invalid HTTP path: {0}")]
    InvalidPath(String),

    /// The request line is malformed (wrong format or missing components).
    #[error("Malformed request line: {0}")]
    MalformedRequestLine(String),

    /// The HTTP version in the request is not supported.
    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    /// A header in the request has an invalid format.
    #[error("Invalid header format: {0}")]
    InvalidHeaderFormat(String),

    /// A line exceeded the maximum accepted length.
    #[error("Line too long (more than {0} bytes)")]
    LineTooLong(usize),

    /// The request is empty.
    #[error("Empty request")]
    EmptyRequest,
}
