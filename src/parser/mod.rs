//! HTTP request-head parsing.
//!
//! The server only understands a deliberately small slice of HTTP/1.1: a
//! request line with `GET` or `PUT`, followed by header lines up to a blank
//! line. Parsing works line by line because the connection worker reads the
//! head incrementally from the socket and may hand the very same socket to a
//! WebSocket adapter right after the head.

mod request;
mod method;
mod version;
mod error;

// Re-export public items
pub use request::{RequestHead, RequestLine, parse_header_line, parse_query};
pub use method::Method;
pub use version::HttpVersion;
pub use error::Error;

/// Maximum length of a single request or header line, terminator included.
pub const MAX_LINE_LENGTH: usize = 1024;
