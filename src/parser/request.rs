//! Request line and header parsing.

use std::collections::HashMap;
use std::str::FromStr;

use crate::parser::error::Error;
use crate::parser::method::Method;
use crate::parser::version::HttpVersion;

/// Media type a client sends in `Accept` to ask handlers for raw image bytes.
const IMAGEBYTES_MEDIA_TYPE: &str = "application/imagebytes";

/// The first line of an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    /// The HTTP method (GET or PUT)
    pub method: Method,
    /// The request path, without the query string
    pub path: String,
    /// The raw query string, if one followed a `?`
    pub query: Option<String>,
    /// The HTTP version; absent for bare `GET /path` lines
    pub version: Option<HttpVersion>,
}

impl RequestLine {
    /// Parse a request line such as `GET /blob/3.fits HTTP/1.1`.
    ///
    /// The trailing line terminator must already be stripped.
    pub fn parse(line: &str) -> Result<Self, Error> {
        if line.is_empty() {
            return Err(Error::EmptyRequest);
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(Error::MalformedRequestLine(line.to_string()));
        }

        let method = Method::from_str(parts[0])?;

        let target = parts[1];
        if !target.starts_with('/') {
            return Err(Error::InvalidPath(target.to_string()));
        }
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };

        let version = parts.get(2).map(|v| HttpVersion::from_str(v)).transpose()?;

        Ok(Self {
            method,
            path,
            query,
            version,
        })
    }

    /// Query parameters parsed from the query string.
    pub fn query_params(&self) -> HashMap<String, String> {
        self.query.as_deref().map(parse_query).unwrap_or_default()
    }
}

/// Split `name=value&flag` pairs into a map. Bare names map to an empty value.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| {
            if let Some((k, v)) = pair.split_once('=') {
                (k.to_string(), v.to_string())
            } else {
                (pair.to_string(), String::new())
            }
        })
        .collect()
}

/// Split a `Name: value` header line, trimming whitespace around both parts.
pub fn parse_header_line(line: &str) -> Result<(&str, &str), Error> {
    match line.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value.trim())),
        _ => Err(Error::InvalidHeaderFormat(line.to_string())),
    }
}

/// What the server extracts from the request headers.
///
/// Only a handful of headers influence dispatch; everything else is kept in
/// `headers` for handler resources and otherwise ignored.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Value of `Sec-WebSocket-Key`, if the client asked for an upgrade
    pub websocket_key: Option<String>,
    /// False once the client sent `Connection: close`
    pub keep_alive: bool,
    /// The client listed `gzip` in `Accept-Encoding`
    pub accepts_gzip: bool,
    /// The client listed `application/imagebytes` in `Accept`
    pub accepts_imagebytes: bool,
    /// Value of `Content-Length`, if present and numeric
    pub content_length: Option<u64>,
    /// All headers in arrival order
    pub headers: Vec<(String, String)>,
}

impl Default for RequestHead {
    fn default() -> Self {
        Self {
            websocket_key: None,
            keep_alive: true,
            accepts_gzip: false,
            accepts_imagebytes: false,
            content_length: None,
            headers: Vec::new(),
        }
    }
}

impl RequestHead {
    /// Fold one header line into the head.
    ///
    /// Header names are matched case-insensitively. Malformed lines are
    /// reported so the caller can decide whether to tolerate them.
    pub fn apply_header_line(&mut self, line: &str) -> Result<(), Error> {
        let (name, value) = parse_header_line(line)?;

        if name.eq_ignore_ascii_case("Sec-WebSocket-Key") {
            self.websocket_key = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("Connection") {
            if value.eq_ignore_ascii_case("close") {
                self.keep_alive = false;
            }
        } else if name.eq_ignore_ascii_case("Accept-Encoding") {
            if value.contains("gzip") {
                self.accepts_gzip = true;
            }
        } else if name.eq_ignore_ascii_case("Accept") {
            if value.contains(IMAGEBYTES_MEDIA_TYPE) {
                self.accepts_imagebytes = true;
            }
        } else if name.eq_ignore_ascii_case("Content-Length") {
            self.content_length = value.parse().ok();
        }

        self.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// Get a header value, case-insensitively.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The method token handed to handler resources for a GET, reflecting the
    /// negotiated encoding.
    pub fn get_method_token(&self) -> &'static str {
        if self.accepts_imagebytes {
            "GET/IMAGEBYTES"
        } else if self.accepts_gzip {
            "GET/GZIP"
        } else {
            "GET"
        }
    }
}
