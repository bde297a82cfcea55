//! WebSocket opening handshake (RFC 6455, section 4.2.2).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::server::response::{HttpResponse, StatusCode};
use crate::sha1;

/// GUID appended to the client key before hashing.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key`.
pub fn accept_token(key: &str) -> String {
    let mut input = Vec::with_capacity(key.len() + WEBSOCKET_GUID.len());
    input.extend_from_slice(key.as_bytes());
    input.extend_from_slice(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(sha1::digest(&input))
}

/// The `101 Switching Protocols` response completing the handshake.
pub fn handshake_response(key: &str) -> HttpResponse {
    HttpResponse::new(StatusCode::SwitchingProtocols)
        .with_header("Upgrade", "websocket")
        .with_header("Connection", "upgrade")
        .with_header("Sec-WebSocket-Accept", accept_token(key))
}
