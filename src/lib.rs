//! Multi-client WebSocket server runtime for the Tokio stack.
//!
//! This library implements the server side of the
//! [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455)
//! together with the RFC 7692 `permessage-deflate` extension: upgrade
//! handshakes, frame parsing and validation, masking, fragmentation,
//! streaming compression with negotiable context takeover, the closing
//! handshake, keepalive pings and idle timeouts.
//!
//! Accepted clients are spread across a small pool of I/O workers and each
//! connection is driven by a single task that owns all of its state.
//! Applications plug in sub-protocols (`echo` is built in) through the
//! [`ProtocolHandler`] callback surface, negotiated per connection via the
//! `Sec-WebSocket-Protocol` header or the request path.

mod buffer;
mod client;
pub mod compression;
pub mod config;
mod decoder;
mod encoder;
pub mod error;
pub mod frame;
mod handshake;
mod message;
pub mod protocol;
mod read;
mod registry;
pub mod server;
mod stream;
mod worker;
mod write;

#[cfg(test)]
mod tests;

pub use client::{ClientInfo, ConnectionState};
pub use compression::Extensions;
pub use config::{ServerConfig, WebSocketConfig};
pub use error::Error;
pub use frame::{CloseCode, OpCode};
pub use handshake::generate_websocket_accept_value;
pub use protocol::{ClientContext, EchoProtocol, ProtocolHandler, ProtocolRegistry};
pub use registry::ClientId;
pub use server::{start_server, start_server_with_config, WsServer};
