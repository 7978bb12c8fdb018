use crate::client::ClientInfo;
use crate::error::Error;
use crate::frame::OpCode;
use crate::registry::Registry;
use crate::write::FrameWriter;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

/// The callback surface a sub-protocol implements. One handler instance is
/// built per client at handshake time and bound for the client's lifetime;
/// every method runs on the client's owning task, so handlers can keep
/// per-client state without synchronisation.
pub trait ProtocolHandler: Send {
    /// Called once when the client has been handed to its worker and is
    /// ready to exchange messages. The connection is already open.
    fn on_connect(&mut self, _client: &mut ClientContext<'_>) {}

    /// Called for every complete non-control message, after decompression
    /// and (for text) UTF-8 validation.
    fn on_message(&mut self, client: &mut ClientContext<'_>, payload: &[u8], opcode: OpCode);

    /// Called before a CLOSE frame is sent to the peer; the handler may
    /// enqueue one last message.
    fn on_close(&mut self, _client: &mut ClientContext<'_>, _code: u16, _reason: &str) {}

    /// Called exactly once when the client is about to be freed.
    fn on_disconnect(&mut self, _client: &mut ClientContext<'_>) {}
}

/// What a handler sees of its client: identity plus the send API. Sends
/// are staged into the outbound buffer and flushed by the owning task once
/// the callback returns.
pub struct ClientContext<'a> {
    writer: &'a mut FrameWriter,
    info: &'a ClientInfo,
    registry: &'a Registry,
}

impl<'a> ClientContext<'a> {
    pub(crate) fn new(
        writer: &'a mut FrameWriter,
        info: &'a ClientInfo,
        registry: &'a Registry,
    ) -> Self {
        Self {
            writer,
            info,
            registry,
        }
    }

    pub fn info(&self) -> &ClientInfo {
        self.info
    }

    pub fn send_text(&mut self, text: &str) -> Result<(), Error> {
        self.writer.send_text(text).map(|_| ())
    }

    pub fn send_binary(&mut self, data: &[u8]) -> Result<(), Error> {
        self.writer.send_binary(data).map(|_| ())
    }

    /// Send a message with an explicit opcode and compression choice.
    pub fn send_frame(
        &mut self,
        payload: &[u8],
        opcode: OpCode,
        use_compression: bool,
    ) -> Result<(), Error> {
        self.writer
            .send_payload(payload, opcode, use_compression)
            .map(|_| ())
    }

    /// Deliver a message to every open client of the server, this one
    /// included.
    pub fn broadcast(&self, payload: &[u8], opcode: OpCode) {
        self.registry.broadcast(payload.to_vec(), opcode);
    }

    /// Ask the core to start the closing handshake once the current
    /// callback returns.
    pub fn close(&mut self, code: u16, reason: &str) {
        self.writer.request_close(code, reason);
    }
}

/// Factory building one handler instance per accepted client.
pub type HandlerFactory = Arc<dyn Fn(&ClientInfo) -> Box<dyn ProtocolHandler> + Send + Sync>;

/// Named sub-protocols the server accepts. The `echo` protocol is built
/// in; applications register their own handlers (e.g. `jsonrpc`, `mcp`)
/// under the name clients negotiate.
#[derive(Clone)]
pub struct ProtocolRegistry {
    handlers: HashMap<String, HandlerFactory>,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register("echo", |_| Box::new(EchoProtocol));
        registry
    }
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ClientInfo) -> Box<dyn ProtocolHandler> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_owned(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<&HandlerFactory> {
        self.handlers.get(name)
    }

    /// Pick the sub-protocol for an upgrade: the first recognised token of
    /// the `Sec-WebSocket-Protocol` header wins, falling back to the first
    /// URL path segment. The bool reports whether the header chose it,
    /// which decides whether the response echoes `Sec-WebSocket-Protocol`.
    pub(crate) fn select(
        &self,
        header_protocols: &[String],
        path_protocol: Option<&str>,
    ) -> Option<(String, bool)> {
        for name in header_protocols {
            if self.contains(name) {
                return Some((name.clone(), true));
            }
        }
        match path_protocol {
            Some(name) if self.contains(name) => Some((name.to_owned(), false)),
            _ => None,
        }
    }
}

/// The built-in echo sub-protocol: every data message is mirrored back
/// with the same opcode. Mostly useful for tests and protocol-level
/// debugging against autobahn-style clients.
pub struct EchoProtocol;

impl ProtocolHandler for EchoProtocol {
    fn on_message(&mut self, client: &mut ClientContext<'_>, payload: &[u8], opcode: OpCode) {
        if let Err(err) = client.send_frame(payload, opcode, true) {
            debug!(
                "echo: failed to mirror {} byte message back to client {}: {err}",
                payload.len(),
                client.info().id
            );
        }
    }

    fn on_disconnect(&mut self, client: &mut ClientContext<'_>) {
        debug!("echo: client {} disconnected", client.info().id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_has_echo() {
        let registry = ProtocolRegistry::default();
        assert!(registry.contains("echo"));
        assert!(!registry.contains("jsonrpc"));
    }

    #[test]
    fn test_select_prefers_header_over_path() {
        let mut registry = ProtocolRegistry::default();
        registry.register("jsonrpc", |_| Box::new(EchoProtocol));

        let header = vec!["unknown".to_owned(), "jsonrpc".to_owned()];
        let (name, from_header) = registry.select(&header, Some("echo")).unwrap();
        assert_eq!(name, "jsonrpc");
        assert!(from_header);

        let (name, from_header) = registry.select(&[], Some("echo")).unwrap();
        assert_eq!(name, "echo");
        assert!(!from_header);

        assert!(registry.select(&[], Some("mcp")).is_none());
        assert!(registry.select(&[], None).is_none());
    }
}
