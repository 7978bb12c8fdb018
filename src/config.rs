use rustls::ServerConfig as RustlsConfig;
use std::sync::Arc;
use std::time::Duration;

/// Handshake key suffix defined by RFC 6455.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// Frame size limits for protection against DoS and browser compatibility
pub(crate) const MAX_INCOMING_FRAME_SIZE: usize = 20 * 1024 * 1024;
pub(crate) const MAX_OUTGOING_FRAME_SIZE: usize = 4 * 1024 * 1024;
pub(crate) const MIN_OUTGOING_FRAME_SIZE: usize = 1024;
pub(crate) const MAX_DECOMPRESSED_SIZE: usize = 200 * 1024 * 1024;

// Payloads below this size are never worth compressing
pub(crate) const COMPRESS_MIN_SIZE: usize = 64;

// Size used for network read operations
pub(crate) const RECEIVE_CHUNK_SIZE: usize = 4096;

// Initial sizes and hard caps for the per-client byte buffers
pub(crate) const IN_BUFFER_INITIAL_SIZE: usize = 8192;
pub(crate) const IN_BUFFER_MAX_SIZE: usize = 20 * 1024 * 1024;
pub(crate) const OUT_BUFFER_INITIAL_SIZE: usize = 16384;
pub(crate) const OUT_BUFFER_MAX_SIZE: usize = 20 * 1024 * 1024;
pub(crate) const PAYLOAD_INITIAL_SIZE: usize = 8192;
pub(crate) const UNPACKED_INITIAL_SIZE: usize = 16384;

// Housekeeping cadence and the timeouts it enforces
pub(crate) const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const IDLE_PING_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);
pub(crate) const CLOSING_STATE_TIMEOUT: Duration = Duration::from_secs(5);

// Graceful shutdown budgets
pub(crate) const SHUTDOWN_CLIENT_BUDGET: Duration = Duration::from_millis(100);
pub(crate) const SHUTDOWN_TOTAL_BUDGET: Duration = Duration::from_secs(5);

// Upgrade request limits
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const HANDSHAKE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const MAX_HANDSHAKE_SIZE: usize = 16 * 1024;

pub(crate) const DEFAULT_IO_WORKERS: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub web_socket_config: Option<WebSocketConfig>,
    pub tls_config: Option<Arc<RustlsConfig>>,
    /// Number of I/O workers clients are spread across. Zero falls back to
    /// the default of 2.
    pub io_workers: usize,
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Upper bound for a single outgoing frame; larger messages are
    /// fragmented. Clients may lower or raise it per connection with the
    /// `max_frame_size` query parameter, clamped to 1 KiB - 20 MiB.
    pub max_outbound_frame_size: usize,
    /// Whether to accept a `permessage-deflate` offer from clients.
    pub permessage_deflate: bool,
    /// Deflate level used for outgoing messages, 0-9.
    pub compression_level: u32,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            max_outbound_frame_size: MAX_OUTGOING_FRAME_SIZE,
            permessage_deflate: true,
            compression_level: 6,
        }
    }
}

/// Clamp a client-requested outbound frame size to sane bounds.
pub(crate) fn clamp_outbound_frame_size(requested: usize) -> usize {
    requested.clamp(MIN_OUTGOING_FRAME_SIZE, MAX_INCOMING_FRAME_SIZE)
}
