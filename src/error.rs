use crate::frame::CloseCode;
use flate2::{CompressError, DecompressError};
use httparse::Error as HttpParseError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // General Errors
    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("channel communication error")]
    CommunicationError,

    // Handshake Errors
    #[error("{source}")]
    HttpParseError {
        #[from]
        source: HttpParseError,
    },

    #[error("Incomplete HTTP request")]
    IncompleteHTTPRequest,

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Invalid handshake request method and version")]
    InvalidHTTPHandshake,

    #[error("Connection: Upgrade header missing in the request")]
    NoConnectionHeaderPresent,

    #[error("Upgrade: websocket header missing in the request")]
    NoUpgradeHeaderPresent,

    #[error("Couldn't find Sec-WebSocket-Key header in the request")]
    NoSecWebsocketKey,

    #[error("Unsupported Sec-WebSocket-Version, only 13 is accepted")]
    UnsupportedWebsocketVersion,

    #[error("no handler registered for sub-protocol `{0}`")]
    UnknownProtocol(String),

    // Framing Errors
    #[error("Unknown opcode: {0:#x}")]
    InvalidOpcode(u8),

    #[error("RSV2 or RSV3 bit set")]
    ReservedBitsSet,

    #[error("RSV1 bit set without compression")]
    CompressionNotNegotiated,

    #[error("RSV1 bit set on continuation frame")]
    RsvOnContinuation,

    #[error("Fragmented control frame")]
    ControlFramesFragmented,

    #[error("Control frame payload too large")]
    ControlFramePayloadSize,

    #[error("Frame payload too large ({0} bytes)")]
    MaxFrameSize(usize),

    #[error("Message too big ({0} bytes)")]
    MaxMessageSize(usize),

    #[error("Buffer limit exceeded (needed {needed} bytes, cap is {cap})")]
    BufferLimitExceeded { needed: usize, cap: usize },

    // Fragmentation Errors
    #[error("New data frame during fragmented message")]
    FragmentedInProgress,

    #[error("Continuation frame without initial frame")]
    InvalidContinuationFrame,

    // Payload Errors
    #[error("Invalid UTF-8 data in text message")]
    InvalidUtf8,

    #[error("Invalid close code")]
    InvalidCloseCode(u16),

    #[error("Invalid close frame payload length")]
    InvalidClosePayload,

    // Compression / Decompression Errors
    #[error("Compression failed: {source}")]
    CompressError {
        #[from]
        source: CompressError,
    },

    #[error("Decompression failed: {source}")]
    DecompressError {
        #[from]
        source: DecompressError,
    },

    #[error("Compression stalled")]
    CompressionStalled,

    #[error("Decompression stalled")]
    DecompressionStalled,
}

impl Error {
    /// The RFC 6455 close code a peer observes when this error tears the
    /// connection down.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Error::InvalidUtf8 => CloseCode::InvalidPayload,
            Error::MaxFrameSize(_) | Error::MaxMessageSize(_) => CloseCode::MessageTooBig,
            Error::IOError { .. }
            | Error::CommunicationError
            | Error::BufferLimitExceeded { .. }
            | Error::CompressError { .. }
            | Error::DecompressError { .. }
            | Error::CompressionStalled
            | Error::DecompressionStalled => CloseCode::InternalError,
            _ => CloseCode::ProtocolError,
        }
    }
}
