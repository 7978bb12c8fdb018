use crate::config::MAX_INCOMING_FRAME_SIZE;
use crate::error::Error;

// First-byte flags of a frame header
pub(crate) const WS_FIN: u8 = 0x80;
pub(crate) const WS_RSV1: u8 = 0x40;
pub(crate) const WS_RSV2: u8 = 0x20;
pub(crate) const WS_RSV3: u8 = 0x10;
pub(crate) const WS_MASK: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(Error::InvalidOpcode(other)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// A complete frame extracted from the inbound byte stream, with the
/// masking already undone.
#[derive(Debug, Clone)]
pub struct Frame {
    pub final_fragment: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    pub compressed: bool,
}

impl Frame {
    pub fn new(final_fragment: bool, opcode: OpCode, payload: Vec<u8>, compressed: bool) -> Self {
        Self {
            final_fragment,
            opcode,
            payload,
            compressed,
        }
    }
}

/// A decoded frame header. `frame_size` covers header plus payload, so a
/// reader can tell from the header alone how many bytes the whole frame
/// needs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub mask_key: [u8; 4],
    pub header_size: usize,
    pub payload_length: usize,
    pub frame_size: usize,
}

/// Decode a frame header from the front of `buf`. Returns `Ok(None)` when
/// fewer bytes are present than the header itself needs.
///
/// The length field encoding follows RFC 6455: a 7-bit length, with 126
/// escaping to a 16-bit big-endian length and 127 to a 64-bit big-endian
/// length. A 4-byte mask key follows when the MASK bit is set.
pub(crate) fn parse_frame_header(buf: &[u8]) -> Result<Option<FrameHeader>, Error> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = (buf[0] & WS_FIN) != 0;
    let rsv1 = (buf[0] & WS_RSV1) != 0;
    let rsv2 = (buf[0] & WS_RSV2) != 0;
    let rsv3 = (buf[0] & WS_RSV3) != 0;
    let opcode = OpCode::from(buf[0] & 0x0F)?;

    let masked = (buf[1] & WS_MASK) != 0;
    let len = (buf[1] & 0x7F) as usize;

    let mut header_size = 2;
    let payload_length = if len < 126 {
        len
    } else if len == 126 {
        if buf.len() < 4 {
            return Ok(None);
        }
        header_size += 2;
        u16::from_be_bytes([buf[2], buf[3]]) as usize
    } else {
        if buf.len() < 10 {
            return Ok(None);
        }
        header_size += 8;
        let value = u64::from_be_bytes([
            buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
        ]);
        if value > MAX_INCOMING_FRAME_SIZE as u64 {
            // reject before the value is narrowed to usize
            return Err(Error::MaxFrameSize(value.try_into().unwrap_or(usize::MAX)));
        }
        value as usize
    };

    let mut mask_key = [0u8; 4];
    if masked {
        if buf.len() < header_size + 4 {
            return Ok(None);
        }
        mask_key.copy_from_slice(&buf[header_size..header_size + 4]);
        header_size += 4;
    }

    Ok(Some(FrameHeader {
        fin,
        rsv1,
        rsv2,
        rsv3,
        opcode,
        masked,
        mask_key,
        header_size,
        payload_length,
        frame_size: header_size + payload_length,
    }))
}

/// The mask is applied with a simple bitwise XOR: each payload byte against
/// the corresponding byte (modulo 4) of the 4-byte key. Applying it twice
/// restores the original, so the same routine masks and unmasks.
pub(crate) fn unmask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Close codes as defined by RFC 6455 section 7.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    GoingAway,
    ProtocolError,
    UnsupportedData,
    InvalidPayload,
    PolicyViolation,
    MessageTooBig,
    ExtensionMissing,
    InternalError,
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnsupportedData => 1003,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::ExtensionMissing => 1010,
            CloseCode::InternalError => 1011,
            CloseCode::Other(code) => *code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnsupportedData,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1010 => CloseCode::ExtensionMissing,
            1011 => CloseCode::InternalError,
            other => CloseCode::Other(other),
        }
    }
}

/// Validate a close code according to RFC 6455: 1000-1011 are
/// protocol-defined (1004, 1005 and 1006 must never appear on the wire),
/// 3000-3999 are reserved for libraries and frameworks, 4000-4999 for
/// private use.
pub fn close_code_is_valid(code: u16) -> bool {
    match code {
        1004 | 1005 | 1006 => false,
        1000..=1011 => true,
        3000..=4999 => true,
        _ => false,
    }
}

/// Decode the payload of a CLOSE frame into `(code, reason)`.
///
/// An empty payload means a normal closure without a status code. A single
/// byte cannot carry a status code and is a protocol error. A reason that
/// is not valid UTF-8 is substituted with 1007, per RFC 6455 which requires
/// close reasons to be UTF-8.
pub(crate) fn parse_close_payload(payload: &[u8]) -> Result<(u16, String), Error> {
    if payload.is_empty() {
        return Ok((CloseCode::Normal.as_u16(), String::new()));
    }
    if payload.len() == 1 {
        return Err(Error::InvalidClosePayload);
    }

    let code = u16::from_be_bytes([payload[0], payload[1]]);
    if !close_code_is_valid(code) {
        return Err(Error::InvalidCloseCode(code));
    }

    match std::str::from_utf8(&payload[2..]) {
        Ok(reason) => Ok((code, reason.to_owned())),
        Err(_) => Ok((
            CloseCode::InvalidPayload.as_u16(),
            "Invalid UTF-8 in close reason".to_owned(),
        )),
    }
}
