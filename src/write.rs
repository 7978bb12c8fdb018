use crate::buffer::IoBuffer;
use crate::compression::{CompressionConfig, DEFLATE_TRAILER};
use crate::config::{COMPRESS_MIN_SIZE, OUT_BUFFER_INITIAL_SIZE, OUT_BUFFER_MAX_SIZE};
use crate::encoder::{deflate_bound, Encoder};
use crate::error::Error;
use crate::frame::{close_code_is_valid, CloseCode, OpCode, WS_FIN, WS_RSV1};
use log::warn;

/// The outbound half of a connection: frames are built (and compressed)
/// into a capped staging buffer, and the owning task flushes the staged
/// bytes to the socket.
///
/// Building into a staging buffer instead of writing piecemeal matters for
/// compression: the frame header must precede the payload, but the
/// compressed length is only known after deflating. The send path reserves
/// the worst-case size, compresses in place, then commits the exact frame.
pub(crate) struct FrameWriter {
    out_buffer: IoBuffer,
    encoder: Option<Encoder>,
    max_frame_size: usize,
    close_sent: bool,
    requested_close: Option<(u16, String)>,
}

fn select_header_size(payload_len: usize) -> usize {
    if payload_len < 126 {
        2
    } else if payload_len <= 65535 {
        4
    } else {
        10
    }
}

/// Server-to-client frames are never masked, so the header is just the
/// first byte plus the length encoding.
fn encode_header(dst: &mut [u8], opcode: OpCode, payload_len: usize, fin: bool, rsv1: bool) {
    let mut first_byte = opcode.as_u8();
    if fin {
        first_byte |= WS_FIN;
    }
    if rsv1 {
        first_byte |= WS_RSV1;
    }
    dst[0] = first_byte;

    match dst.len() {
        2 => dst[1] = payload_len as u8,
        4 => {
            dst[1] = 126;
            dst[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
        }
        10 => {
            dst[1] = 127;
            dst[2..10].copy_from_slice(&(payload_len as u64).to_be_bytes());
        }
        _ => unreachable!("header is always 2, 4 or 10 bytes"),
    }
}

impl FrameWriter {
    pub fn new(compression: Option<&CompressionConfig>, max_frame_size: usize) -> Self {
        let encoder = compression.map(|config| {
            Encoder::new(
                config.level,
                config.server_max_window_bits,
                config.server_context_takeover,
            )
        });
        Self {
            out_buffer: IoBuffer::new(OUT_BUFFER_INITIAL_SIZE, OUT_BUFFER_MAX_SIZE),
            encoder,
            max_frame_size,
            close_sent: false,
            requested_close: None,
        }
    }

    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Bytes waiting to be written to the socket.
    pub fn staged(&self) -> &[u8] {
        self.out_buffer.as_slice()
    }

    pub fn has_staged(&self) -> bool {
        !self.out_buffer.is_empty()
    }

    pub fn clear_staged(&mut self) {
        self.out_buffer.clear();
    }

    /// Stage one complete message, fragmenting it when it exceeds the
    /// per-client outbound frame limit. The first frame carries the real
    /// opcode (and RSV1 when compressed), the rest CONTINUATION, the last
    /// one FIN. Returns the total number of wire bytes staged.
    pub fn send_payload(
        &mut self,
        payload: &[u8],
        opcode: OpCode,
        use_compression: bool,
    ) -> Result<usize, Error> {
        if opcode.is_control() && payload.len() > 125 {
            return Err(Error::ControlFramePayloadSize);
        }
        // nothing follows a close frame on this direction
        if self.close_sent {
            return Ok(0);
        }

        let compress = use_compression
            && !opcode.is_control()
            && self.encoder.is_some()
            && payload.len() >= COMPRESS_MIN_SIZE;

        if !compress {
            return self.stage_fragmented(payload, opcode, false);
        }

        if payload.len() <= self.max_frame_size {
            // single compressed frame, deflated straight into the
            // reservation
            return self.stage_compressed_frame(payload, opcode);
        }

        // the message is compressed once as a whole, then the compressed
        // bytes are fragmented; RSV1 only ever appears on the first frame
        let encoder = self
            .encoder
            .as_mut()
            .ok_or(Error::CompressionNotNegotiated)?;
        let compressed = encoder.compress_to_vec(payload)?;
        self.stage_fragmented(&compressed, opcode, true)
    }

    fn stage_fragmented(
        &mut self,
        data: &[u8],
        opcode: OpCode,
        compressed: bool,
    ) -> Result<usize, Error> {
        if data.len() <= self.max_frame_size {
            return self.stage_frame(data, opcode, true, compressed);
        }

        let mut staged = 0;
        let last_chunk = (data.len() - 1) / self.max_frame_size;
        for (i, chunk) in data.chunks(self.max_frame_size).enumerate() {
            let frame_opcode = if i == 0 { opcode } else { OpCode::Continue };
            let fin = i == last_chunk;
            staged += self.stage_frame(chunk, frame_opcode, fin, compressed && i == 0)?;
        }
        Ok(staged)
    }

    /// Stage a single uncompressed frame.
    fn stage_frame(
        &mut self,
        payload: &[u8],
        opcode: OpCode,
        fin: bool,
        rsv1: bool,
    ) -> Result<usize, Error> {
        let header_size = select_header_size(payload.len());
        let frame_size = header_size + payload.len();

        let region = self.out_buffer.reserve(frame_size)?;
        encode_header(&mut region[..header_size], opcode, payload.len(), fin, rsv1);
        region[header_size..].copy_from_slice(payload);
        self.out_buffer.commit(frame_size);

        Ok(frame_size)
    }

    /// Stage a single compressed frame: reserve the worst case, deflate
    /// with a sync flush (the `00 00 FF FF` tail is stripped by the
    /// encoder), then collapse the header if the compressed payload fits a
    /// shorter length encoding.
    fn stage_compressed_frame(&mut self, payload: &[u8], opcode: OpCode) -> Result<usize, Error> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or(Error::CompressionNotNegotiated)?;

        let bound = deflate_bound(payload.len()).max(payload.len()) + DEFLATE_TRAILER.len();
        let header_size = select_header_size(bound);

        let region = self.out_buffer.reserve(header_size + bound)?;
        let written = match encoder.compress_into(payload, &mut region[header_size..]) {
            Ok(written) => written,
            Err(err) => {
                // the stream was reset by the encoder; fall back to the
                // uncompressed payload rather than dropping the message
                warn!("compression failed, sending payload uncompressed: {err}");
                return self.stage_frame(payload, opcode, true, false);
            }
        };

        let optimal_header_size = select_header_size(written);
        let mut header_size = header_size;
        if optimal_header_size < header_size {
            region.copy_within(header_size..header_size + written, optimal_header_size);
            header_size = optimal_header_size;
        }
        encode_header(&mut region[..header_size], opcode, written, true, true);

        let frame_size = header_size + written;
        self.out_buffer.commit(frame_size);
        Ok(frame_size)
    }

    pub fn send_text(&mut self, text: &str) -> Result<usize, Error> {
        self.send_payload(text.as_bytes(), OpCode::Text, true)
    }

    pub fn send_binary(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.send_payload(data, OpCode::Binary, true)
    }

    pub fn send_ping(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.send_payload(data, OpCode::Ping, false)
    }

    pub fn send_pong(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.send_payload(data, OpCode::Pong, false)
    }

    /// Stage a CLOSE frame. At most one close frame is ever sent per
    /// connection; later calls are silently dropped. An invalid code is
    /// substituted with 1002 and an explanatory reason, and the reason is
    /// truncated to keep the control frame within 125 bytes.
    pub fn send_close(&mut self, code: u16, reason: &str) -> Result<bool, Error> {
        if self.close_sent {
            return Ok(false);
        }

        let (code, reason) = if close_code_is_valid(code) {
            (code, reason)
        } else {
            warn!("invalid close code {code}, substituting 1002");
            (CloseCode::ProtocolError.as_u16(), "Invalid close code")
        };

        let mut reason_bytes = reason.as_bytes();
        if reason_bytes.len() > 123 {
            let mut cut = 123;
            while cut > 0 && !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason_bytes = &reason_bytes[..cut];
        }

        let mut payload = Vec::with_capacity(2 + reason_bytes.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason_bytes);

        self.send_payload(&payload, OpCode::Close, false)?;
        self.close_sent = true;
        Ok(true)
    }

    /// Record a close requested from inside a protocol callback; the
    /// session applies it once the callback returns.
    pub fn request_close(&mut self, code: u16, reason: &str) {
        if self.requested_close.is_none() {
            self.requested_close = Some((code, reason.to_owned()));
        }
    }

    pub fn take_requested_close(&mut self) -> Option<(u16, String)> {
        self.requested_close.take()
    }
}
