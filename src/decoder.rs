use crate::compression::DEFLATE_TRAILER;
use crate::config::UNPACKED_INITIAL_SIZE;
use crate::error::Error;
use flate2::{Decompress, FlushDecompress, Status};

/// Streaming inflate for incoming compressed messages (client-to-server
/// direction).
///
/// The stream lives for the whole connection so that, when the client keeps
/// its compression context across messages, this side keeps the matching
/// decompression context. When `client_no_context_takeover` was negotiated
/// the stream is reset after every message instead. A mismatch here against
/// what the handshake agreed corrupts every message after the first, which
/// is why the negotiated flags are threaded through verbatim.
pub(crate) struct Decoder {
    stream: Decompress,
    context_takeover: bool,
    max_message_size: usize,
}

impl Decoder {
    pub fn new(window_bits: u8, context_takeover: bool, max_message_size: usize) -> Self {
        // a window at least as large as the compressor's always inflates
        // correctly, and zlib does not accept raw windows below 9 bits
        let bits = window_bits.max(9);
        Self {
            stream: Decompress::new_with_window_bits(false, bits),
            context_takeover,
            max_message_size,
        }
    }

    /// Inflate one complete message payload. Per RFC 7692 the sync-flush
    /// tail `00 00 FF FF` that the sender stripped is appended back before
    /// inflating. The output grows by doubling, capped at the maximum
    /// decompressed message size.
    pub fn decompress(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let mut input = Vec::with_capacity(payload.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let initial = UNPACKED_INITIAL_SIZE
            .max(payload.len() * 2)
            .min(self.max_message_size);
        let mut out: Vec<u8> = Vec::with_capacity(initial);

        let before_in = self.stream.total_in();

        let mut retries = 24;
        loop {
            let consumed = (self.stream.total_in() - before_in) as usize;

            if out.len() == out.capacity() {
                if out.capacity() >= self.max_message_size {
                    return Err(Error::MaxMessageSize(out.capacity()));
                }
                let wanted = (out.capacity() * 2).min(self.max_message_size);
                out.reserve(wanted - out.len());
            }

            let status =
                self.stream
                    .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)?;

            let consumed = (self.stream.total_in() - before_in) as usize;

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    // done once every input byte is consumed and the output
                    // still has spare room
                    if consumed == input.len() && out.len() < out.capacity() {
                        break;
                    }
                }
            }

            retries -= 1;
            if retries == 0 {
                self.reset();
                return Err(Error::DecompressionStalled);
            }
        }

        if !self.context_takeover {
            self.stream.reset(false);
        }

        Ok(out)
    }

    /// Drop all decompression history, e.g. after a stream error.
    pub fn reset(&mut self) {
        self.stream.reset(false);
    }
}
