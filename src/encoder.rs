use crate::compression::DEFLATE_TRAILER;
use crate::error::Error;
use flate2::{Compress, Compression, FlushCompress, Status};

/// Streaming deflate for outgoing messages (server-to-client direction).
///
/// The stream lives for the whole connection. When the peer negotiated
/// `server_no_context_takeover` the stream is reset after every message, so
/// no compression history crosses a message boundary; otherwise the LZ77
/// window is carried over, which is where most of the ratio comes from on
/// repetitive traffic.
pub(crate) struct Encoder {
    stream: Compress,
    context_takeover: bool,
}

/// Worst-case size of deflate output for `len` input bytes, matching
/// zlib's deflateBound for a raw stream.
pub(crate) fn deflate_bound(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13
}

impl Encoder {
    pub fn new(level: u32, window_bits: u8, context_takeover: bool) -> Self {
        // zlib rejects raw deflate with a window below 9 bits and promotes
        // 8 to 9 itself; do the same here so the stream always initialises
        let bits = window_bits.max(9);
        Self {
            stream: Compress::new_with_window_bits(Compression::new(level), false, bits),
            context_takeover,
        }
    }

    /// Compress `input` into `out` with a sync flush, strip the trailing
    /// `00 00 FF FF` and return the number of bytes written. `out` must be
    /// at least `deflate_bound(input.len()) + 4` bytes.
    pub fn compress_into(&mut self, input: &[u8], out: &mut [u8]) -> Result<usize, Error> {
        let before_in = self.stream.total_in();
        let before_out = self.stream.total_out();

        let mut rounds = 32;
        loop {
            let consumed = (self.stream.total_in() - before_in) as usize;
            let produced = (self.stream.total_out() - before_out) as usize;

            let status =
                self.stream
                    .compress(&input[consumed..], &mut out[produced..], FlushCompress::Sync)?;

            let consumed = (self.stream.total_in() - before_in) as usize;
            let produced = (self.stream.total_out() - before_out) as usize;

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    // a sync flush is complete once all input is consumed
                    // and the output buffer still has room to spare
                    if consumed == input.len() && produced < out.len() {
                        break;
                    }
                }
            }

            rounds -= 1;
            if rounds == 0 {
                self.reset();
                return Err(Error::CompressionStalled);
            }
        }

        let produced = (self.stream.total_out() - before_out) as usize;
        if produced < DEFLATE_TRAILER.len() {
            self.reset();
            return Err(Error::CompressionStalled);
        }

        if !self.context_takeover {
            self.stream.reset();
        }

        Ok(produced - DEFLATE_TRAILER.len())
    }

    /// Compress a whole message into a fresh vector; used when the
    /// compressed output has to be fragmented across several frames.
    pub fn compress_to_vec(&mut self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = vec![0u8; deflate_bound(input.len()).max(input.len()) + DEFLATE_TRAILER.len()];
        let written = self.compress_into(input, &mut out)?;
        out.truncate(written);
        Ok(out)
    }

    /// Drop all compression history, e.g. after a stream error.
    pub fn reset(&mut self) {
        self.stream.reset();
    }
}
