use crate::buffer::IoBuffer;
use crate::config::{
    IN_BUFFER_INITIAL_SIZE, IN_BUFFER_MAX_SIZE, MAX_INCOMING_FRAME_SIZE, RECEIVE_CHUNK_SIZE,
};
use crate::error::Error;
use crate::frame::{parse_frame_header, unmask, Frame};

/// The inbound half of a connection: a capped staging buffer the socket is
/// read into, plus the incremental frame extractor on top of it.
///
/// `next_frame_size` remembers the total size of a frame whose header has
/// been decoded but whose payload has not fully arrived. It sizes the next
/// socket read so a large frame is pulled in with few syscalls instead of
/// 4 KiB at a time.
pub(crate) struct FrameReader {
    in_buffer: IoBuffer,
    next_frame_size: usize,
    compression_enabled: bool,
}

impl FrameReader {
    pub fn new(compression_enabled: bool) -> Self {
        Self {
            in_buffer: IoBuffer::new(IN_BUFFER_INITIAL_SIZE, IN_BUFFER_MAX_SIZE),
            next_frame_size: 0,
            compression_enabled,
        }
    }

    /// How many bytes the next socket read should ask for.
    pub fn read_hint(&self) -> usize {
        let used = self.in_buffer.used();
        if self.next_frame_size > used {
            (self.next_frame_size - used).max(RECEIVE_CHUNK_SIZE)
        } else {
            RECEIVE_CHUNK_SIZE
        }
    }

    /// Reserve space for a socket read. The returned slice is committed
    /// with [`FrameReader::commit`] once the read completed.
    pub fn space(&mut self, n: usize) -> Result<&mut [u8], Error> {
        self.in_buffer.reserve(n)
    }

    pub fn commit(&mut self, written: usize) {
        self.in_buffer.commit(written);
    }

    #[cfg(test)]
    pub fn feed(&mut self, data: &[u8]) -> Result<(), Error> {
        let space = self.in_buffer.reserve(data.len())?;
        space.copy_from_slice(data);
        self.in_buffer.commit(data.len());
        Ok(())
    }

    /// Extract the next complete frame from the buffered bytes.
    ///
    /// Returns `Ok(None)` when more data is needed. Structural violations
    /// (reserved bits, oversized frames, fragmented control frames,
    /// unknown opcodes) surface as errors; the stateful fragmentation rules
    /// live in the message assembler.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        let header = match parse_frame_header(self.in_buffer.as_slice())? {
            Some(header) => header,
            None => return Ok(None),
        };

        if header.rsv2 || header.rsv3 {
            return Err(Error::ReservedBitsSet);
        }
        if header.rsv1 && !self.compression_enabled {
            return Err(Error::CompressionNotNegotiated);
        }
        if header.opcode.is_control() {
            if !header.fin {
                return Err(Error::ControlFramesFragmented);
            }
            if header.payload_length > 125 {
                return Err(Error::ControlFramePayloadSize);
            }
        }
        if header.frame_size > MAX_INCOMING_FRAME_SIZE {
            return Err(Error::MaxFrameSize(header.frame_size));
        }

        if self.in_buffer.used() < header.frame_size {
            // remember how much the next read has to deliver
            self.next_frame_size = header.frame_size;
            return Ok(None);
        }
        self.next_frame_size = 0;

        let data = self.in_buffer.as_slice();
        let mut payload = data[header.header_size..header.frame_size].to_vec();
        if header.masked {
            unmask(&mut payload, header.mask_key);
        }
        self.in_buffer.consume(header.frame_size);

        Ok(Some(Frame {
            final_fragment: header.fin,
            opcode: header.opcode,
            payload,
            compressed: header.rsv1,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OpCode;

    fn masked_frame(first_byte: u8, payload: &[u8]) -> Vec<u8> {
        let mask = [0x01u8, 0x02, 0x03, 0x04];
        let mut frame = vec![first_byte, 0x80 | payload.len() as u8];
        frame.extend_from_slice(&mask);
        for (i, byte) in payload.iter().enumerate() {
            frame.push(byte ^ mask[i % 4]);
        }
        frame
    }

    #[test]
    fn test_extracts_single_text_frame() {
        let mut reader = FrameReader::new(false);
        reader.feed(&masked_frame(0x81, b"hi")).unwrap();

        let frame = reader.next_frame().unwrap().unwrap();
        assert!(frame.final_fragment);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload, b"hi");
        assert!(!frame.compressed);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut reader = FrameReader::new(false);
        let wire = masked_frame(0x82, b"split across reads");

        for chunk in wire.chunks(3) {
            if let Some(frame) = reader.next_frame().unwrap() {
                panic!("frame surfaced early: {:?}", frame.opcode);
            }
            reader.feed(chunk).unwrap();
        }

        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(frame.payload, b"split across reads");
    }

    #[test]
    fn test_read_hint_targets_known_frame() {
        let mut reader = FrameReader::new(false);
        assert_eq!(reader.read_hint(), RECEIVE_CHUNK_SIZE);

        // header of a 70000-byte masked binary frame
        let mut wire = vec![0x82, 0x80 | 126];
        // 7-bit length field 126 needs the 16-bit form; use 127/64-bit for 70000
        wire[1] = 0x80 | 127;
        wire.extend_from_slice(&70000u64.to_be_bytes());
        wire.extend_from_slice(&[0, 0, 0, 0]);
        reader.feed(&wire).unwrap();

        assert!(reader.next_frame().unwrap().is_none());
        let frame_size = 2 + 8 + 4 + 70000;
        assert_eq!(reader.read_hint(), frame_size - wire.len());
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut reader = FrameReader::new(false);
        let mut wire = masked_frame(0x01, b"foo");
        wire.extend_from_slice(&masked_frame(0x89, b"x"));
        wire.extend_from_slice(&masked_frame(0x80, b"bar"));
        reader.feed(&wire).unwrap();

        let first = reader.next_frame().unwrap().unwrap();
        assert_eq!(first.opcode, OpCode::Text);
        assert!(!first.final_fragment);

        let ping = reader.next_frame().unwrap().unwrap();
        assert_eq!(ping.opcode, OpCode::Ping);
        assert_eq!(ping.payload, b"x");

        let last = reader.next_frame().unwrap().unwrap();
        assert_eq!(last.opcode, OpCode::Continue);
        assert!(last.final_fragment);
        assert_eq!(last.payload, b"bar");
    }

    #[test]
    fn test_rsv_bits_rejected() {
        let mut reader = FrameReader::new(false);
        reader.feed(&masked_frame(0xA1, b"x")).unwrap(); // RSV2
        assert!(matches!(reader.next_frame(), Err(Error::ReservedBitsSet)));

        let mut reader = FrameReader::new(false);
        reader.feed(&masked_frame(0xC1, b"x")).unwrap(); // RSV1, no compression
        assert!(matches!(
            reader.next_frame(),
            Err(Error::CompressionNotNegotiated)
        ));

        // with compression negotiated RSV1 is legal
        let mut reader = FrameReader::new(true);
        reader.feed(&masked_frame(0xC1, b"x")).unwrap();
        assert!(reader.next_frame().unwrap().unwrap().compressed);
    }

    #[test]
    fn test_control_frame_rules() {
        // fragmented ping
        let mut reader = FrameReader::new(false);
        reader.feed(&masked_frame(0x09, b"x")).unwrap();
        assert!(matches!(
            reader.next_frame(),
            Err(Error::ControlFramesFragmented)
        ));

        // 126-byte close payload
        let mut reader = FrameReader::new(false);
        let mask = [0u8; 4];
        let mut wire = vec![0x88, 0x80 | 126, 0x00, 126];
        wire.extend_from_slice(&mask);
        wire.extend_from_slice(&[0u8; 126]);
        reader.feed(&wire).unwrap();
        assert!(matches!(
            reader.next_frame(),
            Err(Error::ControlFramePayloadSize)
        ));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut reader = FrameReader::new(false);
        reader.feed(&masked_frame(0x83, b"x")).unwrap();
        assert!(matches!(reader.next_frame(), Err(Error::InvalidOpcode(0x3))));
    }
}
