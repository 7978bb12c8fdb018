use crate::config::{MAX_DECOMPRESSED_SIZE, PAYLOAD_INITIAL_SIZE};
use crate::error::Error;
use crate::frame::{Frame, OpCode};

/// Outcome of feeding one data frame to the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AssemblyStep {
    /// The frame was appended; the message continues in later frames.
    Incomplete,
    /// The FIN frame arrived; the assembled payload is ready to process.
    Ready,
}

/// Reassembles fragmented messages and enforces the RFC 6455 fragmentation
/// rules.
///
/// `message_complete` is false exactly while a non-final data frame has
/// been received and no final frame has closed the sequence. In that window
/// the only admissible data opcode is CONTINUATION; a new TEXT or BINARY
/// frame is a protocol error, as is a CONTINUATION outside of it.
pub(crate) struct MessageAssembler {
    payload: Vec<u8>,
    opcode: OpCode,
    is_compressed: bool,
    message_complete: bool,
    message_id: u64,
    frame_id: u64,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self {
            payload: Vec::with_capacity(PAYLOAD_INITIAL_SIZE),
            opcode: OpCode::Text,
            is_compressed: false,
            message_complete: true,
            message_id: 0,
            frame_id: 0,
        }
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    #[cfg(test)]
    pub fn message_in_progress(&self) -> bool {
        !self.message_complete
    }

    /// Feed one validated data frame (TEXT, BINARY or CONTINUATION).
    pub fn accept(&mut self, frame: &Frame) -> Result<AssemblyStep, Error> {
        match frame.opcode {
            OpCode::Continue => {
                if self.message_complete {
                    return Err(Error::InvalidContinuationFrame);
                }
                // RFC 7692: RSV1 may only appear on the first frame
                if frame.compressed {
                    return Err(Error::RsvOnContinuation);
                }
            }
            OpCode::Text | OpCode::Binary => {
                if !self.message_complete {
                    return Err(Error::FragmentedInProgress);
                }
                self.payload.clear();
                self.opcode = frame.opcode;
                self.is_compressed = frame.compressed;
                self.frame_id = 0;
            }
            _ => return Err(Error::InvalidOpcode(frame.opcode.as_u8())),
        }

        if self.payload.len() + frame.payload.len() > MAX_DECOMPRESSED_SIZE {
            return Err(Error::MaxMessageSize(
                self.payload.len() + frame.payload.len(),
            ));
        }
        self.payload.extend_from_slice(&frame.payload);

        self.frame_id += 1;
        self.message_complete = frame.final_fragment;

        if frame.final_fragment {
            Ok(AssemblyStep::Ready)
        } else {
            Ok(AssemblyStep::Incomplete)
        }
    }

    /// Hand out the assembled payload once `accept` returned `Ready`.
    pub fn take_payload(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.payload)
    }

    /// Account for a delivered message and reset for the next one.
    pub fn finish_message(&mut self) {
        self.payload.clear();
        self.payload.shrink_to(PAYLOAD_INITIAL_SIZE);
        self.message_complete = true;
        self.is_compressed = false;
        self.opcode = OpCode::Text;
        self.frame_id = 0;
        self.message_id += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_frame(fin: bool, opcode: OpCode, payload: &[u8]) -> Frame {
        Frame::new(fin, opcode, payload.to_vec(), false)
    }

    #[test]
    fn test_single_frame_message() {
        let mut assembler = MessageAssembler::new();
        let step = assembler
            .accept(&data_frame(true, OpCode::Text, b"hi"))
            .unwrap();
        assert_eq!(step, AssemblyStep::Ready);
        assert_eq!(assembler.take_payload(), b"hi");
        assembler.finish_message();
        assert_eq!(assembler.message_id(), 1);
    }

    #[test]
    fn test_fragmented_message() {
        let mut assembler = MessageAssembler::new();
        assert_eq!(
            assembler
                .accept(&data_frame(false, OpCode::Text, b"He"))
                .unwrap(),
            AssemblyStep::Incomplete
        );
        assert!(assembler.message_in_progress());
        assert_eq!(
            assembler
                .accept(&data_frame(false, OpCode::Continue, b"ll"))
                .unwrap(),
            AssemblyStep::Incomplete
        );
        assert_eq!(
            assembler
                .accept(&data_frame(true, OpCode::Continue, b"o"))
                .unwrap(),
            AssemblyStep::Ready
        );
        assert_eq!(assembler.opcode(), OpCode::Text);
        assert_eq!(assembler.take_payload(), b"Hello");
    }

    #[test]
    fn test_new_data_frame_during_fragmented_message() {
        let mut assembler = MessageAssembler::new();
        assembler
            .accept(&data_frame(false, OpCode::Binary, b"part"))
            .unwrap();
        assert!(matches!(
            assembler.accept(&data_frame(true, OpCode::Text, b"nope")),
            Err(Error::FragmentedInProgress)
        ));
    }

    #[test]
    fn test_continuation_without_initial_frame() {
        let mut assembler = MessageAssembler::new();
        assert!(matches!(
            assembler.accept(&data_frame(true, OpCode::Continue, b"x")),
            Err(Error::InvalidContinuationFrame)
        ));
    }

    #[test]
    fn test_rsv1_on_continuation() {
        let mut assembler = MessageAssembler::new();
        assembler
            .accept(&data_frame(false, OpCode::Text, b"a"))
            .unwrap();
        let frame = Frame::new(true, OpCode::Continue, b"b".to_vec(), true);
        assert!(matches!(
            assembler.accept(&frame),
            Err(Error::RsvOnContinuation)
        ));
    }

    #[test]
    fn test_compressed_flag_taken_from_first_frame() {
        let mut assembler = MessageAssembler::new();
        let first = Frame::new(false, OpCode::Binary, b"a".to_vec(), true);
        assembler.accept(&first).unwrap();
        assembler
            .accept(&data_frame(true, OpCode::Continue, b"b"))
            .unwrap();
        assert!(assembler.is_compressed());
        assert_eq!(assembler.opcode(), OpCode::Binary);
    }

    #[test]
    fn test_zero_length_final_continuation() {
        let mut assembler = MessageAssembler::new();
        assembler
            .accept(&data_frame(false, OpCode::Text, b"x"))
            .unwrap();
        assert_eq!(
            assembler
                .accept(&data_frame(true, OpCode::Continue, b""))
                .unwrap(),
            AssemblyStep::Ready
        );
        assert_eq!(assembler.take_payload(), b"x");
    }
}
