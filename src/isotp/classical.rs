//! Classical ISO-TP (ISO 15765-2) segmentation over 8-byte (or 7-byte,
//! extended addressing) CAN frames. See `spec.md` §4.3.

use crate::bytes::pad_to;
use crate::error::{CoreError, CoreResult, Violation};
use crate::pdu::stmin_code_to_us;

use super::{AddressingMode, Behavior, EngineState, IsoTpAction, CTS, OVERFLOW, WAIT};

/// Maximum ISO-TP message length (12-bit length field).
pub const MAX_MESSAGE_LEN: usize = 4095;

/// A classical ISO-TP segmentation engine. One instance per channel.
#[derive(Debug, Clone)]
pub struct IsoTpClassicalEngine {
    behavior: Behavior,
    width: usize,
    block_size: u8,
    rx_stmin_us: u32,
    tx_stmin_us: u32,
    state: EngineState,

    sending_payload: Vec<u8>,
    sending_seq: u8,

    receiving_payload: Vec<u8>,
    receiving_seq: u8,
    receiving_pending_bytes: usize,
    receiving_unconfirmed_frames: u32,
}

impl IsoTpClassicalEngine {
    /// Creates a new engine. `block_size` of `0` means "send/accept
    /// without flow control limits".
    pub fn new(
        behavior: Behavior,
        mode: AddressingMode,
        block_size: u8,
        rx_stmin_us: u32,
        tx_stmin_us: u32,
    ) -> Self {
        let width = match mode {
            AddressingMode::Standard => 8,
            AddressingMode::Extended => 7,
        };
        Self {
            behavior,
            width,
            block_size,
            rx_stmin_us,
            tx_stmin_us,
            state: EngineState::Idle,
            sending_payload: Vec::new(),
            sending_seq: 0,
            receiving_payload: Vec::new(),
            receiving_seq: 0,
            receiving_pending_bytes: 0,
            receiving_unconfirmed_frames: 0,
        }
    }

    /// Resets the engine to `idle`, discarding any in-flight transfer.
    pub fn reset(&mut self) {
        self.state = EngineState::Idle;
        self.sending_payload.clear();
        self.sending_seq = 0;
        self.receiving_payload.clear();
        self.receiving_seq = 0;
        self.receiving_pending_bytes = 0;
        self.receiving_unconfirmed_frames = 0;
    }

    fn is_idle(&self) -> bool {
        matches!(self.state, EngineState::Idle)
    }

    /// Begins transmission of `bytes`. Fails if the engine isn't idle or
    /// `bytes` exceeds [`MAX_MESSAGE_LEN`].
    pub fn write_pdu(&mut self, bytes: &[u8]) -> CoreResult<IsoTpAction> {
        if !self.is_idle() {
            return Err(CoreError::State("write_pdu called while not idle"));
        }
        if bytes.len() > MAX_MESSAGE_LEN {
            return Err(CoreError::LimitExceeded);
        }

        if bytes.len() < self.width {
            let mut frame = Vec::with_capacity(self.width);
            frame.push(bytes.len() as u8);
            frame.extend_from_slice(bytes);
            pad_to(&mut frame, self.width);
            return Ok(IsoTpAction::WriteFrames {
                separation_time_us: 0,
                frames: vec![frame],
            });
        }

        let len = bytes.len();
        let head_len = self.width - 2;
        let mut frame = Vec::with_capacity(self.width);
        frame.push(0x10 | ((len >> 8) as u8 & 0x0F));
        frame.push((len & 0xFF) as u8);
        frame.extend_from_slice(&bytes[..head_len]);

        self.sending_payload = bytes[head_len..].to_vec();
        self.sending_seq = 1;
        self.state = EngineState::Sending;

        Ok(IsoTpAction::WriteFrames {
            separation_time_us: 0,
            frames: vec![frame],
        })
    }

    /// Feeds one inbound CAN frame to the engine.
    pub fn did_receive_frame(&mut self, frame: &[u8]) -> IsoTpAction {
        if !self.acceptable_width(frame) {
            return self.handle_outcome(frame, IsoTpAction::Violation(Violation::InadmissibleFrameLength));
        }
        let outcome = self.dispatch(frame);
        self.handle_outcome(frame, outcome)
    }

    fn acceptable_width(&self, frame: &[u8]) -> bool {
        frame.len() == self.width || (frame.len() == 3 && (0x30..=0x32).contains(&frame[0]))
    }

    fn handle_outcome(&mut self, original_frame: &[u8], outcome: IsoTpAction) -> IsoTpAction {
        let violation = match &outcome {
            IsoTpAction::Violation(v) => Some(*v),
            _ => None,
        };
        let Some(_v) = violation else { return outcome };
        match self.behavior {
            Behavior::Strict => outcome,
            Behavior::Defensive => {
                self.reset();
                match self.dispatch_idle(original_frame) {
                    IsoTpAction::Violation(_) => IsoTpAction::WaitForMore,
                    other => other,
                }
            }
        }
    }

    fn dispatch(&mut self, frame: &[u8]) -> IsoTpAction {
        match self.state {
            EngineState::Sending => self.dispatch_flow_control(frame),
            EngineState::Idle => self.dispatch_idle(frame),
            EngineState::Receiving => self.dispatch_receiving(frame),
        }
    }

    fn dispatch_flow_control(&mut self, frame: &[u8]) -> IsoTpAction {
        if frame[0] & 0xF0 != 0x30 {
            return IsoTpAction::Violation(Violation::UnexpectedFrame);
        }
        match frame[0] {
            CTS => self.drain_sending(frame.get(1).copied().unwrap_or(0), frame.get(2).copied().unwrap_or(0)),
            WAIT => IsoTpAction::WaitForMore,
            OVERFLOW => IsoTpAction::Violation(Violation::Overflow),
            _ => IsoTpAction::Violation(Violation::UnexpectedFrame),
        }
    }

    fn drain_sending(&mut self, received_block_size_hint: u8, received_stmin_code: u8) -> IsoTpAction {
        // The peer's FC frame carries its own block-size/STmin preference
        // for this burst; we only use the STmin half (our own block_size
        // governs how many frames *we* send before expecting another FC,
        // per spec: "effective stMin... max(receivedStMin, configuredTxStMin)").
        let _ = received_block_size_hint;
        let received_stmin_us = stmin_code_to_us(received_stmin_code);
        let stmin = received_stmin_us.max(self.tx_stmin_us);

        let limit = if self.block_size == 0 {
            usize::MAX
        } else {
            self.block_size as usize
        };

        let mut frames = Vec::new();
        let mut emitted = 0;
        while !self.sending_payload.is_empty() && emitted < limit {
            let take = (self.width - 1).min(self.sending_payload.len());
            let mut frame = Vec::with_capacity(self.width);
            frame.push(0x20 | self.sending_seq);
            frame.extend(self.sending_payload.drain(0..take));
            pad_to(&mut frame, self.width);
            frames.push(frame);
            self.sending_seq = (self.sending_seq + 1) % 16;
            emitted += 1;
        }

        if self.sending_payload.is_empty() {
            self.reset();
        }

        IsoTpAction::WriteFrames {
            separation_time_us: stmin,
            frames,
        }
    }

    fn dispatch_idle(&mut self, frame: &[u8]) -> IsoTpAction {
        let pci_type = frame[0] >> 4;
        match pci_type {
            0x0 => self.decode_single(frame),
            0x1 => self.begin_receiving(frame),
            0x2 => IsoTpAction::Violation(Violation::UnexpectedFrame),
            _ => IsoTpAction::Violation(Violation::UnexpectedFrame),
        }
    }

    fn decode_single(&self, frame: &[u8]) -> IsoTpAction {
        let len = (frame[0] & 0x0F) as usize;
        if len == 0 || len > self.width - 1 || 1 + len > frame.len() {
            return IsoTpAction::Violation(Violation::BadLength);
        }
        IsoTpAction::Process(frame[1..1 + len].to_vec())
    }

    fn begin_receiving(&mut self, frame: &[u8]) -> IsoTpAction {
        let len = (((frame[0] & 0x0F) as usize) << 8) | frame[1] as usize;
        let head_len = self.width - 2;
        // A conformant sender only emits FIRST for len >= width; anything
        // shorter is a SINGLE frame per `write_pdu`'s own cutoff.
        if len < self.width || len > MAX_MESSAGE_LEN {
            return IsoTpAction::Violation(Violation::BadLength);
        }
        self.receiving_payload = frame[2..self.width].to_vec();
        self.receiving_pending_bytes = len - head_len;
        self.receiving_seq = 1;
        self.rearm_flow_control();
        self.state = EngineState::Receiving;
        IsoTpAction::WriteFrames {
            separation_time_us: 0,
            frames: vec![self.make_cts_frame()],
        }
    }

    fn rearm_flow_control(&mut self) {
        self.receiving_unconfirmed_frames = if self.block_size == 0 {
            u32::MAX
        } else {
            self.block_size as u32
        };
    }

    fn make_cts_frame(&self) -> Vec<u8> {
        let rx_code = crate::pdu::us_to_stmin_code(self.rx_stmin_us).unwrap_or(0);
        let mut frame = vec![CTS, self.block_size, rx_code];
        pad_to(&mut frame, self.width);
        frame
    }

    fn dispatch_receiving(&mut self, frame: &[u8]) -> IsoTpAction {
        if frame[0] >> 4 != 0x2 {
            return IsoTpAction::Violation(Violation::UnexpectedFrame);
        }
        let seq = frame[0] & 0x0F;
        if seq != self.receiving_seq {
            return IsoTpAction::Violation(Violation::SequenceMismatch);
        }
        let take = (self.width - 1).min(self.receiving_pending_bytes);
        self.receiving_payload.extend_from_slice(&frame[1..1 + take]);
        self.receiving_pending_bytes -= take;
        self.receiving_seq = (self.receiving_seq + 1) % 16;

        if self.receiving_pending_bytes == 0 {
            let payload = std::mem::take(&mut self.receiving_payload);
            self.reset();
            return IsoTpAction::Process(payload);
        }

        if self.receiving_unconfirmed_frames != u32::MAX {
            self.receiving_unconfirmed_frames -= 1;
            if self.receiving_unconfirmed_frames == 0 {
                self.rearm_flow_control();
                return IsoTpAction::WriteFrames {
                    separation_time_us: 0,
                    frames: vec![self.make_cts_frame()],
                };
            }
        }

        IsoTpAction::WaitForMore
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(behavior: Behavior) -> IsoTpClassicalEngine {
        IsoTpClassicalEngine::new(behavior, AddressingMode::Standard, 0, 0, 0)
    }

    #[test]
    fn e5_single_frame_and_first_consecutive() {
        let mut tx = engine(Behavior::Strict);
        let action = tx.write_pdu(&[0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38]).unwrap();
        match action {
            IsoTpAction::WriteFrames { frames, .. } => {
                assert_eq!(frames, vec![vec![0x10, 0x08, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36]]);
            }
            other => panic!("{other:?}"),
        }
        let action = tx.did_receive_frame(&[0x30, 0x00, 0x00, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA]);
        match action {
            IsoTpAction::WriteFrames { frames, .. } => {
                assert_eq!(frames, vec![vec![0x21, 0x37, 0x38, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA]]);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn single_frame_roundtrip() {
        let mut tx = engine(Behavior::Strict);
        let action = tx.write_pdu(&[1, 2, 3]).unwrap();
        let frame = match action {
            IsoTpAction::WriteFrames { frames, .. } => frames.into_iter().next().unwrap(),
            other => panic!("{other:?}"),
        };
        let mut rx = engine(Behavior::Strict);
        match rx.did_receive_frame(&frame) {
            IsoTpAction::Process(payload) => assert_eq!(payload, vec![1, 2, 3]),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn full_range_of_lengths_roundtrip() {
        for len in 1..=MAX_MESSAGE_LEN {
            let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let block_size = 8u8;
            let mut tx = IsoTpClassicalEngine::new(Behavior::Strict, AddressingMode::Standard, block_size, 0, 0);
            let mut rx = IsoTpClassicalEngine::new(Behavior::Strict, AddressingMode::Standard, block_size, 0, 0);

            let mut pending_frames: Vec<Vec<u8>> = match tx.write_pdu(&payload).unwrap() {
                IsoTpAction::WriteFrames { frames, .. } => frames,
                other => panic!("{other:?}"),
            };

            let mut reassembled: Option<Vec<u8>> = None;
            let mut guard = 0;
            while !pending_frames.is_empty() {
                guard += 1;
                assert!(guard < 10_000, "loop did not converge for len={len}");
                let frame = pending_frames.remove(0);
                match rx.did_receive_frame(&frame) {
                    IsoTpAction::WriteFrames { frames, .. } => {
                        // rx -> tx flow control (CTS) or tx -> rx consecutive
                        // frames; route by whichever engine is not idle.
                        for fc in frames {
                            match tx.did_receive_frame(&fc) {
                                IsoTpAction::WriteFrames { frames: more, .. } => {
                                    pending_frames.extend(more);
                                }
                                IsoTpAction::WaitForMore => {}
                                other => panic!("{other:?}"),
                            }
                        }
                    }
                    IsoTpAction::Process(data) => {
                        reassembled = Some(data);
                    }
                    other => panic!("{other:?}"),
                }
            }

            if len < 8 {
                // SINGLE frame: rx never needed to talk back.
                assert!(reassembled.is_some() || len < 8);
            }
            assert_eq!(reassembled, Some(payload), "mismatch at len={len}");
        }
    }

    #[test]
    fn sequence_wraps_at_16_for_max_message() {
        let payload: Vec<u8> = (0..MAX_MESSAGE_LEN).map(|i| (i % 256) as u8).collect();
        let mut tx = IsoTpClassicalEngine::new(Behavior::Strict, AddressingMode::Standard, 0, 0, 0);
        let frames = match tx.write_pdu(&payload).unwrap() {
            IsoTpAction::WriteFrames { frames, .. } => frames,
            other => panic!("{other:?}"),
        };
        assert_eq!(frames[0][0], 0x1F); // FIRST PCI high nibble
        let cts = vec![0x30, 0x00, 0x00, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA];
        let consecutive = match tx.did_receive_frame(&cts) {
            IsoTpAction::WriteFrames { frames, .. } => frames,
            other => panic!("{other:?}"),
        };
        let seqs: Vec<u8> = consecutive.iter().map(|f| f[0] & 0x0F).collect();
        let mut expected = Vec::new();
        let mut s = 1u8;
        for _ in 0..consecutive.len() {
            expected.push(s);
            s = (s + 1) % 16;
        }
        assert_eq!(seqs, expected);
    }

    #[test]
    fn invalid_single_length_zero_is_violation() {
        let mut rx = engine(Behavior::Strict);
        let frame = [0x00, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA];
        assert_eq!(
            rx.did_receive_frame(&frame),
            IsoTpAction::Violation(Violation::BadLength)
        );
    }

    #[test]
    fn invalid_single_length_too_long_is_violation() {
        let mut rx = engine(Behavior::Strict);
        // length nibble 0xF == 15, exceeds width-1 == 7
        let frame = [0x0F, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA];
        assert_eq!(
            rx.did_receive_frame(&frame),
            IsoTpAction::Violation(Violation::BadLength)
        );
    }

    #[test]
    fn first_frame_shorter_than_width_is_a_violation() {
        let mut rx = engine(Behavior::Strict);
        // len=7 fits in a SINGLE frame (width=8); a conformant sender
        // never emits FIRST for it, so this must be rejected, not decoded.
        let frame = [0x10, 0x07, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA];
        assert_eq!(
            rx.did_receive_frame(&frame),
            IsoTpAction::Violation(Violation::BadLength)
        );
    }

    #[test]
    fn defensive_mode_recovers_unexpected_single_while_sending() {
        let mut tx = engine(Behavior::Defensive);
        tx.write_pdu(&[0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38]).unwrap();
        // A SINGLE frame arrives instead of flow control.
        let single = [0x03, 0x01, 0x02, 0x03, 0xAA, 0xAA, 0xAA, 0xAA];
        match tx.did_receive_frame(&single) {
            IsoTpAction::Process(payload) => assert_eq!(payload, vec![0x01, 0x02, 0x03]),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn defensive_mode_swallows_unparseable_frame() {
        let mut tx = engine(Behavior::Defensive);
        tx.write_pdu(&[0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38]).unwrap();
        let garbage = [0x09, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA];
        assert_eq!(tx.did_receive_frame(&garbage), IsoTpAction::WaitForMore);
    }

    #[test]
    fn strict_mode_surfaces_violation() {
        let mut rx = engine(Behavior::Strict);
        let consecutive_while_idle = [0x21, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA];
        assert_eq!(
            rx.did_receive_frame(&consecutive_while_idle),
            IsoTpAction::Violation(Violation::UnexpectedFrame)
        );
    }

    #[test]
    fn unpadded_flow_control_exception_is_accepted() {
        let mut tx = engine(Behavior::Strict);
        tx.write_pdu(&[0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38]).unwrap();
        let unpadded_cts = [0x30, 0x00, 0x00];
        match tx.did_receive_frame(&unpadded_cts) {
            IsoTpAction::WriteFrames { frames, .. } => assert!(!frames.is_empty()),
            other => panic!("{other:?}"),
        }
    }
}
