//! CAN-FD ISO-TP segmentation. Same state machine as the classical
//! engine with a dynamic, per-frame DLC instead of a fixed 8/7-byte
//! width. See `spec.md` §4.4.

use crate::bytes::pad_to;
use crate::error::{CoreError, CoreResult, Violation};
use crate::pdu::stmin_code_to_us;

use super::{AddressingMode, Behavior, EngineState, IsoTpAction, CTS, OVERFLOW, WAIT};

/// Maximum ISO-TP message length, same 12-bit length field as classical.
pub const MAX_MESSAGE_LEN: usize = 4095;

/// Admissible physical CAN-FD frame lengths.
const ADMISSIBLE: &[usize] = &[0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

fn smallest_admissible_at_least(n: usize) -> Option<usize> {
    ADMISSIBLE.iter().copied().find(|&x| x >= n)
}

/// A CAN-FD ISO-TP segmentation engine.
#[derive(Debug, Clone)]
pub struct IsoTpFdEngine {
    behavior: Behavior,
    extended: bool,
    /// Maximum usable (post-addressing-extension) frame width.
    max_effective: usize,
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

impl IsoTpFdEngine {
    /// Creates a new engine. `block_size` of `0` means "send/accept
    /// without flow control limits".
    pub fn new(
        behavior: Behavior,
        mode: AddressingMode,
        block_size: u8,
        rx_stmin_us: u32,
        tx_stmin_us: u32,
    ) -> Self {
        let extended = matches!(mode, AddressingMode::Extended);
        let max_effective = if extended { 63 } else { 64 };
        Self {
            behavior,
            extended,
            max_effective,
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

    fn physical_len(&self, effective_len: usize) -> usize {
        effective_len + if self.extended { 1 } else { 0 }
    }

    /// Rounds `effective_need` up to the smallest admissible physical
    /// length, then pads the frame to it. The address extension byte in
    /// extended addressing lives outside `frame` and is prepended by the
    /// caller, so `frame` itself is padded to `physical - 1` in that case.
    fn size_and_pad(&self, frame: &mut Vec<u8>, effective_need: usize) {
        let physical_need = self.physical_len(effective_need);
        let physical = smallest_admissible_at_least(physical_need).unwrap_or(physical_need);
        let frame_width = if self.extended { physical - 1 } else { physical };
        pad_to(frame, frame_width);
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

        if bytes.len() <= 7 {
            let mut frame = vec![bytes.len() as u8];
            frame.extend_from_slice(bytes);
            self.size_and_pad(&mut frame, 1 + bytes.len());
            return Ok(IsoTpAction::WriteFrames {
                separation_time_us: 0,
                frames: vec![frame],
            });
        }

        if bytes.len() <= self.max_effective.saturating_sub(2) {
            let mut frame = vec![0x00, bytes.len() as u8];
            frame.extend_from_slice(bytes);
            self.size_and_pad(&mut frame, 2 + bytes.len());
            return Ok(IsoTpAction::WriteFrames {
                separation_time_us: 0,
                frames: vec![frame],
            });
        }

        let len = bytes.len();
        let head_len = self.max_effective - 2;
        let mut frame = Vec::with_capacity(self.max_effective);
        frame.push(0x10 | ((len >> 8) as u8 & 0x0F));
        frame.push((len & 0xFF) as u8);
        frame.extend_from_slice(&bytes[..head_len]);
        self.size_and_pad(&mut frame, 2 + head_len);

        self.sending_payload = bytes[head_len..].to_vec();
        self.sending_seq = 1;
        self.state = EngineState::Sending;

        Ok(IsoTpAction::WriteFrames {
            separation_time_us: 0,
            frames: vec![frame],
        })
    }

    /// Feeds one inbound CAN-FD frame to the engine.
    pub fn did_receive_frame(&mut self, frame: &[u8]) -> IsoTpAction {
        if !ADMISSIBLE.contains(&frame.len()) {
            return self.handle_outcome(frame, IsoTpAction::Violation(Violation::InadmissibleFrameLength));
        }
        let outcome = self.dispatch(frame);
        self.handle_outcome(frame, outcome)
    }

    fn handle_outcome(&mut self, original_frame: &[u8], outcome: IsoTpAction) -> IsoTpAction {
        let violation = matches!(outcome, IsoTpAction::Violation(_));
        if !violation {
            return outcome;
        }
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
            CTS => self.drain_sending(frame.get(2).copied().unwrap_or(0)),
            WAIT => IsoTpAction::WaitForMore,
            OVERFLOW => IsoTpAction::Violation(Violation::Overflow),
            _ => IsoTpAction::Violation(Violation::UnexpectedFrame),
        }
    }

    fn drain_sending(&mut self, received_stmin_code: u8) -> IsoTpAction {
        let stmin = stmin_code_to_us(received_stmin_code).max(self.tx_stmin_us);
        let limit = if self.block_size == 0 {
            usize::MAX
        } else {
            self.block_size as usize
        };
        let max_chunk = self.max_effective.saturating_sub(1);

        let mut frames = Vec::new();
        let mut emitted = 0;
        while !self.sending_payload.is_empty() && emitted < limit {
            let take = max_chunk.min(self.sending_payload.len());
            let mut frame = Vec::with_capacity(take + 1);
            frame.push(0x20 | self.sending_seq);
            frame.extend(self.sending_payload.drain(0..take));
            self.size_and_pad(&mut frame, 1 + take);
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
        match frame[0] >> 4 {
            0x0 => self.decode_single(frame),
            0x1 => self.begin_receiving(frame),
            0x2 => IsoTpAction::Violation(Violation::UnexpectedFrame),
            _ => IsoTpAction::Violation(Violation::UnexpectedFrame),
        }
    }

    fn decode_single(&self, frame: &[u8]) -> IsoTpAction {
        let low = frame[0] & 0x0F;
        if low == 0 {
            let Some(&len) = frame.get(1) else {
                return IsoTpAction::Violation(Violation::BadLength);
            };
            let len = len as usize;
            if len == 0 || 2 + len > frame.len() {
                return IsoTpAction::Violation(Violation::BadLength);
            }
            IsoTpAction::Process(frame[2..2 + len].to_vec())
        } else {
            let len = low as usize;
            if 1 + len > frame.len() {
                return IsoTpAction::Violation(Violation::BadLength);
            }
            IsoTpAction::Process(frame[1..1 + len].to_vec())
        }
    }

    fn begin_receiving(&mut self, frame: &[u8]) -> IsoTpAction {
        if frame.len() < 3 {
            return IsoTpAction::Violation(Violation::BadLength);
        }
        let len = (((frame[0] & 0x0F) as usize) << 8) | frame[1] as usize;
        let head_len = frame.len() - 2;
        if len <= head_len || len > MAX_MESSAGE_LEN {
            return IsoTpAction::Violation(Violation::BadLength);
        }
        self.receiving_payload = frame[2..].to_vec();
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
        self.size_and_pad(&mut frame, 3);
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
        let take = (frame.len() - 1).min(self.receiving_pending_bytes);
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
