//! K-Line framing and reassembly: ISO 14230 (KWP2000) and ISO 9141-2,
//! sharing one per-frame checksum/address validator. See `spec.md` §4.5.
//!
//! Unlike the ISO-TP engines this one is receive-only: building and
//! sending a KWP/ISO-9141 request is a transport-level concern (baud
//! rate, init sequence, half-duplex echo) outside this engine's scope.

use crate::error::{CoreError, CoreResult, Violation};

/// Which header/length convention a frame follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KLineMode {
    /// ISO 14230 (KWP2000): `format, target, source, payload..., checksum`,
    /// payload length is the low nibble of `format`.
    Kwp,
    /// ISO 9141-2: `target, source, tester, payload..., checksum`, payload
    /// length is implicit (frame length minus the 3-byte header and the
    /// 1-byte checksum).
    Iso9141,
}

/// What [`KLineEngine::feed`] wants the caller to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KLineAction {
    /// More frames are needed before a complete message is available.
    WaitForMore,
    /// A complete message was reassembled (or `expectedLen` was reached).
    Process(Vec<u8>),
}

/// A K-Line frame validator and KWP multi-frame reassembler.
#[derive(Debug, Clone)]
pub struct KLineEngine {
    mode: KLineMode,
    expected_target: Option<u8>,
    expected_source: Option<u8>,
    expected_len: usize,

    buffer: Vec<u8>,
    base_service: Option<u8>,
    base_pid: Option<u8>,
    first_frame_had_potential_seq: bool,
    sequence_mode: bool,
    expected_seq: u8,
}

struct ParsedFrame<'a> {
    payload: &'a [u8],
}

impl KLineEngine {
    /// `expected_len` of `0` disables eager completion; the caller must
    /// call [`Self::finalize`] to emit the accumulated buffer.
    pub fn new(
        mode: KLineMode,
        expected_target: Option<u8>,
        expected_source: Option<u8>,
        expected_len: usize,
    ) -> Self {
        Self {
            mode,
            expected_target,
            expected_source,
            expected_len,
            buffer: Vec::new(),
            base_service: None,
            base_pid: None,
            first_frame_had_potential_seq: false,
            sequence_mode: false,
            expected_seq: 0,
        }
    }

    /// Clears accumulated reassembly state, keeping the configured mode
    /// and address/length expectations.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.base_service = None;
        self.base_pid = None;
        self.first_frame_had_potential_seq = false;
        self.sequence_mode = false;
        self.expected_seq = 0;
    }

    /// Emits whatever has been accumulated so far and resets the
    /// reassembly state.
    pub fn finalize(&mut self) -> Vec<u8> {
        let out = std::mem::take(&mut self.buffer);
        self.reset();
        out
    }

    fn parse_frame<'a>(&self, frame: &'a [u8]) -> CoreResult<ParsedFrame<'a>> {
        if frame.len() < 4 {
            return Err(CoreError::ProtocolViolation(Violation::BadLength));
        }
        let (target, source, header_len, declared_len) = match self.mode {
            KLineMode::Kwp => {
                let format = frame[0];
                (frame[1], frame[2], 3, (format & 0x0F) as usize)
            }
            KLineMode::Iso9141 => (frame[0], frame[1], 3, frame.len() - 3 - 1),
        };

        if frame.len() != header_len + declared_len + 1 {
            return Err(CoreError::ProtocolViolation(Violation::BadLength));
        }

        let checksum_index = frame.len() - 1;
        let computed = frame[..checksum_index]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b));
        if computed != frame[checksum_index] {
            return Err(CoreError::ProtocolViolation(Violation::ChecksumMismatch));
        }

        if let Some(expected) = self.expected_target {
            if target != expected {
                return Err(CoreError::ProtocolViolation(Violation::AddressMismatch));
            }
        }
        if let Some(expected) = self.expected_source {
            if source != expected {
                return Err(CoreError::ProtocolViolation(Violation::AddressMismatch));
            }
        }

        Ok(ParsedFrame {
            payload: &frame[header_len..checksum_index],
        })
    }

    /// Validates one frame and, in KWP mode, folds it into the in-flight
    /// reassembly buffer.
    pub fn feed(&mut self, frame: &[u8]) -> CoreResult<KLineAction> {
        let parsed = self.parse_frame(frame)?;

        match self.mode {
            KLineMode::Iso9141 => self.buffer.extend_from_slice(parsed.payload),
            KLineMode::Kwp => self.fold_kwp_payload(parsed.payload)?,
        }

        if self.expected_len > 0 && self.buffer.len() >= self.expected_len {
            return Ok(KLineAction::Process(self.finalize()));
        }
        Ok(KLineAction::WaitForMore)
    }

    fn fold_kwp_payload(&mut self, payload: &[u8]) -> CoreResult<()> {
        if self.base_service.is_none() {
            if payload.len() < 3 {
                self.buffer.extend_from_slice(payload);
                return Ok(());
            }
            self.base_service = Some(payload[0]);
            self.base_pid = Some(payload[1]);
            self.first_frame_had_potential_seq = payload[2] == 0x01;
            self.buffer.extend_from_slice(&payload[2..]);
            return Ok(());
        }

        if payload.len() < 2
            || Some(payload[0]) != self.base_service
            || Some(payload[1]) != self.base_pid
        {
            return Err(CoreError::ProtocolViolation(Violation::UnexpectedFrame));
        }

        if self.sequence_mode {
            let Some(&seq) = payload.get(2) else {
                return Err(CoreError::ProtocolViolation(Violation::SequenceMismatch));
            };
            if seq != self.expected_seq {
                return Err(CoreError::ProtocolViolation(Violation::SequenceMismatch));
            }
            self.expected_seq = self.expected_seq.wrapping_add(1);
            self.buffer.extend_from_slice(&payload[3..]);
            return Ok(());
        }

        // The retroactive check only ever applies to the second frame; once
        // evaluated here, it must not re-trigger against later frames whose
        // payload[2] happens to also be 0x02 for unrelated reasons.
        let had_potential_seq = self.first_frame_had_potential_seq;
        self.first_frame_had_potential_seq = false;

        if had_potential_seq && payload.get(2) == Some(&0x02) {
            if !self.buffer.is_empty() {
                self.buffer.remove(0);
            }
            self.sequence_mode = true;
            self.expected_seq = 0x03;
            self.buffer.extend_from_slice(&payload[3..]);
            return Ok(());
        }

        self.buffer.extend_from_slice(&payload[2..]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kwp_frame(target: u8, source: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x80 | payload.len() as u8, target, source];
        frame.extend_from_slice(payload);
        let checksum = frame.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        frame.push(checksum);
        frame
    }

    fn iso9141_frame(target: u8, source: u8, tester: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![target, source, tester];
        frame.extend_from_slice(payload);
        let checksum = frame.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        frame.push(checksum);
        frame
    }

    #[test]
    fn single_kwp_frame_without_sequence_heuristic() {
        let mut engine = KLineEngine::new(KLineMode::Kwp, None, None, 0);
        let frame = kwp_frame(0x10, 0xF1, &[0x61, 0x0C, 0x12, 0x34]);
        assert_eq!(engine.feed(&frame).unwrap(), KLineAction::WaitForMore);
        assert_eq!(engine.finalize(), vec![0x12, 0x34]);
    }

    #[test]
    fn iso9141_frames_append_directly() {
        let mut engine = KLineEngine::new(KLineMode::Iso9141, None, None, 0);
        let frame = iso9141_frame(0x10, 0xF1, 0x33, &[0x41, 0x0C, 0x1A, 0x2B]);
        engine.feed(&frame).unwrap();
        assert_eq!(engine.finalize(), vec![0x41, 0x0C, 0x1A, 0x2B]);
    }

    #[test]
    fn checksum_mismatch_is_a_violation() {
        let mut engine = KLineEngine::new(KLineMode::Kwp, None, None, 0);
        let mut frame = kwp_frame(0x10, 0xF1, &[0x61, 0x0C, 0x12]);
        *frame.last_mut().unwrap() ^= 0xFF;
        assert_eq!(
            engine.feed(&frame),
            Err(CoreError::ProtocolViolation(Violation::ChecksumMismatch))
        );
    }

    #[test]
    fn address_mismatch_is_a_violation() {
        let mut engine = KLineEngine::new(KLineMode::Kwp, Some(0x99), None, 0);
        let frame = kwp_frame(0x10, 0xF1, &[0x61, 0x0C, 0x12]);
        assert_eq!(
            engine.feed(&frame),
            Err(CoreError::ProtocolViolation(Violation::AddressMismatch))
        );
    }

    #[test]
    fn retroactive_sequence_detection_strips_leading_marker() {
        let mut engine = KLineEngine::new(KLineMode::Kwp, None, None, 0);
        // First frame: service=0x61, pid=0x0C, payload[2]=0x01 (potential seq).
        let first = kwp_frame(0x10, 0xF1, &[0x61, 0x0C, 0x01, 0xAA, 0xBB]);
        assert_eq!(engine.feed(&first).unwrap(), KLineAction::WaitForMore);
        // Second frame confirms it: payload[2]=0x02.
        let second = kwp_frame(0x10, 0xF1, &[0x61, 0x0C, 0x02, 0xCC, 0xDD]);
        assert_eq!(engine.feed(&second).unwrap(), KLineAction::WaitForMore);
        // The 0x01 marker from the first frame must have been stripped.
        assert_eq!(engine.finalize(), vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn no_sequence_when_second_frame_lacks_marker() {
        let mut engine = KLineEngine::new(KLineMode::Kwp, None, None, 0);
        // payload[2] == 0x01 here, but looks like ordinary data: the next
        // frame does not confirm with 0x02, so it must NOT be stripped.
        let first = kwp_frame(0x10, 0xF1, &[0x61, 0x0C, 0x01, 0xAA]);
        engine.feed(&first).unwrap();
        let second = kwp_frame(0x10, 0xF1, &[0x61, 0x0C, 0x05, 0xBB]);
        engine.feed(&second).unwrap();
        assert_eq!(engine.finalize(), vec![0x01, 0xAA, 0x05, 0xBB]);
    }

    #[test]
    fn sequence_mismatch_once_in_sequence_mode_is_a_violation() {
        let mut engine = KLineEngine::new(KLineMode::Kwp, None, None, 0);
        let first = kwp_frame(0x10, 0xF1, &[0x61, 0x0C, 0x01, 0xAA]);
        engine.feed(&first).unwrap();
        let second = kwp_frame(0x10, 0xF1, &[0x61, 0x0C, 0x02, 0xBB]);
        engine.feed(&second).unwrap();
        // Expected seq is now 0x03; send 0x04 instead.
        let third = kwp_frame(0x10, 0xF1, &[0x61, 0x0C, 0x04, 0xCC]);
        assert_eq!(
            engine.feed(&third),
            Err(CoreError::ProtocolViolation(Violation::SequenceMismatch))
        );
    }

    #[test]
    fn unconfirmed_marker_does_not_retrigger_on_a_later_frame() {
        let mut engine = KLineEngine::new(KLineMode::Kwp, None, None, 0);
        // First frame looks like it might carry a sequence marker...
        let first = kwp_frame(0x10, 0xF1, &[0x61, 0x0C, 0x01, 0xAA]);
        engine.feed(&first).unwrap();
        // ...but the second frame doesn't confirm it.
        let second = kwp_frame(0x10, 0xF1, &[0x61, 0x0C, 0x05, 0xBB]);
        engine.feed(&second).unwrap();
        // A later frame whose payload[2] happens to be 0x02 for unrelated
        // reasons must not be mistaken for sequence-mode confirmation.
        let third = kwp_frame(0x10, 0xF1, &[0x61, 0x0C, 0x02, 0xCC]);
        engine.feed(&third).unwrap();
        assert_eq!(engine.finalize(), vec![0x01, 0xAA, 0x05, 0xBB, 0x02, 0xCC]);
    }

    #[test]
    fn eager_process_when_expected_len_reached() {
        let mut engine = KLineEngine::new(KLineMode::Iso9141, None, None, 2);
        let frame = iso9141_frame(0x10, 0xF1, 0x33, &[0x41, 0x0C]);
        match engine.feed(&frame).unwrap() {
            KLineAction::Process(data) => assert_eq!(data, vec![0x41, 0x0C]),
            other => panic!("{other:?}"),
        }
    }
}
