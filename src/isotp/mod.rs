//! ISO 15765-2 segmentation: classical (≤8 byte frames) and CAN-FD
//! (up to 64 byte frames, dynamic DLC) engines sharing one state-machine
//! shape and one [`IsoTpAction`] result type.

pub mod classical;
pub mod fd;

use crate::error::Violation;

/// Standard (11-bit-style) vs. extended addressing; determines frame
/// width (classical: 8/7 bytes) and the FD maximum DLC (64/63 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Standard,
    Extended,
}

/// Strict surfaces violations to the caller; defensive self-recovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Strict,
    Defensive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Idle,
    Sending,
    Receiving,
}

/// What an engine wants the caller to do after `write_pdu`/`on_frame`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoTpAction {
    /// Emit `frames` on the CAN link, waiting `separation_time_us`
    /// between each one. The engine does not itself sleep — see
    /// `spec.md` §4.3's timing note.
    WriteFrames {
        separation_time_us: u32,
        frames: Vec<Vec<u8>>,
    },
    /// A complete message was reassembled (or a SINGLE frame decoded);
    /// hand it to the layer above the engine.
    Process(Vec<u8>),
    /// Nothing to do yet; more frames are needed.
    WaitForMore,
    /// A protocol violation occurred (strict mode only; defensive mode
    /// resolves internally and never returns this variant).
    Violation(Violation),
}

/// Flow-control status byte values (PCI high nibble `0x3`, low nibble is
/// the status).
mod fc {
    pub const CTS: u8 = 0x30;
    pub const WAIT: u8 = 0x31;
    pub const OVERFLOW: u8 = 0x32;
}

pub(crate) use fc::{CTS, OVERFLOW, WAIT};
