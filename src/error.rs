//! Typed error taxonomy shared by the PDU codec and host protocol client.
//!
//! Errors never carry raw strings in-band on the wire; [`CoreError::Protocol`]
//! is the one variant whose payload comes from a peer, and it carries a typed
//! [`ProtocolKind`], not a message.

use thiserror::Error;

/// One of the peer-reported error classes, PDU types `0xE0..0xEF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// `0xE0` Unspecified error.
    Unspecified,
    /// `0xE1` Hardware fault on the adapter.
    Hardware,
    /// `0xE2` Operation referenced an unknown channel handle.
    InvalidChannel,
    /// `0xE3` Operation referenced an unknown periodic message handle.
    InvalidPeriodic,
    /// `0xE4` No response was received from the vehicle bus.
    NoResponse,
    /// `0xE5` Malformed RPC call.
    InvalidRpc,
    /// `0xE6` Command not recognized or not valid in the current state.
    InvalidCommand,
    /// Any other byte in `0xE0..=0xEF` not yet assigned a meaning.
    Other(u8),
}

impl ProtocolKind {
    /// Maps an error PDU type byte (`0xE0..=0xEF`) to its [`ProtocolKind`].
    pub fn from_code(code: u8) -> Option<Self> {
        if !(0xE0..=0xEF).contains(&code) {
            return None;
        }
        Some(match code {
            0xE0 => Self::Unspecified,
            0xE1 => Self::Hardware,
            0xE2 => Self::InvalidChannel,
            0xE3 => Self::InvalidPeriodic,
            0xE4 => Self::NoResponse,
            0xE5 => Self::InvalidRpc,
            0xE6 => Self::InvalidCommand,
            other => Self::Other(other),
        })
    }
}

/// A single protocol-state-machine violation, used by the ISO-TP and K-Line
/// engines' strict-mode error path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// A flow-control OVERFLOW status was received.
    Overflow,
    /// A frame arrived in a state that cannot accept it (e.g. CONSECUTIVE
    /// while idle, or an unexpected flow-control status).
    UnexpectedFrame,
    /// A SINGLE/FIRST frame's declared length did not fit the available
    /// bytes, or violated the admissible length rules for the mode in use.
    BadLength,
    /// A CONSECUTIVE frame's sequence number did not match the expected one.
    SequenceMismatch,
    /// A physical frame length fell outside the admissible set for the mode.
    InadmissibleFrameLength,
    /// A K-Line frame's trailing checksum did not match.
    ChecksumMismatch,
    /// A K-Line frame's target/source did not match the configured
    /// expectation.
    AddressMismatch,
}

/// The crate's single error type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// The client is not connected to a transport.
    #[error("not connected")]
    NotConnected,
    /// The underlying transport failed to send or receive.
    #[error("transport error: {0}")]
    Transport(String),
    /// A waiting operation's deadline elapsed before completion.
    #[error("operation timed out")]
    Timeout,
    /// The peer replied with a typed protocol error.
    #[error("protocol error: {0:?}")]
    Protocol(ProtocolKind),
    /// A request referenced a channel handle the adapter doesn't know.
    #[error("invalid channel handle")]
    InvalidChannel,
    /// A request referenced a periodic message handle the adapter doesn't know.
    #[error("invalid periodic message handle")]
    InvalidPeriodic,
    /// The adapter reported no response from the vehicle bus.
    #[error("no response from bus")]
    NoResponse,
    /// A malformed RPC call.
    #[error("invalid RPC call")]
    InvalidRpc,
    /// A command not valid in the current state.
    #[error("invalid command")]
    InvalidCommand,
    /// A read was requested but no data is buffered.
    #[error("buffer empty")]
    BufferEmpty,
    /// A write was requested but the buffer has no room left.
    #[error("buffer full")]
    BufferFull,
    /// A value exceeded an implementation-defined limit (e.g. batch ceiling).
    #[error("limit exceeded")]
    LimitExceeded,
    /// The requested operation is not supported by this build.
    #[error("unsupported operation")]
    Unsupported,
    /// The operation is forbidden in the engine/client's current state
    /// (e.g. calling `writePDU` while an ISO-TP engine is mid-transfer,
    /// or toggling scheduling mode with a request in flight).
    #[error("operation forbidden in current state: {0}")]
    State(&'static str),
    /// A byte sequence could not be decoded into a PDU and will not recover
    /// on its own (distinct from a resync, which is not an error).
    #[error("decoding error: {0}")]
    Decoding(String),
    /// An ISO-TP or K-Line engine detected a protocol violation in strict
    /// mode; the caller must reset the engine before continuing.
    #[error("protocol violation: {0:?}")]
    ProtocolViolation(Violation),
}

/// Convenience alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;
