//! `canyonero-core`: wire codec, segmentation engines, and host protocol
//! client for the CANyonero adapter family.
//!
//! - [`pdu`] — the `[ATT|TYP|LEN|payload]` framed PDU codec.
//! - [`isotp`] — ISO 15765-2 classical and CAN-FD segmentation engines.
//! - [`kline`] — ISO 14230/ISO 9141-2 K-Line frame validation and
//!   KWP multi-frame reassembly.
//! - [`transport`] — the byte-duplex capability the client is generic over.
//! - [`client`] — request/reply correlation and the async CAN frame queue.
//! - [`config`] — typed, constructible configuration for the engines and client.
//! - [`error`] — the crate's single error type.

pub mod bytes;
pub mod client;
pub mod config;
pub mod error;
pub mod isotp;
pub mod kline;
pub mod pdu;
pub mod transport;

pub use client::{ProtocolClient, SchedulingMode};
pub use config::{ClientConfig, IsoTpConfig, KLineConfig};
pub use error::{CoreError, CoreResult, ProtocolKind, Violation};
pub use isotp::classical::IsoTpClassicalEngine;
pub use isotp::fd::IsoTpFdEngine;
pub use isotp::{AddressingMode, Behavior, IsoTpAction};
pub use kline::{KLineAction, KLineEngine, KLineMode};
pub use pdu::{Pdu, PduType, ReceivedFrame};
pub use transport::Transport;
