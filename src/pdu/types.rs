//! Wire-level value types shared by every PDU: the type tag, channel
//! protocol tag, arbitration block, separation-time byte codec, device
//! info record and a received CAN frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bytes::{push_u32_be, read_u32_be};

/// The fixed leading byte that marks a PDU frame boundary on the wire.
pub const ATT: u8 = 0x1F;

/// Disjoint enumeration of PDU type byte codes, stable across firmware
/// versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PduType {
    Ping,
    RequestInfo,
    ReadVoltage,

    OpenChannel,
    CloseChannel,
    OpenFdChannel,
    Send,
    SetArbitration,
    StartPeriodic,
    EndPeriodic,
    SendCompressed,

    BeginFirmwareUpdate,
    FirmwareUpdateChunk,
    CommitFirmwareUpdate,
    Reset,

    RpcCall,
    RpcSendBinary,

    Ok,
    Pong,
    Info,
    Voltage,

    ChannelOpened,
    ChannelClosed,
    Received,
    ReceivedCompressed,
    PeriodicStarted,
    PeriodicEnded,

    FirmwareUpdateBegun,
    FirmwareUpdateChunkAck,
    FirmwareUpdateCommitted,

    RpcResult,
    RpcBinaryResult,

    /// `0xE0..=0xEF`: the peer-reported error classes. The specific kind
    /// is recovered with [`crate::error::ProtocolKind::from_code`].
    Error(u8),
}

impl PduType {
    /// Maps a wire type byte to a [`PduType`], or `None` if unrecognized.
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x10 => Self::Ping,
            0x11 => Self::RequestInfo,
            0x12 => Self::ReadVoltage,
            0x30 => Self::OpenChannel,
            0x31 => Self::CloseChannel,
            0x32 => Self::OpenFdChannel,
            0x33 => Self::Send,
            0x34 => Self::SetArbitration,
            0x35 => Self::StartPeriodic,
            0x36 => Self::EndPeriodic,
            0x37 => Self::SendCompressed,
            0x40 => Self::BeginFirmwareUpdate,
            0x41 => Self::FirmwareUpdateChunk,
            0x42 => Self::CommitFirmwareUpdate,
            0x43 => Self::Reset,
            0x50 => Self::RpcCall,
            0x51 => Self::RpcSendBinary,
            0x80 => Self::Ok,
            0x90 => Self::Pong,
            0x91 => Self::Info,
            0x92 => Self::Voltage,
            0xB0 => Self::ChannelOpened,
            0xB1 => Self::ChannelClosed,
            0xB2 => Self::Received,
            0xB3 => Self::ReceivedCompressed,
            0xB5 => Self::PeriodicStarted,
            0xB6 => Self::PeriodicEnded,
            0xC0 => Self::FirmwareUpdateBegun,
            0xC1 => Self::FirmwareUpdateChunkAck,
            0xC2 => Self::FirmwareUpdateCommitted,
            0xD0 => Self::RpcResult,
            0xD1 => Self::RpcBinaryResult,
            0xE0..=0xEF => Self::Error(b),
            _ => return None,
        })
    }

    /// Returns the wire byte for this type.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Ping => 0x10,
            Self::RequestInfo => 0x11,
            Self::ReadVoltage => 0x12,
            Self::OpenChannel => 0x30,
            Self::CloseChannel => 0x31,
            Self::OpenFdChannel => 0x32,
            Self::Send => 0x33,
            Self::SetArbitration => 0x34,
            Self::StartPeriodic => 0x35,
            Self::EndPeriodic => 0x36,
            Self::SendCompressed => 0x37,
            Self::BeginFirmwareUpdate => 0x40,
            Self::FirmwareUpdateChunk => 0x41,
            Self::CommitFirmwareUpdate => 0x42,
            Self::Reset => 0x43,
            Self::RpcCall => 0x50,
            Self::RpcSendBinary => 0x51,
            Self::Ok => 0x80,
            Self::Pong => 0x90,
            Self::Info => 0x91,
            Self::Voltage => 0x92,
            Self::ChannelOpened => 0xB0,
            Self::ChannelClosed => 0xB1,
            Self::Received => 0xB2,
            Self::ReceivedCompressed => 0xB3,
            Self::PeriodicStarted => 0xB5,
            Self::PeriodicEnded => 0xB6,
            Self::FirmwareUpdateBegun => 0xC0,
            Self::FirmwareUpdateChunkAck => 0xC1,
            Self::FirmwareUpdateCommitted => 0xC2,
            Self::RpcResult => 0xD0,
            Self::RpcBinaryResult => 0xD1,
            Self::Error(b) => b,
        }
    }

    /// True for the `0xE0..=0xEF` error class.
    pub fn is_error(self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// The vehicle-bus protocol a channel is opened against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelProtocol {
    Raw = 0x00,
    IsoTp = 0x01,
    KLine = 0x02,
    RawFd = 0x03,
    IsoTpFd = 0x04,
    RawWithFc = 0x05,
    Enet = 0x06,
}

impl ChannelProtocol {
    /// Maps a wire byte to a [`ChannelProtocol`].
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => Self::Raw,
            0x01 => Self::IsoTp,
            0x02 => Self::KLine,
            0x03 => Self::RawFd,
            0x04 => Self::IsoTpFd,
            0x05 => Self::RawWithFc,
            0x06 => Self::Enet,
            _ => return None,
        })
    }
}

/// A CAN arbitration configuration: the IDs and masks that determine
/// which frames the adapter emits and which it accepts. 14 bytes on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arbitration {
    pub request: u32,
    pub request_extension: u8,
    pub reply_pattern: u32,
    /// `0` means "match any" reply.
    pub reply_mask: u32,
    pub reply_extension: u8,
}

impl Arbitration {
    /// Wire size in bytes.
    pub const WIRE_LEN: usize = 14;

    /// Serializes this arbitration block in wire order:
    /// `request | requestExt | replyPattern | replyMask | replyExt`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        push_u32_be(out, self.request);
        out.push(self.request_extension);
        push_u32_be(out, self.reply_pattern);
        push_u32_be(out, self.reply_mask);
        out.push(self.reply_extension);
    }

    /// Parses an arbitration block from the front of `buf`.
    ///
    /// Returns `None` if fewer than [`Self::WIRE_LEN`] bytes are available.
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_LEN {
            return None;
        }
        let request = read_u32_be(&buf[0..4])?;
        let request_extension = buf[4];
        let reply_pattern = read_u32_be(&buf[5..9])?;
        let reply_mask = read_u32_be(&buf[9..13])?;
        let reply_extension = buf[13];
        Some(Self {
            request,
            request_extension,
            reply_pattern,
            reply_mask,
            reply_extension,
        })
    }

    /// `true` when [`Self::reply_mask`] is `0`, meaning "match any".
    pub fn matches_any_reply(&self) -> bool {
        self.reply_mask == 0
    }
}

/// RX/TX separation time, transported as a single byte: high nibble is
/// the RX code, low nibble is the TX code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeparationTimes {
    pub rx_us: u32,
    pub tx_us: u32,
}

/// Maps a 4-bit separation-time code to microseconds, per ISO 15765-2:2016.
pub fn stmin_code_to_us(code: u8) -> u32 {
    match code & 0x0F {
        0x0 => 0,
        0x1 => 1000,
        0x2 => 2000,
        0x3 => 3000,
        0x4 => 4000,
        0x5 => 5000,
        0x6 => 6000,
        0x7 => 100,
        0x8 => 200,
        0x9 => 300,
        0xA => 400,
        0xB => 500,
        0xC => 600,
        0xD => 700,
        0xE => 800,
        0xF => 900,
        _ => unreachable!("masked to 4 bits"),
    }
}

/// Maps a microsecond value back to its 4-bit separation-time code.
///
/// Returns `None` if `us` has no representable code (the mapping is not
/// onto every u32 value, only the table in [`stmin_code_to_us`]).
pub fn us_to_stmin_code(us: u32) -> Option<u8> {
    (0u8..=0xF).find(|&code| stmin_code_to_us(code) == us)
}

impl SeparationTimes {
    /// Decodes the wire byte (high nibble RX, low nibble TX).
    pub fn from_byte(b: u8) -> Self {
        Self {
            rx_us: stmin_code_to_us(b >> 4),
            tx_us: stmin_code_to_us(b & 0x0F),
        }
    }

    /// Encodes to the wire byte. Returns `None` if either side's
    /// microsecond value has no representable code.
    pub fn to_byte(self) -> Option<u8> {
        let rx = us_to_stmin_code(self.rx_us)?;
        let tx = us_to_stmin_code(self.tx_us)?;
        Some((rx << 4) | tx)
    }
}

/// Adapter/device identity, transported as five UTF-8 lines separated
/// by `0x0A`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub vendor: String,
    pub model: String,
    pub hardware: String,
    pub serial: String,
    pub firmware: String,
}

impl DeviceInfo {
    /// Serializes as `vendor\nmodel\nhardware\nserial\nfirmware`.
    pub fn to_wire(&self) -> Vec<u8> {
        [
            &self.vendor,
            &self.model,
            &self.hardware,
            &self.serial,
            &self.firmware,
        ]
        .join("\n")
        .into_bytes()
    }

    /// Parses five `\n`-separated UTF-8 lines.
    pub fn from_wire(buf: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(buf).ok()?;
        let mut lines = text.split('\n');
        let vendor = lines.next()?.to_string();
        let model = lines.next()?.to_string();
        let hardware = lines.next()?.to_string();
        let serial = lines.next()?.to_string();
        let firmware = lines.next()?.to_string();
        if lines.next().is_some() {
            return None;
        }
        Some(Self {
            vendor,
            model,
            hardware,
            serial,
            firmware,
        })
    }
}

/// A CAN frame received from the vehicle bus and routed to the host's
/// async frame queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanFrame {
    pub channel: u8,
    pub id: u32,
    pub extension: u8,
    pub data: Vec<u8>,
    /// Host-assigned arrival time; not present on the wire.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separation_time_roundtrip_for_all_representable_values() {
        let values: Vec<u32> = (0..=9).map(|i| i * 1000).chain((1..=9).map(|i| i * 100)).collect();
        for &v in &values {
            let code = us_to_stmin_code(v);
            if let Some(code) = code {
                assert_eq!(stmin_code_to_us(code), v, "roundtrip failed for {v}");
            }
        }
        // The exact set named by the spec: 0, 100..900, 1000..5000.
        let spec_values: Vec<u32> = std::iter::once(0)
            .chain((1..=9).map(|i| i * 100))
            .chain((1..=5).map(|i| i * 1000))
            .collect();
        for v in spec_values {
            let code = us_to_stmin_code(v).unwrap_or_else(|| panic!("{v} has no code"));
            assert_eq!(stmin_code_to_us(code), v);
        }
    }

    #[test]
    fn separation_time_byte_matches_nibble_layout() {
        let st = SeparationTimes { rx_us: 0, tx_us: 2000 };
        assert_eq!(st.to_byte(), Some(0x02));
        let st = SeparationTimes::from_byte(0xA7);
        assert_eq!(st.rx_us, 400);
        assert_eq!(st.tx_us, 100);
    }

    #[test]
    fn arbitration_wire_roundtrip() {
        let arb = Arbitration {
            request: 0x7E0,
            request_extension: 0,
            reply_pattern: 0x7E8,
            reply_mask: 0xFFFF_FFFF,
            reply_extension: 0,
        };
        let mut buf = Vec::new();
        arb.write_to(&mut buf);
        assert_eq!(buf.len(), Arbitration::WIRE_LEN);
        assert_eq!(Arbitration::read_from(&buf), Some(arb));
        assert!(!arb.matches_any_reply());
    }

    #[test]
    fn device_info_wire_roundtrip() {
        let info = DeviceInfo {
            vendor: "Vendor".into(),
            model: "Model".into(),
            hardware: "HW".into(),
            serial: "SN1".into(),
            firmware: "FW1".into(),
        };
        let wire = info.to_wire();
        assert_eq!(DeviceInfo::from_wire(&wire), Some(info));
    }
}
