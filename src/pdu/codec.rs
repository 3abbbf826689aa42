//! The framed PDU codec: `[ATT | TYP | LEN:u16 BE | payload]`.
//!
//! `Pdu::serialize`/`Pdu::parse` are the byte-exact round-trip pair the
//! rest of the crate builds on; `parse` never panics on malformed input,
//! it reports [`ParseOutcome::NeedMore`] or [`ParseOutcome::Resync`].

use crate::bytes::{push_u16_be, push_u32_be, read_u16_be, read_u32_be};
use crate::error::{CoreError, CoreResult, ProtocolKind};

use super::types::{Arbitration, ChannelProtocol, DeviceInfo, SeparationTimes, ATT};

/// Maximum payload length representable in the 16-bit `LEN` field.
pub const MAX_PAYLOAD_LEN: usize = 0xFFFF;
/// Maximum total frame length (`4 + MAX_PAYLOAD_LEN`).
pub const MAX_FRAME_LEN: usize = 0x10003;

/// Default ceiling for [`Pdu::send_batch`]; callers may raise it.
pub const DEFAULT_BATCH_CEILING: usize = 16 * 1024;

/// The raw fields of a bus frame as carried on the wire by
/// `Received`/`ReceivedCompressed`, before the host stamps an arrival time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub channel: u8,
    pub id: u32,
    pub extension: u8,
    pub data: Vec<u8>,
}

/// One parsed, immutable PDU.
#[derive(Debug, Clone, PartialEq)]
pub enum Pdu {
    Ping(Vec<u8>),
    RequestInfo,
    ReadVoltage,

    OpenChannel {
        protocol: ChannelProtocol,
        bitrate: u32,
        separation: SeparationTimes,
    },
    CloseChannel {
        handle: u8,
    },
    OpenFdChannel {
        protocol: ChannelProtocol,
        bitrate: u32,
        data_bitrate: u32,
        separation: SeparationTimes,
    },
    Send {
        handle: u8,
        data: Vec<u8>,
    },
    SetArbitration {
        handle: u8,
        arbitration: Arbitration,
    },
    StartPeriodic {
        timeout_code: u8,
        arbitration: Arbitration,
        data: Vec<u8>,
    },
    EndPeriodic {
        handle: u8,
    },
    SendCompressed {
        handle: u8,
        uncompressed_len: u16,
        compressed: Vec<u8>,
    },

    BeginFirmwareUpdate(Vec<u8>),
    FirmwareUpdateChunk(Vec<u8>),
    CommitFirmwareUpdate(Vec<u8>),
    Reset,

    RpcCall(Vec<u8>),
    RpcSendBinary(Vec<u8>),

    Ok,
    Pong(Vec<u8>),
    Info(DeviceInfo),
    Voltage {
        millivolts: u16,
    },

    ChannelOpened {
        handle: u8,
    },
    ChannelClosed {
        handle: u8,
    },
    Received(ReceivedFrame),
    ReceivedCompressed {
        channel: u8,
        id: u32,
        extension: u8,
        uncompressed_len: u16,
        compressed: Vec<u8>,
    },
    PeriodicStarted {
        handle: u8,
    },
    PeriodicEnded {
        handle: u8,
    },

    FirmwareUpdateBegun(Vec<u8>),
    FirmwareUpdateChunkAck(Vec<u8>),
    FirmwareUpdateCommitted(Vec<u8>),

    RpcResult(Vec<u8>),
    RpcBinaryResult(Vec<u8>),

    /// `0xE0..=0xEF`, empty payload.
    Error(u8),
}

/// Result of attempting to parse a PDU from a byte buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// Successfully decoded a PDU; the `usize` is the number of bytes
    /// consumed from the front of the buffer (`4 + LEN`).
    Ok(Pdu, usize),
    /// Fewer than the required bytes are buffered; call again once more
    /// bytes have arrived.
    NeedMore,
    /// The buffer does not start with [`ATT`]; the caller should skip
    /// this many leading bytes and retry.
    Resync(usize),
}

impl Pdu {
    // ---- typed constructors -------------------------------------------------

    pub fn ping(echo: impl Into<Vec<u8>>) -> Self {
        Self::Ping(echo.into())
    }

    pub fn request_info() -> Self {
        Self::RequestInfo
    }

    pub fn read_voltage() -> Self {
        Self::ReadVoltage
    }

    /// Fails with [`CoreError::Unsupported`] if `separation`'s RX or TX
    /// microsecond value has no representable wire code.
    pub fn open_channel(
        protocol: ChannelProtocol,
        bitrate: u32,
        separation: SeparationTimes,
    ) -> CoreResult<Self> {
        separation.to_byte().ok_or(CoreError::Unsupported)?;
        Ok(Self::OpenChannel {
            protocol,
            bitrate,
            separation,
        })
    }

    /// Fails with [`CoreError::Unsupported`] if `separation`'s RX or TX
    /// microsecond value has no representable wire code.
    pub fn open_fd_channel(
        protocol: ChannelProtocol,
        bitrate: u32,
        data_bitrate: u32,
        separation: SeparationTimes,
    ) -> CoreResult<Self> {
        separation.to_byte().ok_or(CoreError::Unsupported)?;
        Ok(Self::OpenFdChannel {
            protocol,
            bitrate,
            data_bitrate,
            separation,
        })
    }

    pub fn close_channel(handle: u8) -> Self {
        Self::CloseChannel { handle }
    }

    pub fn send(handle: u8, data: impl Into<Vec<u8>>) -> Self {
        Self::Send {
            handle,
            data: data.into(),
        }
    }

    /// Packs `frames` as `handle, (len:u8, data)*` into a single `Send` PDU.
    ///
    /// Fails with [`CoreError::LimitExceeded`] if the packed payload would
    /// exceed `ceiling` bytes, or if any single frame exceeds 255 bytes
    /// (the `len:u8` field cannot represent more).
    pub fn send_batch(handle: u8, frames: &[&[u8]], ceiling: usize) -> CoreResult<Self> {
        let mut data = Vec::new();
        for frame in frames {
            if frame.len() > u8::MAX as usize {
                return Err(CoreError::LimitExceeded);
            }
            data.push(frame.len() as u8);
            data.extend_from_slice(frame);
            if data.len() > ceiling {
                return Err(CoreError::LimitExceeded);
            }
        }
        Ok(Self::Send { handle, data })
    }

    pub fn set_arbitration(handle: u8, arbitration: Arbitration) -> Self {
        Self::SetArbitration { handle, arbitration }
    }

    pub fn start_periodic(timeout_code: u8, arbitration: Arbitration, data: impl Into<Vec<u8>>) -> Self {
        Self::StartPeriodic {
            timeout_code,
            arbitration,
            data: data.into(),
        }
    }

    pub fn end_periodic(handle: u8) -> Self {
        Self::EndPeriodic { handle }
    }

    pub fn reset() -> Self {
        Self::Reset
    }

    // ---- typed accessors -----------------------------------------------------

    /// The channel/periodic handle carried by any PDU that has one.
    pub fn channel_handle(&self) -> Option<u8> {
        match self {
            Self::CloseChannel { handle }
            | Self::Send { handle, .. }
            | Self::SetArbitration { handle, .. }
            | Self::EndPeriodic { handle }
            | Self::SendCompressed { handle, .. }
            | Self::ChannelOpened { handle }
            | Self::ChannelClosed { handle }
            | Self::PeriodicStarted { handle }
            | Self::PeriodicEnded { handle } => Some(*handle),
            _ => None,
        }
    }

    pub fn voltage_millivolts(&self) -> Option<u16> {
        match self {
            Self::Voltage { millivolts } => Some(*millivolts),
            _ => None,
        }
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        match self {
            Self::Info(info) => Some(info),
            _ => None,
        }
    }

    pub fn received_frame(&self) -> Option<&ReceivedFrame> {
        match self {
            Self::Received(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn arbitration(&self) -> Option<&Arbitration> {
        match self {
            Self::SetArbitration { arbitration, .. } => Some(arbitration),
            Self::StartPeriodic { arbitration, .. } => Some(arbitration),
            _ => None,
        }
    }

    pub fn separation_times(&self) -> Option<SeparationTimes> {
        match self {
            Self::OpenChannel { separation, .. } => Some(*separation),
            Self::OpenFdChannel { separation, .. } => Some(*separation),
            _ => None,
        }
    }

    /// No PDU variant in this protocol carries a filename; reserved for
    /// the firmware-update lifecycle should a future firmware revision
    /// add one. Always `None` today.
    pub fn filename(&self) -> Option<&str> {
        None
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// A short operator-readable message for an error PDU. Never crosses
    /// the wire itself; purely a display helper.
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Error(code) => {
                let kind = ProtocolKind::from_code(*code)?;
                Some(format!("{kind:?}"))
            }
            _ => None,
        }
    }

    /// The wire [`super::types::PduType`] this value would serialize as.
    pub fn pdu_type(&self) -> super::types::PduType {
        use super::types::PduType as T;
        match self {
            Self::Ping(_) => T::Ping,
            Self::RequestInfo => T::RequestInfo,
            Self::ReadVoltage => T::ReadVoltage,
            Self::OpenChannel { .. } => T::OpenChannel,
            Self::CloseChannel { .. } => T::CloseChannel,
            Self::OpenFdChannel { .. } => T::OpenFdChannel,
            Self::Send { .. } => T::Send,
            Self::SetArbitration { .. } => T::SetArbitration,
            Self::StartPeriodic { .. } => T::StartPeriodic,
            Self::EndPeriodic { .. } => T::EndPeriodic,
            Self::SendCompressed { .. } => T::SendCompressed,
            Self::BeginFirmwareUpdate(_) => T::BeginFirmwareUpdate,
            Self::FirmwareUpdateChunk(_) => T::FirmwareUpdateChunk,
            Self::CommitFirmwareUpdate(_) => T::CommitFirmwareUpdate,
            Self::Reset => T::Reset,
            Self::RpcCall(_) => T::RpcCall,
            Self::RpcSendBinary(_) => T::RpcSendBinary,
            Self::Ok => T::Ok,
            Self::Pong(_) => T::Pong,
            Self::Info(_) => T::Info,
            Self::Voltage { .. } => T::Voltage,
            Self::ChannelOpened { .. } => T::ChannelOpened,
            Self::ChannelClosed { .. } => T::ChannelClosed,
            Self::Received(_) => T::Received,
            Self::ReceivedCompressed { .. } => T::ReceivedCompressed,
            Self::PeriodicStarted { .. } => T::PeriodicStarted,
            Self::PeriodicEnded { .. } => T::PeriodicEnded,
            Self::FirmwareUpdateBegun(_) => T::FirmwareUpdateBegun,
            Self::FirmwareUpdateChunkAck(_) => T::FirmwareUpdateChunkAck,
            Self::FirmwareUpdateCommitted(_) => T::FirmwareUpdateCommitted,
            Self::RpcResult(_) => T::RpcResult,
            Self::RpcBinaryResult(_) => T::RpcBinaryResult,
            Self::Error(code) => T::Error(*code),
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Ping(echo) | Self::Pong(echo) => out.extend_from_slice(echo),
            Self::RequestInfo | Self::ReadVoltage | Self::Ok | Self::Reset | Self::Error(_) => {}
            Self::Info(info) => out.extend_from_slice(&info.to_wire()),
            Self::Voltage { millivolts } => push_u16_be(&mut out, *millivolts),
            Self::OpenChannel {
                protocol,
                bitrate,
                separation,
            } => {
                out.push(*protocol as u8);
                push_u32_be(&mut out, *bitrate);
                // Constructed only through `open_channel`, which validates.
                out.push(separation.to_byte().unwrap_or(0));
            }
            Self::OpenFdChannel {
                protocol,
                bitrate,
                data_bitrate,
                separation,
            } => {
                out.push(*protocol as u8);
                push_u32_be(&mut out, *bitrate);
                push_u32_be(&mut out, *data_bitrate);
                // Constructed only through `open_fd_channel`, which validates.
                out.push(separation.to_byte().unwrap_or(0));
            }
            Self::CloseChannel { handle } | Self::EndPeriodic { handle } => out.push(*handle),
            Self::Send { handle, data } => {
                out.push(*handle);
                out.extend_from_slice(data);
            }
            Self::SetArbitration { handle, arbitration } => {
                out.push(*handle);
                arbitration.write_to(&mut out);
            }
            Self::StartPeriodic {
                timeout_code,
                arbitration,
                data,
            } => {
                out.push(*timeout_code);
                arbitration.write_to(&mut out);
                out.extend_from_slice(data);
            }
            Self::SendCompressed {
                handle,
                uncompressed_len,
                compressed,
            } => {
                out.push(*handle);
                push_u16_be(&mut out, *uncompressed_len);
                out.extend_from_slice(compressed);
            }
            Self::BeginFirmwareUpdate(b)
            | Self::FirmwareUpdateChunk(b)
            | Self::CommitFirmwareUpdate(b)
            | Self::RpcCall(b)
            | Self::RpcSendBinary(b)
            | Self::FirmwareUpdateBegun(b)
            | Self::FirmwareUpdateChunkAck(b)
            | Self::FirmwareUpdateCommitted(b)
            | Self::RpcResult(b)
            | Self::RpcBinaryResult(b) => out.extend_from_slice(b),
            Self::ChannelOpened { handle }
            | Self::ChannelClosed { handle }
            | Self::PeriodicStarted { handle }
            | Self::PeriodicEnded { handle } => out.push(*handle),
            Self::Received(frame) => {
                out.push(frame.channel);
                push_u32_be(&mut out, frame.id);
                out.push(frame.extension);
                out.extend_from_slice(&frame.data);
            }
            Self::ReceivedCompressed {
                channel,
                id,
                extension,
                uncompressed_len,
                compressed,
            } => {
                out.push(*channel);
                push_u32_be(&mut out, *id);
                out.push(*extension);
                push_u16_be(&mut out, *uncompressed_len);
                out.extend_from_slice(compressed);
            }
        }
        out
    }

    /// Serializes this PDU to its wire form: `[ATT | TYP | LEN | payload]`.
    pub fn serialize(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut out = Vec::with_capacity(4 + payload.len());
        out.push(ATT);
        out.push(self.pdu_type().to_byte());
        push_u16_be(&mut out, payload.len() as u16);
        out.extend_from_slice(&payload);
        out
    }

    /// Attempts to parse one PDU from the front of `buf`.
    ///
    /// See module docs and `spec.md` §4.1 for the parsing contract.
    pub fn parse(buf: &[u8]) -> ParseOutcome {
        if buf.len() < 4 {
            return ParseOutcome::NeedMore;
        }
        if buf[0] != ATT {
            let skip = buf.iter().take_while(|&&b| b != ATT).count().max(1);
            return ParseOutcome::Resync(skip);
        }
        let typ = buf[1];
        let len = read_u16_be(&buf[2..4]).expect("checked len >= 4") as usize;
        let total = 4 + len;
        if buf.len() < total {
            return ParseOutcome::NeedMore;
        }
        let payload = &buf[4..total];
        match decode(typ, payload) {
            Some(pdu) => ParseOutcome::Ok(pdu, total),
            None => ParseOutcome::Resync(1),
        }
    }
}

fn decode(typ: u8, payload: &[u8]) -> Option<Pdu> {
    use super::types::PduType as T;
    let ty = T::from_byte(typ)?;
    Some(match ty {
        T::Ping => Pdu::Ping(payload.to_vec()),
        T::RequestInfo => Pdu::RequestInfo,
        T::ReadVoltage => Pdu::ReadVoltage,
        T::OpenChannel => {
            if payload.len() < 6 {
                return None;
            }
            Pdu::OpenChannel {
                protocol: ChannelProtocol::from_byte(payload[0])?,
                bitrate: read_u32_be(&payload[1..5])?,
                separation: SeparationTimes::from_byte(payload[5]),
            }
        }
        T::CloseChannel => Pdu::CloseChannel { handle: *payload.first()? },
        T::OpenFdChannel => {
            if payload.len() < 10 {
                return None;
            }
            Pdu::OpenFdChannel {
                protocol: ChannelProtocol::from_byte(payload[0])?,
                bitrate: read_u32_be(&payload[1..5])?,
                data_bitrate: read_u32_be(&payload[5..9])?,
                separation: SeparationTimes::from_byte(payload[9]),
            }
        }
        T::Send => {
            let handle = *payload.first()?;
            Pdu::Send {
                handle,
                data: payload[1..].to_vec(),
            }
        }
        T::SetArbitration => {
            let handle = *payload.first()?;
            let arbitration = Arbitration::read_from(&payload[1..])?;
            Pdu::SetArbitration { handle, arbitration }
        }
        T::StartPeriodic => {
            if payload.is_empty() {
                return None;
            }
            let timeout_code = payload[0];
            let arbitration = Arbitration::read_from(&payload[1..])?;
            let data_start = 1 + Arbitration::WIRE_LEN;
            Pdu::StartPeriodic {
                timeout_code,
                arbitration,
                data: payload[data_start..].to_vec(),
            }
        }
        T::EndPeriodic => Pdu::EndPeriodic { handle: *payload.first()? },
        T::SendCompressed => {
            if payload.len() < 3 {
                return None;
            }
            let handle = payload[0];
            let uncompressed_len = read_u16_be(&payload[1..3])?;
            Pdu::SendCompressed {
                handle,
                uncompressed_len,
                compressed: payload[3..].to_vec(),
            }
        }
        T::BeginFirmwareUpdate => Pdu::BeginFirmwareUpdate(payload.to_vec()),
        T::FirmwareUpdateChunk => Pdu::FirmwareUpdateChunk(payload.to_vec()),
        T::CommitFirmwareUpdate => Pdu::CommitFirmwareUpdate(payload.to_vec()),
        T::Reset => Pdu::Reset,
        T::RpcCall => Pdu::RpcCall(payload.to_vec()),
        T::RpcSendBinary => Pdu::RpcSendBinary(payload.to_vec()),
        T::Ok => Pdu::Ok,
        T::Pong => Pdu::Pong(payload.to_vec()),
        T::Info => Pdu::Info(DeviceInfo::from_wire(payload)?),
        T::Voltage => Pdu::Voltage {
            millivolts: read_u16_be(payload)?,
        },
        T::ChannelOpened => Pdu::ChannelOpened { handle: *payload.first()? },
        T::ChannelClosed => Pdu::ChannelClosed { handle: *payload.first()? },
        T::Received => {
            if payload.len() < 6 {
                return None;
            }
            Pdu::Received(ReceivedFrame {
                channel: payload[0],
                id: read_u32_be(&payload[1..5])?,
                extension: payload[5],
                data: payload[6..].to_vec(),
            })
        }
        T::ReceivedCompressed => {
            if payload.len() < 8 {
                return None;
            }
            Pdu::ReceivedCompressed {
                channel: payload[0],
                id: read_u32_be(&payload[1..5])?,
                extension: payload[5],
                uncompressed_len: read_u16_be(&payload[6..8])?,
                compressed: payload[8..].to_vec(),
            }
        }
        T::PeriodicStarted => Pdu::PeriodicStarted { handle: *payload.first()? },
        T::PeriodicEnded => Pdu::PeriodicEnded { handle: *payload.first()? },
        T::FirmwareUpdateBegun => Pdu::FirmwareUpdateBegun(payload.to_vec()),
        T::FirmwareUpdateChunkAck => Pdu::FirmwareUpdateChunkAck(payload.to_vec()),
        T::FirmwareUpdateCommitted => Pdu::FirmwareUpdateCommitted(payload.to_vec()),
        T::RpcResult => Pdu::RpcResult(payload.to_vec()),
        T::RpcBinaryResult => Pdu::RpcBinaryResult(payload.to_vec()),
        T::Error(code) => {
            if !payload.is_empty() {
                return None;
            }
            Pdu::Error(code)
        }
    })
}

/// Compresses `data` as an LZ4 block and wraps it as a `SendCompressed` PDU.
pub fn send_compressed(handle: u8, data: &[u8]) -> CoreResult<Pdu> {
    if data.len() > u16::MAX as usize {
        return Err(CoreError::LimitExceeded);
    }
    let compressed = lz4_flex::block::compress(data);
    Ok(Pdu::SendCompressed {
        handle,
        uncompressed_len: data.len() as u16,
        compressed,
    })
}

/// Decompresses a `ReceivedCompressed` PDU's payload, validating that the
/// decompressed size matches the carried `uncompressed_len`.
pub fn decompress_received(
    uncompressed_len: u16,
    compressed: &[u8],
) -> CoreResult<Vec<u8>> {
    let decompressed = lz4_flex::block::decompress(compressed, uncompressed_len as usize)
        .map_err(|e| CoreError::Decoding(e.to_string()))?;
    if decompressed.len() != uncompressed_len as usize {
        return Err(CoreError::Decoding(format!(
            "decompressed {} bytes, expected {}",
            decompressed.len(),
            uncompressed_len
        )));
    }
    Ok(decompressed)
}
