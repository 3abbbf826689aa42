//! The framed host⇄adapter wire protocol: `[ATT | TYP | LEN | payload]`.

mod codec;
mod types;

pub use codec::{
    decompress_received, send_compressed, ParseOutcome, Pdu, ReceivedFrame, DEFAULT_BATCH_CEILING,
    MAX_FRAME_LEN, MAX_PAYLOAD_LEN,
};
pub use types::{
    stmin_code_to_us, us_to_stmin_code, Arbitration, CanFrame, ChannelProtocol, DeviceInfo,
    PduType, SeparationTimes, ATT,
};
