//! HCI framing and control messages over btlink ring channels.
//!
//! Every HCI packet crossing the ring is framed with a 4-byte header:
//! - A 2-byte little-endian length (payload rounded up to 4 bytes)
//! - A 1-byte HCI packet type
//! - A reserved byte
//!
//! [`HciReassembler`] rebuilds packets from arbitrarily chunked ring reads;
//! [`HciWriter`] pushes whole frames with bounded waits. The control channel
//! carries fixed 20-byte [`ControlMessage`] records, and [`tws`] holds the
//! codecs for the dual-earbud signal slot and info header.

pub mod codec;
pub mod control;
pub mod error;
pub mod packet;
pub mod reader;
pub mod tws;
pub mod writer;

pub use codec::{decode_frame, encode_frame, padded_len, HciHeader, HEADER_SIZE, MAX_PAYLOAD};
pub use control::{
    ControlKind, ControlLink, ControlMessage, FragmentAssembler, CONTROL_MESSAGE_SIZE,
    CONTROL_PAYLOAD_SIZE,
};
pub use error::{FrameError, Result};
pub use packet::{packet_len, BufferRequest, HciPacket, PacketType, MAX_L2CAP_SDU};
pub use reader::{HciReassembler, Step};
pub use tws::{
    SequenceTracker, TwsInfoHeader, TwsSignal, TWS_DATA_SIZE, TWS_INFO_HEADER_SIZE,
    TWS_SIGNAL_SIZE, TWS_SLOT_SIZE,
};
pub use writer::{HciWriter, WriterConfig};
