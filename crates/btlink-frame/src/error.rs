use btlink_ring::RingError;

use crate::packet::PacketType;

/// Errors that can occur during HCI framing and control message handling.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header carries a type this side does not accept.
    #[error("unknown HCI packet type {0:#04x}")]
    UnknownPacketType(u8),

    /// The control message type is not one of the known kinds.
    #[error("unknown control message type {0:#06x}")]
    UnknownControlKind(u16),

    /// The payload exceeds what the 16-bit header length can describe.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Zero-length HCI packets are never sent.
    #[error("empty HCI payload")]
    EmptyPayload,

    /// A buffer was too short for the structure being decoded.
    #[error("truncated {what}: need {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The host had no receive buffer; the frame was drained and discarded.
    #[error("no receive buffer for {packet_type} packet ({size} bytes)")]
    BufferUnavailable { packet_type: PacketType, size: usize },

    /// The ring stayed full for the whole send timeout; nothing was written.
    #[error("ring full, frame not sent")]
    WouldBlock,

    /// The ring stopped draining part way through a frame.
    #[error("send stalled after {written} of {total} bytes")]
    Stalled { written: usize, total: usize },

    /// An error from the underlying ring channel.
    #[error("ring channel error: {0}")]
    Ring(#[from] RingError),
}

pub type Result<T> = std::result::Result<T, FrameError>;
