//! Codecs for the dual-earbud (TWS) shared structures.
//!
//! [`TwsSignal`] is the per-channel timing slot shared with the
//! co-processor. [`TwsInfoHeader`] prefixes data relayed between the two
//! earbuds; its checksum and sequence number are checked leniently.

use crate::error::{FrameError, Result};

/// Packed size of [`TwsSignal`].
pub const TWS_SIGNAL_SIZE: usize = 16;

/// Packet area that follows the signal in each slot.
pub const TWS_DATA_SIZE: usize = 256;

/// Size of one shared TWS slot: signal then packet area.
pub const TWS_SLOT_SIZE: usize = TWS_SIGNAL_SIZE + TWS_DATA_SIZE;

/// Packed size of [`TwsInfoHeader`].
pub const TWS_INFO_HEADER_SIZE: usize = 11;

/// TWS timing slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TwsSignal {
    /// Bluetooth clock at the interrupt.
    pub bt_clock: u32,
    /// Offset within the clock tick.
    pub intra_offset: u16,
    /// Timer mode (microseconds or native clock).
    pub mode: u8,
    /// eSCO/ISO packet flag.
    pub flag: u8,
    /// Interrupt type.
    pub kind: u8,
    /// Interrupt acknowledgement counter.
    pub ack_count: u8,
    /// Packets written into the slot's data area.
    pub write_count: u8,
    /// Packets the other side has taken out.
    pub read_count: u8,
    pub sequence: u16,
    pub data_len: u16,
}

impl TwsSignal {
    /// True while a written packet has not been read.
    pub fn has_unread(&self) -> bool {
        self.write_count != self.read_count
    }

    pub fn encode(&self) -> [u8; TWS_SIGNAL_SIZE] {
        let mut out = [0u8; TWS_SIGNAL_SIZE];
        out[0..4].copy_from_slice(&self.bt_clock.to_le_bytes());
        out[4..6].copy_from_slice(&self.intra_offset.to_le_bytes());
        out[6] = self.mode;
        out[7] = self.flag;
        out[8] = self.kind;
        out[9] = self.ack_count;
        out[10] = self.write_count;
        out[11] = self.read_count;
        out[12..14].copy_from_slice(&self.sequence.to_le_bytes());
        out[14..16].copy_from_slice(&self.data_len.to_le_bytes());
        out
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < TWS_SIGNAL_SIZE {
            return Err(FrameError::Truncated {
                what: "TWS signal slot",
                expected: TWS_SIGNAL_SIZE,
                actual: src.len(),
            });
        }
        Ok(Self {
            bt_clock: u32::from_le_bytes([src[0], src[1], src[2], src[3]]),
            intra_offset: u16::from_le_bytes([src[4], src[5]]),
            mode: src[6],
            flag: src[7],
            kind: src[8],
            ack_count: src[9],
            write_count: src[10],
            read_count: src[11],
            sequence: u16::from_le_bytes([src[12], src[13]]),
            data_len: u16::from_le_bytes([src[14], src[15]]),
        })
    }
}

/// Header of a TWS-relayed message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TwsInfoHeader {
    pub kind: u8,
    pub cmd: u8,
    pub status: u8,
    pub fragment_count: u8,
    pub sequence: u8,
    pub checksum: u32,
    pub context_length: u16,
}

impl TwsInfoHeader {
    pub fn encode(&self) -> [u8; TWS_INFO_HEADER_SIZE] {
        let mut out = [0u8; TWS_INFO_HEADER_SIZE];
        out[0] = self.kind;
        out[1] = self.cmd;
        out[2] = self.status;
        out[3] = self.fragment_count;
        out[4] = self.sequence;
        out[5..9].copy_from_slice(&self.checksum.to_le_bytes());
        out[9..11].copy_from_slice(&self.context_length.to_le_bytes());
        out
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < TWS_INFO_HEADER_SIZE {
            return Err(FrameError::Truncated {
                what: "TWS info header",
                expected: TWS_INFO_HEADER_SIZE,
                actual: src.len(),
            });
        }
        Ok(Self {
            kind: src[0],
            cmd: src[1],
            status: src[2],
            fragment_count: src[3],
            sequence: src[4],
            checksum: u32::from_le_bytes([src[5], src[6], src[7], src[8]]),
            context_length: u16::from_le_bytes([src[9], src[10]]),
        })
    }

    /// Wrapping byte sum of the header (checksum zeroed) and `context`.
    pub fn compute_checksum(&self, context: &[u8]) -> u32 {
        let zeroed = Self {
            checksum: 0,
            ..*self
        };
        zeroed
            .encode()
            .iter()
            .chain(context)
            .fold(0u32, |sum, b| sum.wrapping_add(u32::from(*b)))
    }

    /// Build a full message: header with sequence, length and checksum
    /// filled in, followed by `context`.
    pub fn encode_message(&self, sequence: u8, context: &[u8]) -> Result<Vec<u8>> {
        let context_length =
            u16::try_from(context.len()).map_err(|_| FrameError::PayloadTooLarge {
                size: context.len(),
                max: u16::MAX as usize,
            })?;
        let mut header = Self {
            sequence,
            context_length,
            checksum: 0,
            ..*self
        };
        header.checksum = header.compute_checksum(context);

        let mut out = Vec::with_capacity(TWS_INFO_HEADER_SIZE + context.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(context);
        Ok(out)
    }

    /// Split a received message into header and context.
    ///
    /// A checksum mismatch is logged, not rejected. The context is whatever
    /// follows the header in `message`.
    pub fn decode_checked(message: &[u8]) -> Result<(Self, &[u8])> {
        let header = Self::decode(message)?;
        let context = &message[TWS_INFO_HEADER_SIZE..];
        let computed = header.compute_checksum(context);
        if computed != header.checksum {
            tracing::warn!(
                computed,
                carried = header.checksum,
                "TWS info checksum mismatch"
            );
        }
        if usize::from(header.context_length) != context.len() {
            tracing::debug!(
                declared = header.context_length,
                actual = context.len(),
                "TWS info context length differs from message"
            );
        }
        Ok((header, context))
    }
}

/// Tracks the 8-bit message counter in one direction.
///
/// Outgoing messages take `advance()`; incoming ones are checked with
/// `observe()`, which logs gaps but always resynchronises to the value seen.
#[derive(Debug, Default, Clone)]
pub struct SequenceTracker {
    last: u8,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the next sequence number.
    pub fn advance(&mut self) -> u8 {
        self.last = self.last.wrapping_add(1);
        self.last
    }

    /// Record an incoming sequence number. Returns false if it was not the
    /// expected successor.
    pub fn observe(&mut self, sequence: u8) -> bool {
        let expected = self.last.wrapping_add(1);
        self.last = sequence;
        if sequence != expected {
            tracing::warn!(expected, got = sequence, "TWS message out of sequence");
            return false;
        }
        true
    }

    pub fn last(&self) -> u8 {
        self.last
    }
}
