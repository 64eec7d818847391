use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::packet::PacketType;

/// Frame header: length (2) + type (1) + reserved (1) = 4 bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest payload whose padded length still fits the 16-bit header field.
pub const MAX_PAYLOAD: usize = u16::MAX as usize & !3;

/// Payload length rounded up to a multiple of 4.
pub const fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// HCI frame header as it sits in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HciHeader {
    /// Body bytes following the header, padding included.
    pub length: u16,
    /// Raw HCI packet type.
    pub packet_type: u8,
    pub reserved: u8,
}

impl HciHeader {
    /// Header for a payload of `len` bytes, with the length padded to 4.
    pub fn for_payload(packet_type: PacketType, len: usize) -> Result<Self> {
        if len > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self {
            length: padded_len(len) as u16,
            packet_type: packet_type.as_u8(),
            reserved: 0,
        })
    }

    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let len = self.length.to_le_bytes();
        [len[0], len[1], self.packet_type, self.reserved]
    }

    pub fn from_bytes(raw: [u8; HEADER_SIZE]) -> Self {
        Self {
            length: u16::from_le_bytes([raw[0], raw[1]]),
            packet_type: raw[2],
            reserved: raw[3],
        }
    }

    pub fn packet_type(&self) -> Result<PacketType> {
        PacketType::try_from(self.packet_type)
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌─────────────┬─────────┬──────────┬───────────────────┬─────────┐
/// │ Length      │ Type    │ Reserved │ Payload           │ Pad     │
/// │ (2B LE)     │ (1B)    │ (1B)     │ (n bytes)         │ (0..3)  │
/// └─────────────┴─────────┴──────────┴───────────────────┴─────────┘
/// ```
/// `Length` covers payload and pad.
pub fn encode_frame(packet_type: PacketType, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let header = HciHeader::for_payload(packet_type, payload.len())?;
    let pad = usize::from(header.length) - payload.len();
    dst.reserve(HEADER_SIZE + usize::from(header.length));
    dst.put_slice(&header.to_bytes());
    dst.put_slice(payload);
    dst.put_bytes(0, pad);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// The returned body still carries the pad bytes; the inner HCI header says
/// how many of them are real.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<(HciHeader, Bytes)>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = HciHeader::from_bytes([src[0], src[1], src[2], src[3]]);
    let total = HEADER_SIZE + usize::from(header.length);
    if src.len() < total {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let body = src.split_to(usize::from(header.length)).freeze();
    Ok(Some((header, body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_length_is_padded() {
        let mut buf = BytesMut::new();
        encode_frame(PacketType::Command, &[0x03, 0x0c, 0x00], &mut buf).unwrap();

        assert_eq!(buf.len(), HEADER_SIZE + 4);
        assert_eq!(&buf[..4], &[4, 0, 0x01, 0]);
        assert_eq!(&buf[4..], &[0x03, 0x0c, 0x00, 0x00]);
    }

    #[test]
    fn aligned_payload_gets_no_pad() {
        let mut buf = BytesMut::new();
        encode_frame(PacketType::Acl, &[1, 2, 3, 4, 5, 6, 7, 8], &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 8);
    }

    #[test]
    fn decode_keeps_padding() {
        let mut buf = BytesMut::new();
        encode_frame(PacketType::Event, &[0x0e, 0x01, 0x05], &mut buf).unwrap();
        encode_frame(PacketType::Acl, &[0x01, 0x20, 0x00, 0x00], &mut buf).unwrap();

        let (h1, b1) = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(h1.packet_type().unwrap(), PacketType::Event);
        assert_eq!(b1.as_ref(), &[0x0e, 0x01, 0x05, 0x00]);

        let (h2, b2) = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(h2.packet_type().unwrap(), PacketType::Acl);
        assert_eq!(b2.len(), 4);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_incomplete() {
        let mut buf = BytesMut::from(&[8u8, 0, 2][..]);
        assert!(decode_frame(&mut buf).unwrap().is_none());

        let mut buf = BytesMut::from(&[8u8, 0, 2, 0, 1, 2][..]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn payload_too_large() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        let mut buf = BytesMut::new();
        let err = encode_frame(PacketType::Acl, &payload, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }
}
