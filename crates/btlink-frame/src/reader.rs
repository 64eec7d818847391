use btlink_ring::RingChannel;
use bytes::BytesMut;

use crate::codec::{HciHeader, HEADER_SIZE};
use crate::error::{FrameError, Result};
use crate::packet::{size_packet, sizing_prefix_len, BufferRequest, HciPacket, PacketType};

/// Longest inner-header prefix staged before a buffer is requested.
const MAX_STAGED: usize = 6;

/// Outcome of one [`HciReassembler::step`].
#[derive(Debug)]
pub enum Step {
    /// The ring ran dry before a frame completed.
    NeedMore,
    /// A complete packet, pad bytes stripped.
    Delivered(HciPacket),
    /// A complete frame was drained and discarded.
    Dropped(FrameError),
}

enum Sink {
    Sizing,
    Buffer {
        packet_type: PacketType,
        buf: BytesMut,
        packet_len: usize,
    },
    Discard(FrameError),
}

impl Sink {
    fn write(&mut self, data: &[u8]) {
        if let Sink::Buffer {
            buf, packet_len, ..
        } = self
        {
            // Pad bytes and anything past the inner length are drained only.
            let take = packet_len.saturating_sub(buf.len()).min(data.len());
            buf.extend_from_slice(&data[..take]);
        }
    }
}

struct Body {
    header: HciHeader,
    packet_type: Option<PacketType>,
    remaining: usize,
    staged: [u8; MAX_STAGED],
    staged_len: usize,
    sink: Sink,
}

impl Body {
    fn new(header: HciHeader) -> Self {
        let (packet_type, sink) = match header.packet_type() {
            // The controller never sends commands.
            Ok(PacketType::Command) | Err(_) => {
                tracing::warn!(
                    packet_type = header.packet_type,
                    length = header.length,
                    "dropping frame with unexpected packet type"
                );
                (
                    None,
                    Sink::Discard(FrameError::UnknownPacketType(header.packet_type)),
                )
            }
            Ok(packet_type) => (Some(packet_type), Sink::Sizing),
        };
        Self {
            header,
            packet_type,
            remaining: usize::from(header.length),
            staged: [0; MAX_STAGED],
            staged_len: 0,
            sink,
        }
    }

    fn is_sizing(&self) -> bool {
        matches!(self.sink, Sink::Sizing)
    }

    fn consume<F>(&mut self, mut data: &[u8], alloc: &mut F)
    where
        F: FnMut(&BufferRequest) -> Option<BytesMut>,
    {
        if let (true, Some(packet_type)) = (self.is_sizing(), self.packet_type) {
            let declared = usize::from(self.header.length);
            loop {
                let target = sizing_prefix_len(packet_type, &self.staged[..self.staged_len])
                    .min(declared);
                if self.staged_len >= target {
                    break;
                }
                if data.is_empty() {
                    return;
                }
                let take = (target - self.staged_len).min(data.len());
                self.staged[self.staged_len..self.staged_len + take]
                    .copy_from_slice(&data[..take]);
                self.staged_len += take;
                data = &data[take..];
            }
            self.open(packet_type, alloc);
        }
        self.sink.write(data);
    }

    fn open<F>(&mut self, packet_type: PacketType, alloc: &mut F)
    where
        F: FnMut(&BufferRequest) -> Option<BytesMut>,
    {
        let prefix = &self.staged[..self.staged_len];
        self.sink = match size_packet(packet_type, prefix) {
            None => Sink::Discard(FrameError::Truncated {
                what: "HCI inner header",
                expected: packet_type.inner_header_len(),
                actual: prefix.len(),
            }),
            Some(request) => match alloc(&request) {
                Some(mut buf) => {
                    buf.clear();
                    buf.reserve(request.packet_len);
                    Sink::Buffer {
                        packet_type,
                        buf,
                        packet_len: request.packet_len,
                    }
                }
                None => Sink::Discard(FrameError::BufferUnavailable {
                    packet_type,
                    size: request.size,
                }),
            },
        };
        let staged = self.staged;
        self.sink.write(&staged[..self.staged_len]);
    }
}

enum State {
    AwaitingHeader {
        raw: [u8; HEADER_SIZE],
        filled: usize,
    },
    AwaitingBody(Box<Body>),
}

impl State {
    fn idle() -> Self {
        State::AwaitingHeader {
            raw: [0; HEADER_SIZE],
            filled: 0,
        }
    }
}

/// Rebuilds HCI packets from the controller-to-host ring.
///
/// Bytes may arrive in any chunking; the reassembler keeps its cursor
/// across calls. The header length is the only authority for how many body
/// bytes belong to a frame, so a dropped frame never desynchronises the
/// stream.
pub struct HciReassembler {
    state: State,
    delivered: u64,
    dropped: u64,
}

impl Default for HciReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl HciReassembler {
    pub fn new() -> Self {
        Self {
            state: State::idle(),
            delivered: 0,
            dropped: 0,
        }
    }

    /// True when no frame is partially collected.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::AwaitingHeader { filled: 0, .. })
    }

    /// Forget any partially collected frame.
    pub fn reset(&mut self) {
        self.state = State::idle();
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Run one reassembly unit: header then body, until a frame completes or
    /// the ring runs dry.
    ///
    /// `alloc` is asked for a destination buffer once the inner HCI header
    /// is known. Returning `None` drains the frame in discard mode.
    pub fn step<F>(&mut self, ring: &RingChannel, mut alloc: F) -> Result<Step>
    where
        F: FnMut(&BufferRequest) -> Option<BytesMut>,
    {
        loop {
            let body = match &mut self.state {
                State::AwaitingHeader { raw, filled } => {
                    let n = ring.get_into(&mut raw[*filled..])?;
                    if n == 0 {
                        return Ok(Step::NeedMore);
                    }
                    *filled += n;
                    if *filled == HEADER_SIZE {
                        let header = HciHeader::from_bytes(*raw);
                        tracing::trace!(
                            length = header.length,
                            packet_type = header.packet_type,
                            "HCI frame header"
                        );
                        self.state = State::AwaitingBody(Box::new(Body::new(header)));
                    }
                    continue;
                }
                State::AwaitingBody(body) => body,
            };

            if body.remaining > 0 {
                let Some(claim) = ring.get_claim(body.remaining)? else {
                    return Ok(Step::NeedMore);
                };
                let n = claim.len();
                body.consume(claim.as_slice(), &mut alloc);
                claim.commit(n);
                body.remaining -= n;
                continue;
            }

            if let State::AwaitingBody(body) = std::mem::replace(&mut self.state, State::idle()) {
                return Ok(self.finish(*body, &mut alloc));
            }
        }
    }

    fn finish<F>(&mut self, mut body: Body, alloc: &mut F) -> Step
    where
        F: FnMut(&BufferRequest) -> Option<BytesMut>,
    {
        if let (true, Some(packet_type)) = (body.is_sizing(), body.packet_type) {
            body.open(packet_type, alloc);
        }

        match body.sink {
            Sink::Buffer {
                packet_type,
                buf,
                packet_len,
            } => {
                if buf.len() < packet_len {
                    tracing::warn!(
                        %packet_type,
                        got = buf.len(),
                        expected = packet_len,
                        "HCI frame shorter than its inner header"
                    );
                }
                self.delivered += 1;
                let packet = HciPacket::new(packet_type, buf.freeze());
                tracing::trace!(
                    packet_type = %packet.packet_type,
                    data = %hex::encode(&packet.data),
                    "HCI rx"
                );
                Step::Delivered(packet)
            }
            Sink::Discard(err) => {
                self.dropped += 1;
                tracing::warn!(error = %err, length = body.header.length, "HCI frame dropped");
                Step::Dropped(err)
            }
            Sink::Sizing => {
                self.dropped += 1;
                Step::Dropped(FrameError::UnknownPacketType(body.header.packet_type))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use btlink_ring::{ChannelId, Direction};

    use super::*;
    use crate::codec::encode_frame;

    fn ring(capacity: usize) -> RingChannel {
        RingChannel::new(
            ChannelId::from_raw(1).unwrap(),
            Direction::FromCoprocessor,
            capacity,
            None,
        )
        .unwrap()
    }

    fn frame(packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(packet_type, payload, &mut buf).unwrap();
        buf.to_vec()
    }

    fn any_buffer(req: &BufferRequest) -> Option<BytesMut> {
        Some(BytesMut::with_capacity(req.size))
    }

    fn step(reader: &mut HciReassembler, ring: &RingChannel) -> Step {
        reader.step(ring, any_buffer).unwrap()
    }

    #[test]
    fn event_delivered_without_padding() {
        let ring = ring(64);
        let event = [0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00];
        ring.put(&frame(PacketType::Event, &event)).unwrap();

        let mut reader = HciReassembler::new();
        match step(&mut reader, &ring) {
            Step::Delivered(packet) => {
                assert_eq!(packet.packet_type, PacketType::Event);
                assert_eq!(packet.data.as_ref(), &event);
                assert_eq!(packet.event_code(), Some(0x0e));
            }
            other => panic!("unexpected step: {other:?}"),
        }
        assert!(ring.is_empty());
        assert!(reader.is_idle());
    }

    #[test]
    fn chunking_does_not_change_delivery() {
        let acl = [0x01, 0x20, 0x07, 0x00, 0x03, 0x00, 0x40, 0x00, 0xaa, 0xbb, 0xcc];
        let wire = frame(PacketType::Acl, &acl);

        for split in 1..wire.len() {
            let ring = ring(64);
            let mut reader = HciReassembler::new();
            let mut delivered = Vec::new();

            for chunk in wire.chunks(split) {
                ring.put(chunk).unwrap();
                loop {
                    match step(&mut reader, &ring) {
                        Step::NeedMore => break,
                        Step::Delivered(packet) => delivered.push(packet),
                        Step::Dropped(err) => panic!("dropped at split {split}: {err}"),
                    }
                }
            }

            assert_eq!(delivered.len(), 1, "split {split}");
            assert_eq!(delivered[0].data.as_ref(), &acl);
        }
    }

    #[test]
    fn back_to_back_frames() {
        let ring = ring(128);
        ring.put(&frame(PacketType::Event, &[0x13, 0x01, 0x01])).unwrap();
        ring.put(&frame(PacketType::Sco, &[0x01, 0x00, 0x02, 0x55, 0x66]))
            .unwrap();

        let mut reader = HciReassembler::new();
        let first = step(&mut reader, &ring);
        let second = step(&mut reader, &ring);
        assert!(matches!(first, Step::Delivered(ref p) if p.packet_type == PacketType::Event));
        match second {
            Step::Delivered(packet) => {
                assert_eq!(packet.packet_type, PacketType::Sco);
                assert_eq!(packet.data.as_ref(), &[0x01, 0x00, 0x02, 0x55, 0x66]);
            }
            other => panic!("unexpected step: {other:?}"),
        }
        assert!(matches!(step(&mut reader, &ring), Step::NeedMore));
        assert_eq!(reader.delivered(), 2);
    }

    #[test]
    fn acl_start_requests_sdu_sized_buffer() {
        let ring = ring(64);
        // HCI length 8, embedded L2CAP length 300.
        let acl = [0x01, 0x20, 0x08, 0x00, 0x2c, 0x01, 0x40, 0x00, 1, 2, 3, 4];
        ring.put(&frame(PacketType::Acl, &acl)).unwrap();

        let mut requested = Vec::new();
        let mut reader = HciReassembler::new();
        let step = reader
            .step(&ring, |req| {
                requested.push(*req);
                Some(BytesMut::with_capacity(req.size))
            })
            .unwrap();

        assert!(matches!(step, Step::Delivered(_)));
        assert_eq!(requested.len(), 1);
        assert_eq!(requested[0].size, 308);
        assert_eq!(requested[0].packet_len, 12);
    }

    #[test]
    fn missing_buffer_drops_frame_and_keeps_sync() {
        let ring = ring(128);
        ring.put(&frame(PacketType::Event, &[0x0e, 0x01, 0x00])).unwrap();
        ring.put(&frame(PacketType::Event, &[0x0f, 0x01, 0x00])).unwrap();

        let mut reader = HciReassembler::new();
        let first = reader.step(&ring, |_| None).unwrap();
        match first {
            Step::Dropped(FrameError::BufferUnavailable { packet_type, size }) => {
                assert_eq!(packet_type, PacketType::Event);
                assert_eq!(size, 3);
            }
            other => panic!("unexpected step: {other:?}"),
        }

        match step(&mut reader, &ring) {
            Step::Delivered(packet) => assert_eq!(packet.event_code(), Some(0x0f)),
            other => panic!("unexpected step: {other:?}"),
        }
        assert_eq!(reader.dropped(), 1);
    }

    #[test]
    fn unknown_type_drained() {
        let ring = ring(64);
        ring.put(&[4, 0, 0x09, 0, 1, 2, 3, 4]).unwrap();
        ring.put(&frame(PacketType::Event, &[0x05, 0x00])).unwrap();

        let mut reader = HciReassembler::new();
        assert!(matches!(
            step(&mut reader, &ring),
            Step::Dropped(FrameError::UnknownPacketType(0x09))
        ));
        assert!(matches!(step(&mut reader, &ring), Step::Delivered(_)));
    }

    #[test]
    fn command_from_controller_is_dropped() {
        let ring = ring(64);
        ring.put(&frame(PacketType::Command, &[0x03, 0x0c, 0x00]))
            .unwrap();

        let mut reader = HciReassembler::new();
        assert!(matches!(
            step(&mut reader, &ring),
            Step::Dropped(FrameError::UnknownPacketType(0x01))
        ));
        assert!(ring.is_empty());
    }

    #[test]
    fn body_shorter_than_inner_header_is_dropped() {
        let ring = ring(64);
        // SCO needs 3 bytes of inner header; the frame declares zero.
        ring.put(&[0, 0, 0x03, 0]).unwrap();

        let mut reader = HciReassembler::new();
        assert!(matches!(
            step(&mut reader, &ring),
            Step::Dropped(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn wraparound_frame() {
        let ring = ring(16);
        // Move the cursors near the end of the storage.
        ring.put(&[0; 12]).unwrap();
        ring.get(12).unwrap();

        let event = [0x0e, 0x03, 0x01, 0x02, 0x03];
        for chunk in frame(PacketType::Event, &event).chunks(4) {
            let mut offset = 0;
            while offset < chunk.len() {
                offset += ring.put(&chunk[offset..]).unwrap();
            }
        }

        let mut reader = HciReassembler::new();
        match step(&mut reader, &ring) {
            Step::Delivered(packet) => assert_eq!(packet.data.as_ref(), &event),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn reset_forgets_partial_frame() {
        let ring = ring(64);
        ring.put(&[8, 0, 0x04]).unwrap();

        let mut reader = HciReassembler::new();
        assert!(matches!(step(&mut reader, &ring), Step::NeedMore));
        assert!(!reader.is_idle());

        reader.reset();
        ring.reset();
        ring.put(&frame(PacketType::Event, &[0x0e, 0x00])).unwrap();
        assert!(matches!(step(&mut reader, &ring), Step::Delivered(_)));
    }
}
