use std::time::{Duration, Instant};

use btlink_ring::{RingChannel, RingError};
use bytes::BytesMut;

use crate::codec::encode_frame;
use crate::error::{FrameError, Result};
use crate::packet::PacketType;

const INITIAL_BUFFER_CAPACITY: usize = 1024;

/// Default bound on how long a send waits for ring space.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Configuration for the HCI writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Longest total wait for ring space during one send.
    pub send_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Writes complete HCI frames into the host-to-controller ring.
///
/// `send` takes `&mut self`, so a writer has exactly one caller at a time.
pub struct HciWriter {
    ring: RingChannel,
    buf: BytesMut,
    config: WriterConfig,
    frames_sent: u64,
}

impl HciWriter {
    /// Create a new writer with default configuration.
    pub fn new(ring: RingChannel) -> Self {
        Self::with_config(ring, WriterConfig::default())
    }

    /// Create a new writer with explicit configuration.
    pub fn with_config(ring: RingChannel, config: WriterConfig) -> Self {
        Self {
            ring,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
            frames_sent: 0,
        }
    }

    /// Frame and send one HCI packet, then ring the peer's doorbell.
    ///
    /// The header, payload and zero pad are written as one unit. When the
    /// whole frame fits the ring, the writer first waits until it fits, so
    /// a full ring yields [`FrameError::WouldBlock`] with nothing written.
    /// Larger frames stream through the ring and report
    /// [`FrameError::Stalled`] if the consumer stops draining.
    pub fn send(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(FrameError::EmptyPayload);
        }

        self.buf.clear();
        encode_frame(packet_type, payload, &mut self.buf)?;

        let total = self.buf.len();
        let deadline = Instant::now() + self.config.send_timeout;
        let mut written = 0usize;
        let mut want = total.min(self.ring.capacity());

        while written < total {
            if self.ring.free() < want {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match self.ring.wait_writable(want, timeout) {
                    Ok(()) => {}
                    Err(RingError::Timeout { .. }) if written == 0 => {
                        tracing::debug!(%packet_type, total, "HCI tx ring full");
                        return Err(FrameError::WouldBlock);
                    }
                    Err(RingError::Timeout { .. }) => {
                        tracing::warn!(%packet_type, written, total, "HCI tx stalled");
                        return Err(FrameError::Stalled { written, total });
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            written += self.ring.put(&self.buf[written..])?;
            want = 1;
        }

        self.ring.notify();
        self.frames_sent += 1;
        tracing::trace!(
            %packet_type,
            data = %hex::encode(payload),
            "HCI tx"
        );
        Ok(())
    }

    /// Borrow the underlying ring.
    pub fn ring(&self) -> &RingChannel {
        &self.ring
    }

    /// Frames fully written since creation.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Update the send timeout for subsequent frames.
    pub fn set_send_timeout(&mut self, send_timeout: Duration) {
        self.config.send_timeout = send_timeout;
    }

    /// Current writer configuration.
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use btlink_ring::{ChannelId, Direction, Doorbell};

    use super::*;
    use crate::codec::decode_frame;

    fn ring(capacity: usize) -> RingChannel {
        RingChannel::new(
            ChannelId::from_raw(2).unwrap(),
            Direction::ToCoprocessor,
            capacity,
            None,
        )
        .unwrap()
    }

    fn drain_all(ring: &RingChannel) -> BytesMut {
        let mut wire = BytesMut::new();
        loop {
            let chunk = ring.get(usize::MAX).unwrap();
            if chunk.is_empty() {
                return wire;
            }
            wire.extend_from_slice(&chunk);
        }
    }

    #[test]
    fn write_single_frame_padded() {
        let ring = ring(64);
        let mut writer = HciWriter::new(ring.clone());

        writer
            .send(PacketType::Command, &[0x03, 0x0c, 0x00])
            .unwrap();

        let mut wire = drain_all(&ring);
        assert_eq!(wire.len(), 8);
        let (header, body) = decode_frame(&mut wire).unwrap().unwrap();
        assert_eq!(header.length, 4);
        assert_eq!(header.packet_type, 0x01);
        assert_eq!(body.as_ref(), &[0x03, 0x0c, 0x00, 0x00]);
        assert_eq!(writer.frames_sent(), 1);
    }

    #[test]
    fn empty_payload_rejected() {
        let mut writer = HciWriter::new(ring(64));
        assert!(matches!(
            writer.send(PacketType::Acl, &[]),
            Err(FrameError::EmptyPayload)
        ));
    }

    #[test]
    fn full_ring_would_block_and_writes_nothing() {
        let ring = ring(16);
        ring.put(&[0xff; 10]).unwrap();

        let cfg = WriterConfig {
            send_timeout: Duration::from_millis(10),
        };
        let mut writer = HciWriter::with_config(ring.clone(), cfg);
        let err = writer.send(PacketType::Acl, &[1; 8]).unwrap_err();

        assert!(matches!(err, FrameError::WouldBlock));
        assert_eq!(ring.len(), 10);
    }

    #[test]
    fn frame_larger_than_ring_streams_through() {
        let ring = ring(8);
        let consumer = ring.clone();
        let payload: Vec<u8> = (0..30u8).collect();
        let expected = payload.clone();

        let reader = thread::spawn(move || {
            let mut wire = BytesMut::new();
            while wire.len() < 4 + 32 {
                let chunk = consumer.get(usize::MAX).unwrap();
                if chunk.is_empty() {
                    consumer.wait_readable(Duration::from_secs(2)).unwrap();
                } else {
                    wire.extend_from_slice(&chunk);
                }
            }
            wire
        });

        let cfg = WriterConfig {
            send_timeout: Duration::from_secs(2),
        };
        let mut writer = HciWriter::with_config(ring, cfg);
        writer.send(PacketType::Acl, &payload).unwrap();

        let mut wire = reader.join().unwrap();
        let (header, body) = decode_frame(&mut wire).unwrap().unwrap();
        assert_eq!(header.length, 32);
        assert_eq!(&body[..30], expected.as_slice());
    }

    #[test]
    fn stalled_when_consumer_stops() {
        let ring = ring(8);
        let cfg = WriterConfig {
            send_timeout: Duration::from_millis(20),
        };
        let mut writer = HciWriter::with_config(ring.clone(), cfg);

        let err = writer.send(PacketType::Acl, &[7; 20]).unwrap_err();
        match err {
            FrameError::Stalled { written, total } => {
                assert_eq!(written, 8);
                assert_eq!(total, 24);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn send_rings_doorbell() {
        let doorbell = Arc::new(Doorbell::new());
        let ring = RingChannel::new(
            ChannelId::from_raw(2).unwrap(),
            Direction::ToCoprocessor,
            64,
            Some(Arc::clone(&doorbell)),
        )
        .unwrap();

        let mut writer = HciWriter::new(ring);
        writer.send(PacketType::Acl, &[1, 0, 0, 0]).unwrap();
        assert!(doorbell.take());
    }
}
