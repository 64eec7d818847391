use std::fmt;
use std::time::Duration;

use btlink_ring::{RingChannel, RingError};

use crate::error::{FrameError, Result};

/// Control record: type (2) + fragment (2) + payload (16) = 20 bytes.
pub const CONTROL_MESSAGE_SIZE: usize = 20;

/// Payload bytes carried by one control record.
pub const CONTROL_PAYLOAD_SIZE: usize = 16;

/// Known control message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ControlKind {
    /// Device address, sent first in the handshake.
    Init = 0x01,
    /// HCI rx, HCI tx and log channel ids.
    HciBuffers = 0x02,
    /// TWS rx/tx slot ids for both channels.
    TwsBuffers = 0x03,
    /// Co-processor is up and serving HCI.
    HciReady = 0x04,
    /// Route controller logs to the log channel.
    LogOn = 0x05,
    /// Route controller logs to its UART.
    LogOff = 0x06,
    GenP192PublicKey = 0x10,
    GenP192DhKey = 0x11,
    GenP256PublicKey = 0x12,
    GenP256DhKey = 0x13,
}

impl ControlKind {
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::HciBuffers => "HCI_BUFFERS",
            Self::TwsBuffers => "TWS_BUFFERS",
            Self::HciReady => "HCI_READY",
            Self::LogOn => "LOG_ON",
            Self::LogOff => "LOG_OFF",
            Self::GenP192PublicKey => "GEN_P192_PK",
            Self::GenP192DhKey => "GEN_P192_DHKEY",
            Self::GenP256PublicKey => "GEN_P256_PK",
            Self::GenP256DhKey => "GEN_P256_DHKEY",
        }
    }
}

impl TryFrom<u16> for ControlKind {
    type Error = FrameError;

    fn try_from(raw: u16) -> std::result::Result<Self, Self::Error> {
        Ok(match raw {
            0x01 => Self::Init,
            0x02 => Self::HciBuffers,
            0x03 => Self::TwsBuffers,
            0x04 => Self::HciReady,
            0x05 => Self::LogOn,
            0x06 => Self::LogOff,
            0x10 => Self::GenP192PublicKey,
            0x11 => Self::GenP192DhKey,
            0x12 => Self::GenP256PublicKey,
            0x13 => Self::GenP256DhKey,
            other => return Err(FrameError::UnknownControlKind(other)),
        })
    }
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-size control record.
///
/// The payload is read either as four little-endian `u32` words or as raw
/// bytes, depending on the message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub kind: u16,
    pub fragment: u16,
    pub payload: [u8; CONTROL_PAYLOAD_SIZE],
}

impl ControlMessage {
    pub fn new(kind: ControlKind, fragment: u16) -> Self {
        Self {
            kind: kind.as_u16(),
            fragment,
            payload: [0; CONTROL_PAYLOAD_SIZE],
        }
    }

    pub fn from_words(kind: ControlKind, fragment: u16, words: [u32; 4]) -> Self {
        let mut msg = Self::new(kind, fragment);
        for (i, word) in words.into_iter().enumerate() {
            msg.set_word(i, word);
        }
        msg
    }

    /// Message with raw payload bytes, zero padded. Extra bytes are an error.
    pub fn from_bytes(kind: ControlKind, fragment: u16, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > CONTROL_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                size: bytes.len(),
                max: CONTROL_PAYLOAD_SIZE,
            });
        }
        let mut msg = Self::new(kind, fragment);
        msg.payload[..bytes.len()].copy_from_slice(bytes);
        Ok(msg)
    }

    pub fn control_kind(&self) -> Result<ControlKind> {
        ControlKind::try_from(self.kind)
    }

    /// Payload word `index` (0..4).
    pub fn word(&self, index: usize) -> u32 {
        let at = index * 4;
        u32::from_le_bytes([
            self.payload[at],
            self.payload[at + 1],
            self.payload[at + 2],
            self.payload[at + 3],
        ])
    }

    pub fn words(&self) -> [u32; 4] {
        [self.word(0), self.word(1), self.word(2), self.word(3)]
    }

    pub fn set_word(&mut self, index: usize, value: u32) {
        let at = index * 4;
        self.payload[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn encode(&self) -> [u8; CONTROL_MESSAGE_SIZE] {
        let mut out = [0u8; CONTROL_MESSAGE_SIZE];
        out[0..2].copy_from_slice(&self.kind.to_le_bytes());
        out[2..4].copy_from_slice(&self.fragment.to_le_bytes());
        out[4..].copy_from_slice(&self.payload);
        out
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < CONTROL_MESSAGE_SIZE {
            return Err(FrameError::Truncated {
                what: "control message",
                expected: CONTROL_MESSAGE_SIZE,
                actual: src.len(),
            });
        }
        let mut payload = [0u8; CONTROL_PAYLOAD_SIZE];
        payload.copy_from_slice(&src[4..CONTROL_MESSAGE_SIZE]);
        Ok(Self {
            kind: u16::from_le_bytes([src[0], src[1]]),
            fragment: u16::from_le_bytes([src[2], src[3]]),
            payload,
        })
    }

    /// Split `data` into fragments 1..=n of `kind`, 16 bytes each.
    pub fn fragments(kind: ControlKind, data: &[u8]) -> Vec<ControlMessage> {
        data.chunks(CONTROL_PAYLOAD_SIZE)
            .enumerate()
            .map(|(i, chunk)| {
                let mut msg = ControlMessage::new(kind, (i + 1) as u16);
                msg.payload[..chunk.len()].copy_from_slice(chunk);
                msg
            })
            .collect()
    }
}

/// Collects a multi-fragment payload of known length.
///
/// Fragment indices are expected to count up from 1. A gap or repeat is
/// logged and the data is appended anyway; the fixed length decides when
/// the payload is complete.
#[derive(Debug)]
pub struct FragmentAssembler {
    kind: ControlKind,
    expected_len: usize,
    next_fragment: u16,
    data: Vec<u8>,
}

impl FragmentAssembler {
    pub fn new(kind: ControlKind, expected_len: usize) -> Self {
        Self {
            kind,
            expected_len,
            next_fragment: 1,
            data: Vec::with_capacity(expected_len),
        }
    }

    /// True if `msg` has the type being assembled.
    pub fn accepts(&self, msg: &ControlMessage) -> bool {
        msg.kind == self.kind.as_u16()
    }

    /// Append one fragment. Returns true once `expected_len` bytes are held.
    pub fn push(&mut self, msg: &ControlMessage) -> bool {
        if msg.kind != self.kind.as_u16() {
            tracing::warn!(
                expected = %self.kind,
                got = msg.kind,
                "control fragment of a different type"
            );
        }
        if msg.fragment != self.next_fragment {
            tracing::warn!(
                kind = %self.kind,
                expected = self.next_fragment,
                got = msg.fragment,
                "control fragment out of sequence"
            );
        }
        self.next_fragment = msg.fragment.wrapping_add(1);

        let take = self
            .expected_len
            .saturating_sub(self.data.len())
            .min(CONTROL_PAYLOAD_SIZE);
        self.data.extend_from_slice(&msg.payload[..take]);
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.data.len() >= self.expected_len
    }

    pub fn received(&self) -> usize {
        self.data.len()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Pair of control rings seen from one side.
///
/// Both the driver and the simulated co-processor use this, with the rings
/// swapped.
#[derive(Debug, Clone)]
pub struct ControlLink {
    tx: RingChannel,
    rx: RingChannel,
    send_timeout: Duration,
}

impl ControlLink {
    pub fn new(tx: RingChannel, rx: RingChannel, send_timeout: Duration) -> Self {
        Self {
            tx,
            rx,
            send_timeout,
        }
    }

    pub fn tx(&self) -> &RingChannel {
        &self.tx
    }

    pub fn rx(&self) -> &RingChannel {
        &self.rx
    }

    /// Write one record without ringing the doorbell.
    pub fn post(&self, msg: &ControlMessage) -> Result<()> {
        let record = msg.encode();
        loop {
            if self.tx.write_record(&record)? {
                tracing::trace!(kind = msg.kind, fragment = msg.fragment, "control tx");
                return Ok(());
            }
            match self.tx.wait_writable(CONTROL_MESSAGE_SIZE, self.send_timeout) {
                Ok(()) => {}
                Err(RingError::Timeout { .. }) => return Err(FrameError::WouldBlock),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Write one record and ring the peer's doorbell.
    pub fn send(&self, msg: &ControlMessage) -> Result<()> {
        self.post(msg)?;
        self.tx.notify();
        Ok(())
    }

    /// Write several records, ringing the doorbell once at the end.
    pub fn send_all(&self, msgs: &[ControlMessage]) -> Result<()> {
        for msg in msgs {
            self.post(msg)?;
        }
        self.tx.notify();
        Ok(())
    }

    /// Read one record if a whole one is queued.
    pub fn try_recv(&self) -> Result<Option<ControlMessage>> {
        let mut record = [0u8; CONTROL_MESSAGE_SIZE];
        if !self.rx.read_record(&mut record)? {
            return Ok(None);
        }
        let msg = ControlMessage::decode(&record)?;
        tracing::trace!(kind = msg.kind, fragment = msg.fragment, "control rx");
        Ok(Some(msg))
    }

    /// Wait up to `timeout` for a whole record.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<ControlMessage>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(msg) = self.try_recv()? {
                return Ok(Some(msg));
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.rx.wait_readable(remaining) {
                Ok(()) => {
                    // A partial record wakes us too; give the producer a
                    // moment to finish it.
                    if self.rx.len() < CONTROL_MESSAGE_SIZE {
                        std::thread::sleep(Duration::from_micros(50));
                    }
                }
                Err(RingError::Timeout { .. }) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// True if at least one whole record is queued.
    pub fn pending(&self) -> bool {
        !self.rx.is_closed() && self.rx.len() >= CONTROL_MESSAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use btlink_ring::{ChannelId, Direction};

    use super::*;

    fn link() -> (ControlLink, ControlLink) {
        let a = RingChannel::new(
            ChannelId::from_raw(1).unwrap(),
            Direction::ToCoprocessor,
            CONTROL_MESSAGE_SIZE * 4,
            None,
        )
        .unwrap();
        let b = RingChannel::new(
            ChannelId::from_raw(2).unwrap(),
            Direction::FromCoprocessor,
            CONTROL_MESSAGE_SIZE * 4,
            None,
        )
        .unwrap();
        let timeout = Duration::from_millis(20);
        (
            ControlLink::new(a.clone(), b.clone(), timeout),
            ControlLink::new(b, a, timeout),
        )
    }

    #[test]
    fn encode_layout() {
        let msg = ControlMessage::from_words(ControlKind::HciBuffers, 0, [3, 4, 5, 0]);
        let raw = msg.encode();
        assert_eq!(&raw[..4], &[0x02, 0x00, 0x00, 0x00]);
        assert_eq!(&raw[4..8], &[3, 0, 0, 0]);
        assert_eq!(&raw[12..16], &[5, 0, 0, 0]);

        let decoded = ControlMessage::decode(&raw).unwrap();
        assert_eq!(decoded.words(), [3, 4, 5, 0]);
        assert_eq!(decoded.control_kind().unwrap(), ControlKind::HciBuffers);
    }

    #[test]
    fn negative_status_word() {
        let mut msg = ControlMessage::new(ControlKind::GenP256DhKey, 0);
        msg.set_word(0, (-1i32) as u32);
        assert_eq!(msg.word(0) as i32, -1);
    }

    #[test]
    fn unknown_kind() {
        let msg = ControlMessage {
            kind: 0x7f,
            fragment: 0,
            payload: [0; CONTROL_PAYLOAD_SIZE],
        };
        assert!(matches!(
            msg.control_kind(),
            Err(FrameError::UnknownControlKind(0x7f))
        ));
    }

    #[test]
    fn decode_short_buffer() {
        assert!(matches!(
            ControlMessage::decode(&[0; 10]),
            Err(FrameError::Truncated { actual: 10, .. })
        ));
    }

    #[test]
    fn from_bytes_bounds() {
        assert!(ControlMessage::from_bytes(ControlKind::Init, 0, &[0; 17]).is_err());
        let msg = ControlMessage::from_bytes(ControlKind::Init, 0, &[1, 2]).unwrap();
        assert_eq!(&msg.payload[..3], &[1, 2, 0]);
    }

    #[test]
    fn fragments_and_reassembly() {
        let data: Vec<u8> = (0..76u8).collect();
        let frags = ControlMessage::fragments(ControlKind::GenP192DhKey, &data);
        assert_eq!(frags.len(), 5);
        assert_eq!(frags[0].fragment, 1);
        assert_eq!(frags[4].fragment, 5);

        let mut asm = FragmentAssembler::new(ControlKind::GenP192DhKey, data.len());
        for (i, frag) in frags.iter().enumerate() {
            let done = asm.push(frag);
            assert_eq!(done, i == frags.len() - 1);
        }
        assert_eq!(asm.into_data(), data);
    }

    #[test]
    fn out_of_sequence_fragment_still_collected() {
        let mut asm = FragmentAssembler::new(ControlKind::GenP256DhKey, 32);
        let mut second = ControlMessage::new(ControlKind::GenP256DhKey, 2);
        second.payload = [2; CONTROL_PAYLOAD_SIZE];
        let mut first = ControlMessage::new(ControlKind::GenP256DhKey, 1);
        first.payload = [1; CONTROL_PAYLOAD_SIZE];

        assert!(!asm.push(&second));
        assert!(asm.push(&first));
        assert_eq!(asm.received(), 32);
    }

    #[test]
    fn assembler_accepts_only_its_type() {
        let asm = FragmentAssembler::new(ControlKind::GenP192DhKey, 76);
        assert!(asm.accepts(&ControlMessage::new(ControlKind::GenP192DhKey, 1)));
        assert!(!asm.accepts(&ControlMessage::new(ControlKind::HciReady, 0)));
    }

    #[test]
    fn link_roundtrip() {
        let (host, peer) = link();
        let msg = ControlMessage::from_words(ControlKind::Init, 0, [1, 2, 0, 0]);
        host.send(&msg).unwrap();

        assert!(peer.pending());
        assert_eq!(peer.try_recv().unwrap(), Some(msg));
        assert_eq!(peer.try_recv().unwrap(), None);
    }

    #[test]
    fn link_full_would_block() {
        let (host, _peer) = link();
        let msg = ControlMessage::new(ControlKind::LogOff, 0);
        for _ in 0..4 {
            host.post(&msg).unwrap();
        }
        assert!(matches!(host.post(&msg), Err(FrameError::WouldBlock)));
    }

    #[test]
    fn recv_timeout_expires() {
        let (_host, peer) = link();
        let got = peer.recv_timeout(Duration::from_millis(10)).unwrap();
        assert!(got.is_none());
    }
}
