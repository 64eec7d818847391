use std::thread;
use std::time::{Duration, Instant};

use btlink_ring::SharedBlock;
use parking_lot::Mutex;

use crate::error::{DriverError, Result};

/// Size of the shared mailbox block.
pub const MAILBOX_SIZE: usize = 16;

/// Marks an initialised mailbox.
pub const MAILBOX_MAGIC: u8 = 0xcc;

/// Request state in the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxStatus {
    Idle = 0,
    New = 1,
    Complete = 2,
}

impl MailboxStatus {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Self::Idle),
            1 => Some(Self::New),
            2 => Some(Self::Complete),
            _ => None,
        }
    }
}

/// Synchronous request word layout.
///
/// Wire format (LE words):
/// ```text
/// ┌──────────────────────────────────────────┬────────┬────────┬────────┐
/// │ word 0                                   │ result │ param1 │ param2 │
/// │ magic:8 | status:2 | flags:14 | msg_id:8 │ (i32)  │ (u32)  │ (u32)  │
/// └──────────────────────────────────────────┴────────┴────────┴────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxFrame {
    pub status: MailboxStatus,
    pub flags: u16,
    pub msg_id: u8,
    pub result: i32,
    pub param1: u32,
    pub param2: u32,
}

impl MailboxFrame {
    pub fn request(msg_id: u8, param1: u32, param2: u32) -> Self {
        Self {
            status: MailboxStatus::New,
            flags: 0,
            msg_id,
            result: 0,
            param1,
            param2,
        }
    }

    pub fn encode(&self) -> [u8; MAILBOX_SIZE] {
        let word0 = u32::from(MAILBOX_MAGIC)
            | ((self.status as u32) << 8)
            | ((u32::from(self.flags) & 0x3fff) << 10)
            | (u32::from(self.msg_id) << 24);
        let mut out = [0u8; MAILBOX_SIZE];
        out[0..4].copy_from_slice(&word0.to_le_bytes());
        out[4..8].copy_from_slice(&self.result.to_le_bytes());
        out[8..12].copy_from_slice(&self.param1.to_le_bytes());
        out[12..16].copy_from_slice(&self.param2.to_le_bytes());
        out
    }

    /// `None` unless the block carries the magic and a known status.
    pub fn decode(src: &[u8]) -> Option<Self> {
        let word = |i: usize| {
            src.get(i * 4..i * 4 + 4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        };
        let word0 = word(0)?;
        if word0 & 0xff != u32::from(MAILBOX_MAGIC) {
            return None;
        }
        Some(Self {
            status: MailboxStatus::from_bits((word0 >> 8) & 0x3)?,
            flags: ((word0 >> 10) & 0x3fff) as u16,
            msg_id: (word0 >> 24) as u8,
            result: word(1)? as i32,
            param1: word(2)?,
            param2: word(3)?,
        })
    }
}

/// Driver side of the synchronous mailbox.
#[derive(Debug)]
pub struct Mailbox {
    block: SharedBlock,
    busy: Mutex<()>,
    timeout: Duration,
    poll: Duration,
}

impl Mailbox {
    pub fn new(block: SharedBlock, timeout: Duration, poll: Duration) -> Self {
        Self {
            block,
            busy: Mutex::new(()),
            timeout,
            poll,
        }
    }

    pub fn block(&self) -> &SharedBlock {
        &self.block
    }

    /// Post a request, signal the co-processor with `notify` and poll for
    /// completion. Requests are serialised.
    pub fn send_sync(
        &self,
        msg_id: u8,
        param1: u32,
        param2: u32,
        notify: impl FnOnce(),
    ) -> Result<i32> {
        let _busy = self.busy.lock();
        let request = MailboxFrame::request(msg_id, param1, param2).encode();
        self.block.write(|raw| raw[..MAILBOX_SIZE].copy_from_slice(&request));
        notify();

        let deadline = Instant::now() + self.timeout;
        loop {
            let frame = self.block.read(MailboxFrame::decode);
            if let Some(frame) = frame.filter(|f| f.status == MailboxStatus::Complete) {
                let mut idle = frame;
                idle.status = MailboxStatus::Idle;
                self.block
                    .write(|raw| raw[..MAILBOX_SIZE].copy_from_slice(&idle.encode()));
                tracing::debug!(msg_id, result = frame.result, "mailbox request complete");
                return Ok(frame.result);
            }
            if Instant::now() >= deadline {
                tracing::error!(msg_id, timeout = ?self.timeout, "mailbox request timed out");
                return Err(DriverError::MailboxTimeout {
                    msg_id,
                    timeout: self.timeout,
                });
            }
            thread::sleep(self.poll);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use btlink_ring::SharedMemory;

    use super::*;

    #[test]
    fn word0_layout() {
        let frame = MailboxFrame::request(0x42, 7, 9);
        let raw = frame.encode();
        assert_eq!(raw[0], MAILBOX_MAGIC);
        assert_eq!(raw[1] & 0x3, 1);
        assert_eq!(raw[3], 0x42);
        assert_eq!(MailboxFrame::decode(&raw), Some(frame));
    }

    #[test]
    fn decode_rejects_missing_magic() {
        assert_eq!(MailboxFrame::decode(&[0u8; MAILBOX_SIZE]), None);
        assert_eq!(MailboxFrame::decode(&[MAILBOX_MAGIC, 3, 0, 0]), None);
    }

    #[test]
    fn completed_request_returns_result() {
        let memory = SharedMemory::new();
        let block = memory.create_block(MAILBOX_SIZE).unwrap();
        let mailbox = Mailbox::new(
            block.clone(),
            Duration::from_millis(500),
            Duration::from_micros(100),
        );

        let peer = Arc::new(block);
        let result = mailbox
            .send_sync(3, 20, 22, || {
                let peer = Arc::clone(&peer);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5));
                    peer.write(|raw| {
                        let mut frame = MailboxFrame::decode(raw).unwrap();
                        frame.result = (frame.param1 + frame.param2) as i32;
                        frame.status = MailboxStatus::Complete;
                        raw.copy_from_slice(&frame.encode());
                    });
                });
            })
            .unwrap();
        assert_eq!(result, 42);

        let idle = mailbox.block().read(MailboxFrame::decode).unwrap();
        assert_eq!(idle.status, MailboxStatus::Idle);
    }

    #[test]
    fn unanswered_request_times_out() {
        let memory = SharedMemory::new();
        let block = memory.create_block(MAILBOX_SIZE).unwrap();
        let mailbox = Mailbox::new(block, Duration::from_millis(5), Duration::from_micros(100));

        assert!(matches!(
            mailbox.send_sync(9, 0, 0, || {}),
            Err(DriverError::MailboxTimeout { msg_id: 9, .. })
        ));
    }
}
