use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use btlink_frame::{ControlKind, ControlMessage};
use btlink_ring::ChannelId;
use parking_lot::{Condvar, Mutex};

use crate::error::{DriverError, Result};

/// Bluetooth device address, most significant octet first.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Address used when nothing is configured.
    pub const DEFAULT: &'static str = "f44efd12a3b4";

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Handshake words: `w0 = a2..a5`, `w1 = a0..a1`, big-endian packed.
    pub fn to_words(&self) -> (u32, u32) {
        let a = self.0;
        let w0 = u32::from_be_bytes([a[2], a[3], a[4], a[5]]);
        let w1 = u32::from(u16::from_be_bytes([a[0], a[1]]));
        (w0, w1)
    }

    pub fn from_words(w0: u32, w1: u32) -> Self {
        let low = w0.to_be_bytes();
        let high = (w1 as u16).to_be_bytes();
        Self([high[0], high[1], low[0], low[1], low[2], low[3]])
    }
}

impl Default for DeviceAddress {
    fn default() -> Self {
        Self([0xf4, 0x4e, 0xfd, 0x12, 0xa3, 0xb4])
    }
}

impl FromStr for DeviceAddress {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s.chars().filter(|c| *c != ':').collect();
        let mut octets = [0u8; 6];
        hex::decode_to_slice(&digits, &mut octets)
            .map_err(|_| DriverError::InvalidAddress(s.to_string()))?;
        Ok(Self(octets))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = self.0;
        write!(
            f,
            "DeviceAddress({:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x})",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

/// Channel ids announced to the co-processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeChannels {
    pub hci_rx: ChannelId,
    pub hci_tx: ChannelId,
    pub log_rx: ChannelId,
    /// `(rx, tx)` slot ids per TWS channel.
    pub tws: [(ChannelId, ChannelId); 2],
}

/// Messages sent to bring the co-processor up, in order.
pub fn handshake_messages(
    address: &DeviceAddress,
    channels: &HandshakeChannels,
) -> Vec<ControlMessage> {
    let (w0, w1) = address.to_words();
    let [(rx0, tx0), (rx1, tx1)] = channels.tws;
    vec![
        ControlMessage::from_words(ControlKind::Init, 0, [w0, w1, 0, 0]),
        ControlMessage::from_words(
            ControlKind::HciBuffers,
            0,
            [
                channels.hci_rx.get(),
                channels.hci_tx.get(),
                channels.log_rx.get(),
                0,
            ],
        ),
        ControlMessage::from_words(
            ControlKind::TwsBuffers,
            0,
            [rx0.get(), tx0.get(), rx1.get(), tx1.get()],
        ),
    ]
}

/// Message that switches controller logging to the log ring or its UART.
pub fn log_control_message(enabled: bool, log_rx: ChannelId) -> ControlMessage {
    if enabled {
        ControlMessage::from_words(ControlKind::LogOn, 0, [log_rx.get(), 0, 0, 0])
    } else {
        ControlMessage::from_words(ControlKind::LogOff, 0, [1, 0, 0, 0])
    }
}

/// Readiness flag with a bounded wait.
#[derive(Debug, Default)]
pub struct ReadySignal {
    ready: Mutex<bool>,
    cv: Condvar,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.ready.lock() = true;
        self.cv.notify_all();
    }

    pub fn clear(&self) {
        *self.ready.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.ready.lock()
    }

    /// Wait until set. Returns false if `timeout` expired first.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ready = self.ready.lock();
        while !*ready {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.cv.wait_for(&mut ready, deadline - now);
        }
        true
    }
}
