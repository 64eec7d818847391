//! Driver configuration.
//!
//! Every field has a default, so a JSON file only needs to name what it
//! overrides. Durations are whole milliseconds.

use std::fs;
use std::path::Path;
use std::time::Duration;

use btlink_frame::WriterConfig;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::handshake::DeviceAddress;
use crate::platform::FirmwareImage;

/// Main configuration structure for the driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    /// Public device address sent in the handshake, as 12 hex digits.
    pub device_address: String,
    /// Where the co-processor image lives.
    pub firmware: FirmwareImage,
    /// Ring capacities in bytes.
    pub control_ring_size: usize,
    pub hci_rx_ring_size: usize,
    pub hci_tx_ring_size: usize,
    pub log_ring_size: usize,
    /// Largest controller log record copied per dispatch unit.
    pub log_record_size: usize,
    /// How long `initialize` waits for the ready message.
    pub ready_timeout_ms: u64,
    /// Bound on waiting for ring space when sending.
    pub send_timeout_ms: u64,
    /// Bound on waiting for each fragment of a crypto request.
    pub fragment_timeout_ms: u64,
    /// How long a synchronous mailbox request may take.
    pub mailbox_timeout_ms: u64,
    /// Mailbox polling period in microseconds.
    pub mailbox_poll_us: u64,
    /// TWS events buffered for the callback thread before overruns.
    pub tws_queue_depth: usize,
    /// Route controller logs to the log ring once ready.
    pub controller_log: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            device_address: DeviceAddress::DEFAULT.to_string(),
            firmware: FirmwareImage::default(),
            control_ring_size: 512,
            hci_rx_ring_size: 4096,
            hci_tx_ring_size: 2048,
            log_ring_size: 1024,
            log_record_size: 256,
            ready_timeout_ms: 1000,
            send_timeout_ms: 100,
            fragment_timeout_ms: 50,
            mailbox_timeout_ms: 100,
            mailbox_poll_us: 100,
            tws_queue_depth: 16,
            controller_log: false,
        }
    }
}

impl DriverConfig {
    /// Parse configuration from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn device_address(&self) -> Result<DeviceAddress> {
        self.device_address.parse()
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn fragment_timeout(&self) -> Duration {
        Duration::from_millis(self.fragment_timeout_ms)
    }

    pub fn mailbox_timeout(&self) -> Duration {
        Duration::from_millis(self.mailbox_timeout_ms)
    }

    pub fn mailbox_poll_interval(&self) -> Duration {
        Duration::from_micros(self.mailbox_poll_us)
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            send_timeout: self.send_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hardware_layout() {
        let config = DriverConfig::default();
        assert_eq!(config.firmware.load_address, 0x0810_0000);
        assert_eq!(config.firmware.size, 0x34000);
        assert_eq!(config.log_record_size, 256);
        assert_eq!(config.mailbox_timeout(), Duration::from_millis(100));
        assert_eq!(config.device_address().unwrap(), DeviceAddress::default());
    }

    #[test]
    fn partial_json_overrides() {
        let config = DriverConfig::from_json_str(
            r#"{"ready_timeout_ms": 250, "device_address": "001122334455"}"#,
        )
        .unwrap();
        assert_eq!(config.ready_timeout(), Duration::from_millis(250));
        assert_eq!(
            config.device_address().unwrap().octets(),
            [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]
        );
        assert_eq!(config.hci_rx_ring_size, 4096);
    }

    #[test]
    fn invalid_json_rejected() {
        assert!(DriverConfig::from_json_str("{not json").is_err());
    }

    #[test]
    fn json_roundtrip_preserves_firmware() {
        let mut config = DriverConfig::default();
        config.firmware.load_address = 0x0820_0000;
        let json = serde_json::to_string(&config).unwrap();
        let back = DriverConfig::from_json_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
