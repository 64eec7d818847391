use std::sync::Arc;

use btlink_ring::{ChannelId, Doorbell};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default load address of the co-processor image.
pub const FIRMWARE_LOAD_ADDRESS: u32 = 0x0810_0000;

/// Default size of the co-processor image.
pub const FIRMWARE_SIZE: u32 = 0x34000;

/// Location of the co-processor image in application-core memory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FirmwareImage {
    pub load_address: u32,
    pub size: u32,
}

impl Default for FirmwareImage {
    fn default() -> Self {
        Self {
            load_address: FIRMWARE_LOAD_ADDRESS,
            size: FIRMWARE_SIZE,
        }
    }
}

/// Channels the co-processor must know before it can read the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootParams {
    /// Driver to co-processor control ring.
    pub control_tx: ChannelId,
    /// Co-processor to driver control ring.
    pub control_rx: ChannelId,
    /// Synchronous mailbox block.
    pub mailbox: ChannelId,
}

/// Receives interrupts raised by the co-processor.
///
/// Called from interrupt context: implementations must not block.
pub trait InterruptSink: Send + Sync {
    /// Shared IPC interrupt: control, HCI, log or TWS acknowledgement.
    fn on_ipc_interrupt(&self);

    /// TWS timing interrupt on channel `index`.
    fn on_tws_interrupt(&self, index: usize);
}

/// Platform hooks for the Bluetooth co-processor.
pub trait Coprocessor: Send + Sync {
    /// Copy the firmware image into the co-processor's memory.
    fn load(&self, image: &FirmwareImage) -> Result<()>;

    /// Release the co-processor from reset.
    fn start(&self, params: &BootParams) -> Result<()>;

    /// Hold the co-processor in reset.
    fn stop(&self) -> Result<()>;

    /// Doorbell attached to every driver-to-co-processor ring, so ring
    /// writes signal the co-processor directly.
    fn doorbell(&self) -> Arc<Doorbell>;

    /// Signal the co-processor after a change it must observe outside a
    /// ring, such as a TWS acknowledgement.
    fn notify(&self) {
        self.doorbell().ring();
    }

    /// Route co-processor interrupts to `sink`.
    fn attach(&self, sink: Arc<dyn InterruptSink>);

    /// Stop routing interrupts.
    fn detach(&self);

    /// Arm or disarm the hardware TWS interrupt for channel `index`.
    fn set_tws_irq(&self, index: usize, enabled: bool);
}
