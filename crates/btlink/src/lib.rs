//! Shared-memory transport between an application processor and a Bluetooth
//! co-processor.
//!
//! # Crate Structure
//!
//! - [`ring`]: byte ring channels, doorbell and the shared-memory registry
//! - [`frame`]: HCI framing, control messages and TWS slot codecs
//! - [`driver`]: lifecycle, dispatch, crypto offload, TWS signals and the
//!   simulated co-processor

/// Re-export ring channel types.
pub mod ring {
    pub use btlink_ring::*;
}

/// Re-export framing types.
pub mod frame {
    pub use btlink_frame::*;
}

/// Re-export driver types.
pub mod driver {
    pub use btlink_driver::*;
}

pub use btlink_driver::{Driver, DriverConfig, DriverError};
