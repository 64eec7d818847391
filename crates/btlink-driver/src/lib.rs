//! Bluetooth co-processor driver.
//!
//! The [`Driver`] brings a co-processor up over shared-memory rings and then
//! carries its traffic:
//! - HCI packets in both directions, reassembled by a dispatch thread
//! - Controller log lines, forwarded to a [`LogSink`]
//! - P-192/P-256 key generation and DH requests, run on a worker thread
//! - TWS timing interrupts, delivered to callbacks on their own thread
//! - Synchronous mailbox requests
//!
//! The platform side is the [`Coprocessor`] trait; [`sim::SimulatedCoprocessor`]
//! implements it in-process.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use btlink_driver::sim::SimulatedCoprocessor;
//! use btlink_driver::{Driver, DriverConfig, HciHost};
//! use btlink_frame::{HciPacket, PacketType};
//! use btlink_ring::SharedMemory;
//! use bytes::BytesMut;
//!
//! struct Host;
//!
//! impl HciHost for Host {
//!     fn get_buffer(&self, _: PacketType, _: Option<u8>, len: usize) -> Option<BytesMut> {
//!         Some(BytesMut::with_capacity(len))
//!     }
//!
//!     fn on_receive(&self, packet: HciPacket) {
//!         println!("{} bytes of {}", packet.len(), packet.packet_type);
//!     }
//! }
//!
//! # fn main() -> btlink_driver::Result<()> {
//! let memory = SharedMemory::new();
//! let platform = Arc::new(SimulatedCoprocessor::new(memory.clone()));
//! let driver = Driver::new(platform, memory, DriverConfig::default())?;
//! driver.initialize(Some(Arc::new(Host)))?;
//! driver.send(PacketType::Command, &[0x03, 0x0c, 0x00])?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod control;
pub mod crypto;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod handshake;
pub mod host;
pub mod mailbox;
pub mod offload;
pub mod platform;
pub mod sim;
pub mod stats;
pub mod tws;

pub use config::DriverConfig;
pub use crypto::{CryptoOp, CryptoResponse, CryptoStatus};
pub use driver::{Driver, Lifecycle};
pub use error::{DriverError, Result};
pub use handshake::DeviceAddress;
pub use host::{HciHost, LogSink, TracingLogSink, TwsCallback};
pub use platform::{BootParams, Coprocessor, FirmwareImage, InterruptSink};
pub use stats::DriverStats;
pub use tws::AckState;
