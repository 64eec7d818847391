//! Shared-memory transport between the application core and the Bluetooth
//! co-processor.
//!
//! This is the lowest layer of btlink. It provides:
//! - [`RingChannel`]: a fixed-capacity single-producer/single-consumer byte ring
//!   with claim/commit primitives
//! - [`Doorbell`]: a coalescing cross-core signal
//! - [`SharedMemory`]: the registry that creates, looks up and destroys channels
//!
//! Everything else builds on the [`RingChannel`] handle provided here.

pub mod doorbell;
pub mod error;
pub mod memory;
pub mod ring;

pub use doorbell::Doorbell;
pub use error::{Result, RingError};
pub use memory::{SharedBlock, SharedMemory};
pub use ring::{ChannelId, Direction, GetClaim, PutClaim, RingChannel};
