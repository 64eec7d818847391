use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::doorbell::Doorbell;
use crate::error::{Result, RingError};
use crate::ring::{ChannelId, Direction, RingChannel};

/// Fixed-size shared byte block.
///
/// Used for shared structs that are overwritten in place rather than
/// streamed, such as the TWS signal slots and the mailbox.
#[derive(Clone)]
pub struct SharedBlock {
    id: ChannelId,
    bytes: Arc<Mutex<Box<[u8]>>>,
}

impl SharedBlock {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` with shared access to the block contents.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.lock())
    }

    /// Run `f` with exclusive access to the block contents.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes.lock())
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().to_vec()
    }
}

impl fmt::Debug for SharedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBlock")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}

#[derive(Default)]
struct Registry {
    next_id: u32,
    created: u64,
    rings: HashMap<ChannelId, RingChannel>,
    blocks: HashMap<ChannelId, SharedBlock>,
}

impl Registry {
    fn allocate_id(&mut self) -> ChannelId {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if let Some(id) = ChannelId::from_raw(self.next_id) {
                if !self.rings.contains_key(&id) && !self.blocks.contains_key(&id) {
                    self.created += 1;
                    return id;
                }
            }
        }
    }
}

/// Provider of shared channels, visible to both cores.
///
/// Handles are cheap to clone; clones share one registry. The driver and
/// the co-processor side look channels up by the ids exchanged in the
/// handshake.
#[derive(Clone, Default)]
pub struct SharedMemory {
    registry: Arc<Mutex<Registry>>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ring channel and register it under a fresh id.
    pub fn create_ring(
        &self,
        direction: Direction,
        capacity: usize,
        doorbell: Option<Arc<Doorbell>>,
    ) -> Result<RingChannel> {
        if capacity == 0 {
            return Err(RingError::InvalidCapacity(capacity));
        }
        let mut registry = self.registry.lock();
        let id = registry.allocate_id();
        let ring = RingChannel::new(id, direction, capacity, doorbell)?;
        registry.rings.insert(id, ring.clone());
        tracing::debug!(channel = %id, ?direction, capacity, "ring channel created");
        Ok(ring)
    }

    /// Create a zeroed shared block and register it under a fresh id.
    pub fn create_block(&self, size: usize) -> Result<SharedBlock> {
        if size == 0 {
            return Err(RingError::InvalidCapacity(size));
        }
        let mut registry = self.registry.lock();
        let id = registry.allocate_id();
        let block = SharedBlock {
            id,
            bytes: Arc::new(Mutex::new(vec![0u8; size].into_boxed_slice())),
        };
        registry.blocks.insert(id, block.clone());
        tracing::debug!(block = %id, size, "shared block created");
        Ok(block)
    }

    pub fn ring(&self, id: ChannelId) -> Result<RingChannel> {
        self.registry
            .lock()
            .rings
            .get(&id)
            .cloned()
            .ok_or(RingError::UnknownChannel(id))
    }

    pub fn block(&self, id: ChannelId) -> Result<SharedBlock> {
        self.registry
            .lock()
            .blocks
            .get(&id)
            .cloned()
            .ok_or(RingError::UnknownChannel(id))
    }

    /// Unregister a channel or block. Outstanding ring handles are closed.
    pub fn destroy(&self, id: ChannelId) -> Result<()> {
        let mut registry = self.registry.lock();
        if let Some(ring) = registry.rings.remove(&id) {
            ring.close();
            tracing::debug!(channel = %id, "ring channel destroyed");
            return Ok(());
        }
        if registry.blocks.remove(&id).is_some() {
            tracing::debug!(block = %id, "shared block destroyed");
            return Ok(());
        }
        Err(RingError::UnknownChannel(id))
    }

    /// Number of rings and blocks currently registered.
    pub fn live_count(&self) -> usize {
        let registry = self.registry.lock();
        registry.rings.len() + registry.blocks.len()
    }

    /// Number of rings and blocks ever created.
    pub fn created_count(&self) -> u64 {
        self.registry.lock().created
    }
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("SharedMemory")
            .field("rings", &registry.rings.len())
            .field("blocks", &registry.blocks.len())
            .field("created", &registry.created)
            .finish()
    }
}
