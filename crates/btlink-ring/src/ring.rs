use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::doorbell::Doorbell;
use crate::error::{Result, RingError};

/// Identifier of a shared-memory channel.
///
/// Ids are handed to the co-processor during the handshake, so they are
/// plain non-zero `u32` values on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u32);

impl ChannelId {
    /// Wrap a raw id. Returns `None` for zero, which is never allocated.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// The raw wire value.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which core produces into a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Application core writes, co-processor reads.
    ToCoprocessor,
    /// Co-processor writes, application core reads.
    FromCoprocessor,
}

struct RingState {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
    len: usize,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn free(&self) -> usize {
        self.capacity() - self.len
    }

    fn contiguous_free(&self) -> usize {
        self.free().min(self.capacity() - self.head)
    }

    fn contiguous_used(&self) -> usize {
        self.len.min(self.capacity() - self.tail)
    }

    fn advance_head(&mut self, n: usize) {
        self.head = (self.head + n) % self.capacity();
        self.len += n;
    }

    fn advance_tail(&mut self, n: usize) {
        self.tail = (self.tail + n) % self.capacity();
        self.len -= n;
    }
}

struct Inner {
    id: ChannelId,
    direction: Direction,
    state: Mutex<RingState>,
    readable: Condvar,
    writable: Condvar,
    closed: AtomicBool,
    doorbell: Option<Arc<Doorbell>>,
}

/// Fixed-capacity single-producer/single-consumer byte ring.
///
/// Handles are cheap to clone; all clones refer to the same storage. `put`
/// and `get` never block. A zero result means the ring is full (or empty)
/// and the caller decides whether to retry, wait or defer.
#[derive(Clone)]
pub struct RingChannel {
    inner: Arc<Inner>,
}

impl RingChannel {
    /// Create a standalone ring. Most callers go through
    /// [`SharedMemory::create_ring`](crate::SharedMemory::create_ring).
    pub fn new(
        id: ChannelId,
        direction: Direction,
        capacity: usize,
        doorbell: Option<Arc<Doorbell>>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(RingError::InvalidCapacity(capacity));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                id,
                direction,
                state: Mutex::new(RingState {
                    buf: vec![0u8; capacity].into_boxed_slice(),
                    head: 0,
                    tail: 0,
                    len: 0,
                }),
                readable: Condvar::new(),
                writable: Condvar::new(),
                closed: AtomicBool::new(false),
                doorbell,
            }),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn capacity(&self) -> usize {
        self.inner.state.lock().capacity()
    }

    /// Bytes currently queued.
    pub fn len(&self) -> usize {
        self.inner.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes that can be written before the ring is full.
    pub fn free(&self) -> usize {
        self.inner.state.lock().free()
    }

    /// True when the consumer has data to read.
    pub fn pending(&self) -> bool {
        !self.is_closed() && !self.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Claim up to `want` contiguous bytes of free space.
    ///
    /// Returns `Ok(None)` when the ring is full or `want` is zero. The claim
    /// publishes nothing until [`PutClaim::commit`] is called.
    pub fn put_claim(&self, want: usize) -> Result<Option<PutClaim<'_>>> {
        self.ensure_open()?;
        let guard = self.inner.state.lock();
        let len = want.min(guard.contiguous_free());
        if len == 0 {
            return Ok(None);
        }
        let start = guard.head;
        Ok(Some(PutClaim {
            guard,
            inner: &self.inner,
            start,
            len,
        }))
    }

    /// Claim up to `want` contiguous queued bytes.
    ///
    /// Returns `Ok(None)` when the ring is empty or `want` is zero.
    pub fn get_claim(&self, want: usize) -> Result<Option<GetClaim<'_>>> {
        self.ensure_open()?;
        let guard = self.inner.state.lock();
        let len = want.min(guard.contiguous_used());
        if len == 0 {
            return Ok(None);
        }
        let start = guard.tail;
        Ok(Some(GetClaim {
            guard,
            inner: &self.inner,
            start,
            len,
        }))
    }

    /// Write as many bytes as fit contiguously. Returns the count written.
    pub fn put(&self, data: &[u8]) -> Result<usize> {
        let Some(mut claim) = self.put_claim(data.len())? else {
            return Ok(0);
        };
        let n = claim.len();
        claim.as_mut_slice().copy_from_slice(&data[..n]);
        claim.commit(n);
        Ok(n)
    }

    /// Read one contiguous chunk of at most `max` bytes.
    ///
    /// The chunk stops at the wrap point; callers loop to drain the rest.
    pub fn get(&self, max: usize) -> Result<Bytes> {
        let Some(claim) = self.get_claim(max)? else {
            return Ok(Bytes::new());
        };
        let chunk = Bytes::copy_from_slice(claim.as_slice());
        claim.commit(chunk.len());
        Ok(chunk)
    }

    /// Read one contiguous chunk into `dst`. Returns the count read.
    pub fn get_into(&self, dst: &mut [u8]) -> Result<usize> {
        let Some(claim) = self.get_claim(dst.len())? else {
            return Ok(0);
        };
        let n = claim.len();
        dst[..n].copy_from_slice(claim.as_slice());
        claim.commit(n);
        Ok(n)
    }

    /// Write a whole record or nothing. Handles the wrap point.
    ///
    /// Returns `Ok(false)` when there is not enough free space right now.
    pub fn write_record(&self, record: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock();
        let capacity = state.capacity();
        if record.len() > capacity {
            return Err(RingError::RecordTooLarge {
                size: record.len(),
                capacity,
            });
        }
        if record.is_empty() {
            return Ok(true);
        }
        if state.free() < record.len() {
            return Ok(false);
        }

        let head = state.head;
        let first = record.len().min(capacity - head);
        state.buf[head..head + first].copy_from_slice(&record[..first]);
        state.buf[..record.len() - first].copy_from_slice(&record[first..]);
        state.advance_head(record.len());
        self.inner.readable.notify_all();
        Ok(true)
    }

    /// Read a whole record of `dst.len()` bytes or nothing.
    ///
    /// Returns `Ok(false)` when fewer bytes are queued.
    pub fn read_record(&self, dst: &mut [u8]) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock();
        if dst.is_empty() {
            return Ok(true);
        }
        if state.len < dst.len() {
            return Ok(false);
        }

        let capacity = state.capacity();
        let tail = state.tail;
        let first = dst.len().min(capacity - tail);
        dst[..first].copy_from_slice(&state.buf[tail..tail + first]);
        let rest = dst.len() - first;
        dst[first..].copy_from_slice(&state.buf[..rest]);
        state.advance_tail(dst.len());
        self.inner.writable.notify_all();
        Ok(true)
    }

    /// Block until at least `min` bytes are free (clamped to capacity).
    pub fn wait_writable(&self, min: usize, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        let min = min.max(1).min(state.capacity());
        loop {
            self.ensure_open()?;
            if state.free() >= min {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RingError::Timeout {
                    channel: self.inner.id,
                    timeout,
                });
            }
            self.inner.writable.wait_for(&mut state, deadline - now);
        }
    }

    /// Block until at least one byte is queued.
    pub fn wait_readable(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            self.ensure_open()?;
            if state.len > 0 {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RingError::Timeout {
                    channel: self.inner.id,
                    timeout,
                });
            }
            self.inner.readable.wait_for(&mut state, deadline - now);
        }
    }

    /// Raise the doorbell attached to this channel.
    ///
    /// Returns true if the doorbell was newly raised, false if it was
    /// already pending (or the channel has none).
    pub fn notify(&self) -> bool {
        match &self.inner.doorbell {
            Some(doorbell) => doorbell.ring(),
            None => false,
        }
    }

    /// Discard all queued bytes and rewind both cursors.
    ///
    /// Only valid while neither side is mid-claim, e.g. with the peer core
    /// stopped.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.head = 0;
        state.tail = 0;
        state.len = 0;
        self.inner.writable.notify_all();
    }

    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let _state = self.inner.state.lock();
        self.inner.readable.notify_all();
        self.inner.writable.notify_all();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RingError::Closed(self.inner.id));
        }
        Ok(())
    }
}

impl fmt::Debug for RingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RingChannel")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("capacity", &state.capacity())
            .field("len", &state.len)
            .finish()
    }
}

/// Contiguous free region claimed by the producer.
pub struct PutClaim<'a> {
    guard: MutexGuard<'a, RingState>,
    inner: &'a Inner,
    start: usize,
    len: usize,
}

impl PutClaim<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let (start, len) = (self.start, self.len);
        &mut self.guard.buf[start..start + len]
    }

    /// Publish the first `n` bytes of the claim to the consumer.
    pub fn commit(mut self, n: usize) {
        let n = n.min(self.len);
        if n > 0 {
            self.guard.advance_head(n);
            self.inner.readable.notify_all();
        }
    }
}

/// Contiguous queued region claimed by the consumer.
pub struct GetClaim<'a> {
    guard: MutexGuard<'a, RingState>,
    inner: &'a Inner,
    start: usize,
    len: usize,
}

impl GetClaim<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.guard.buf[self.start..self.start + self.len]
    }

    /// Release the first `n` bytes of the claim back to the producer.
    pub fn commit(mut self, n: usize) {
        let n = n.min(self.len);
        if n > 0 {
            self.guard.advance_tail(n);
            self.inner.writable.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn ring(capacity: usize) -> RingChannel {
        RingChannel::new(
            ChannelId::from_raw(1).unwrap(),
            Direction::FromCoprocessor,
            capacity,
            None,
        )
        .unwrap()
    }

    fn drain(ring: &RingChannel, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let bytes = ring.get(chunk).unwrap();
            if bytes.is_empty() {
                return out;
            }
            out.extend_from_slice(&bytes);
        }
    }

    fn fill(ring: &RingChannel, data: &[u8], chunk: usize) {
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk).min(data.len());
            let n = ring.put(&data[offset..end]).unwrap();
            assert!(n > 0, "ring unexpectedly full");
            offset += n;
        }
    }

    #[test]
    fn zero_capacity_rejected() {
        let err = RingChannel::new(
            ChannelId::from_raw(1).unwrap(),
            Direction::ToCoprocessor,
            0,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RingError::InvalidCapacity(0)));
    }

    #[test]
    fn channel_id_zero_is_invalid() {
        assert!(ChannelId::from_raw(0).is_none());
        assert_eq!(ChannelId::from_raw(7).unwrap().get(), 7);
    }

    #[test]
    fn roundtrip_with_mixed_chunk_sizes_across_wrap() {
        let ring = ring(64);
        let mut written = Vec::new();
        let mut read = Vec::new();

        // Shift the cursors so later writes straddle the wrap point.
        for round in 0..20u8 {
            let data: Vec<u8> = (0..37u8).map(|b| b.wrapping_mul(round + 1)).collect();
            fill(&ring, &data, 5 + round as usize % 7);
            written.extend_from_slice(&data);
            read.extend_from_slice(&drain(&ring, 3 + round as usize % 11));
        }

        assert_eq!(read, written);
        assert!(ring.is_empty());
    }

    #[test]
    fn get_stops_at_wrap_point() {
        let ring = ring(8);
        assert_eq!(ring.put(&[0; 6]).unwrap(), 6);
        assert_eq!(ring.get(6).unwrap().len(), 6);

        // head at 6: only two contiguous bytes before the wrap.
        assert_eq!(ring.put(&[1, 2, 3, 4]).unwrap(), 2);
        assert_eq!(ring.put(&[3, 4]).unwrap(), 2);
        assert_eq!(ring.get(8).unwrap().as_ref(), &[1, 2]);
        assert_eq!(ring.get(8).unwrap().as_ref(), &[3, 4]);
    }

    #[test]
    fn full_and_empty_return_zero() {
        let ring = ring(4);
        assert_eq!(ring.put(&[1, 2, 3, 4, 5]).unwrap(), 4);
        assert_eq!(ring.put(&[6]).unwrap(), 0);
        assert_eq!(drain(&ring, 16), vec![1, 2, 3, 4]);
        assert!(ring.get(4).unwrap().is_empty());
        assert!(!ring.pending());
    }

    #[test]
    fn dropped_claim_commits_nothing() {
        let ring = ring(16);
        {
            let mut claim = ring.put_claim(4).unwrap().unwrap();
            claim.as_mut_slice().copy_from_slice(&[9; 4]);
        }
        assert!(ring.is_empty());

        ring.put(&[1, 2, 3]).unwrap();
        {
            let claim = ring.get_claim(3).unwrap().unwrap();
            assert_eq!(claim.as_slice(), &[1, 2, 3]);
        }
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn partial_commit() {
        let ring = ring(16);
        let mut claim = ring.put_claim(8).unwrap().unwrap();
        claim.as_mut_slice()[..2].copy_from_slice(&[7, 8]);
        claim.commit(2);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.get(16).unwrap().as_ref(), &[7, 8]);
    }

    #[test]
    fn records_are_all_or_nothing_and_wrap() {
        let ring = ring(10);
        assert!(ring.write_record(&[1; 6]).unwrap());
        assert!(!ring.write_record(&[2; 6]).unwrap());

        let mut first = [0u8; 6];
        assert!(ring.read_record(&mut first).unwrap());
        assert_eq!(first, [1; 6]);

        // head is at 6, so this record wraps.
        let record = [3, 4, 5, 6, 7, 8];
        assert!(ring.write_record(&record).unwrap());
        let mut short = [0u8; 7];
        assert!(!ring.read_record(&mut short).unwrap());
        let mut out = [0u8; 6];
        assert!(ring.read_record(&mut out).unwrap());
        assert_eq!(out, record);
    }

    #[test]
    fn oversized_record_rejected() {
        let ring = ring(4);
        let err = ring.write_record(&[0; 5]).unwrap_err();
        assert!(matches!(
            err,
            RingError::RecordTooLarge {
                size: 5,
                capacity: 4
            }
        ));
    }

    #[test]
    fn wait_writable_times_out_when_full() {
        let ring = ring(4);
        ring.put(&[0; 4]).unwrap();
        let err = ring
            .wait_writable(1, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, RingError::Timeout { .. }));
    }

    #[test]
    fn wait_readable_wakes_on_producer() {
        let ring = ring(16);
        let producer = ring.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.put(b"hi").unwrap();
        });

        ring.wait_readable(Duration::from_secs(2)).unwrap();
        assert_eq!(ring.get(16).unwrap().as_ref(), b"hi");
        handle.join().unwrap();
    }

    #[test]
    fn concurrent_producer_consumer_preserves_order() {
        let ring = ring(32);
        let producer = ring.clone();
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();

        let handle = thread::spawn(move || {
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + 13).min(data.len());
                match producer.put(&data[offset..end]).unwrap() {
                    0 => producer
                        .wait_writable(1, Duration::from_secs(2))
                        .unwrap(),
                    n => offset += n,
                }
            }
        });

        let mut out = Vec::new();
        while out.len() < expected.len() {
            let chunk = ring.get(7).unwrap();
            if chunk.is_empty() {
                ring.wait_readable(Duration::from_secs(2)).unwrap();
            } else {
                out.extend_from_slice(&chunk);
            }
        }

        handle.join().unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn reset_discards_content() {
        let ring = ring(8);
        ring.put(&[1, 2, 3]).unwrap();
        ring.reset();
        assert!(ring.is_empty());
        assert_eq!(ring.free(), 8);
    }

    #[test]
    fn closed_channel_rejects_operations() {
        let ring = ring(8);
        ring.close();
        assert!(matches!(ring.put(&[1]), Err(RingError::Closed(_))));
        assert!(matches!(ring.get(1), Err(RingError::Closed(_))));
        assert!(!ring.pending());
    }

    #[test]
    fn notify_rings_attached_doorbell() {
        let doorbell = Arc::new(Doorbell::new());
        let ring = RingChannel::new(
            ChannelId::from_raw(3).unwrap(),
            Direction::ToCoprocessor,
            8,
            Some(Arc::clone(&doorbell)),
        )
        .unwrap();

        assert!(ring.notify());
        assert!(!ring.notify());
        assert!(doorbell.take());
        assert_eq!(doorbell.ring_count(), 2);
    }
}
