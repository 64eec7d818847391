//! TWS timing channels.
//!
//! Each channel has an rx slot written by the co-processor and a tx slot
//! written by the driver. The hardware interrupt is armed only while both
//! the driver's own (inner) bit and the caller's (external) bit are set.
//! The inner bit drops on every interrupt and comes back once the
//! co-processor has seen the acknowledgement.
//!
//! Behind each signal sits a packet area holding at most one unread packet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use btlink_frame::{TwsSignal, TWS_DATA_SIZE, TWS_SIGNAL_SIZE};
use btlink_ring::SharedBlock;
use crossbeam::channel::{self, Sender, TrySendError};
use parking_lot::Mutex;

use crate::error::{DriverError, Result};
use crate::host::TwsCallback;
use crate::platform::Coprocessor;

/// Number of TWS channels.
pub const TWS_CHANNELS: usize = 2;

const INNER: u8 = 0b01;
const EXTERNAL: u8 = 0b10;
const ARMED: u8 = INNER | EXTERNAL;

/// Acknowledgement handshake state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Idle,
    /// Interrupt taken; re-arm once the peer echoes `expected`.
    AwaitingAck { expected: u8 },
}

#[derive(Debug, Clone, Copy)]
struct ChannelState {
    mask: u8,
    ack: AckState,
}

/// Rx and tx slot of one channel.
#[derive(Debug, Clone)]
pub struct TwsSlots {
    pub rx: SharedBlock,
    pub tx: SharedBlock,
}

#[derive(Debug, Clone, Copy)]
struct TwsEvent {
    index: usize,
    bt_clock: u32,
    intra_offset: u16,
}

type Callbacks = Arc<Mutex<[Option<TwsCallback>; TWS_CHANNELS]>>;

/// Both TWS channels plus the thread that runs their callbacks.
pub struct TwsChannels {
    platform: Arc<dyn Coprocessor>,
    slots: [TwsSlots; TWS_CHANNELS],
    state: Mutex<[ChannelState; TWS_CHANNELS]>,
    callbacks: Callbacks,
    events: Option<Sender<TwsEvent>>,
    executor: Option<JoinHandle<()>>,
    interrupts: AtomicU64,
    overruns: AtomicU64,
}

impl TwsChannels {
    pub fn new(
        platform: Arc<dyn Coprocessor>,
        slots: [TwsSlots; TWS_CHANNELS],
        queue_depth: usize,
    ) -> Result<Self> {
        let callbacks: Callbacks = Arc::new(Mutex::new([None, None]));
        let (tx, rx) = channel::bounded::<TwsEvent>(queue_depth.max(1));

        let executor = {
            let callbacks = Arc::clone(&callbacks);
            thread::Builder::new()
                .name("btlink-tws".into())
                .spawn(move || {
                    for event in rx.iter() {
                        let callback = callbacks.lock()[event.index].clone();
                        if let Some(callback) = callback {
                            callback(event.bt_clock, event.intra_offset);
                        }
                    }
                })?
        };

        let idle = ChannelState {
            mask: 0,
            ack: AckState::Idle,
        };
        Ok(Self {
            platform,
            slots,
            state: Mutex::new([idle; TWS_CHANNELS]),
            callbacks,
            events: Some(tx),
            executor: Some(executor),
            interrupts: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        })
    }

    fn check(index: usize) -> Result<()> {
        if index < TWS_CHANNELS {
            Ok(())
        } else {
            Err(DriverError::InvalidTwsIndex(index))
        }
    }

    fn update_mask(&self, index: usize, state: &mut ChannelState, bit: u8, on: bool) {
        let before = state.mask;
        if on {
            state.mask |= bit;
        } else {
            state.mask &= !bit;
        }
        if before != ARMED && state.mask == ARMED {
            tracing::debug!(index, "TWS interrupt armed");
            self.platform.set_tws_irq(index, true);
        } else if before == ARMED && state.mask != ARMED {
            tracing::debug!(index, "TWS interrupt disarmed");
            self.platform.set_tws_irq(index, false);
        }
    }

    /// Set the inner bit on every channel.
    pub fn enable_inner(&self) {
        let mut state = self.state.lock();
        for (index, channel) in state.iter_mut().enumerate() {
            self.update_mask(index, channel, INNER, true);
        }
    }

    pub fn enable(&self, index: usize) -> Result<()> {
        Self::check(index)?;
        let mut state = self.state.lock();
        self.update_mask(index, &mut state[index], EXTERNAL, true);
        Ok(())
    }

    pub fn disable(&self, index: usize) -> Result<()> {
        Self::check(index)?;
        let mut state = self.state.lock();
        self.update_mask(index, &mut state[index], EXTERNAL, false);
        Ok(())
    }

    /// Clear the external bit on every channel.
    pub fn disable_all(&self) {
        let mut state = self.state.lock();
        for (index, channel) in state.iter_mut().enumerate() {
            self.update_mask(index, channel, EXTERNAL, false);
        }
    }

    pub fn register_callback(&self, index: usize, callback: Option<TwsCallback>) -> Result<()> {
        Self::check(index)?;
        self.callbacks.lock()[index] = callback;
        Ok(())
    }

    pub fn clear_callbacks(&self) {
        *self.callbacks.lock() = [None, None];
    }

    /// Write the timer mode into the tx slot.
    pub fn set_mode(&self, index: usize, mode: u8) -> Result<()> {
        Self::check(index)?;
        self.update_tx(index, |signal| signal.mode = mode)?;
        self.platform.notify();
        Ok(())
    }

    fn update_tx(&self, index: usize, f: impl FnOnce(&mut TwsSignal)) -> Result<TwsSignal> {
        let signal = self.slots[index].tx.write(|raw| {
            TwsSignal::decode(raw).map(|mut signal| {
                f(&mut signal);
                raw[..TWS_SIGNAL_SIZE].copy_from_slice(&signal.encode());
                signal
            })
        })?;
        Ok(signal)
    }

    /// Take the packet from the rx slot's data area.
    pub fn data_read(&self, index: usize, buf: &mut [u8]) -> Result<usize> {
        Self::check(index)?;
        self.slots[index].rx.write(|raw| -> Result<usize> {
            let mut signal = TwsSignal::decode(raw)?;
            if !signal.has_unread() {
                return Err(DriverError::TwsNoData(index));
            }
            let len = usize::from(signal.data_len).min(TWS_DATA_SIZE);
            if buf.len() < len {
                return Err(DriverError::InvalidArgument(format!(
                    "TWS packet of {len} bytes does not fit a {}-byte buffer",
                    buf.len()
                )));
            }
            buf[..len].copy_from_slice(&raw[TWS_SIGNAL_SIZE..TWS_SIGNAL_SIZE + len]);
            signal.read_count = signal.read_count.wrapping_add(1);
            raw[..TWS_SIGNAL_SIZE].copy_from_slice(&signal.encode());
            tracing::trace!(index, len, "TWS packet read");
            Ok(len)
        })
    }

    /// Put a packet into the tx slot's data area.
    pub fn data_write(&self, index: usize, data: &[u8]) -> Result<usize> {
        Self::check(index)?;
        if data.is_empty() || data.len() > TWS_DATA_SIZE {
            return Err(DriverError::InvalidArgument(format!(
                "TWS packet must be 1..={TWS_DATA_SIZE} bytes, got {}",
                data.len()
            )));
        }
        self.slots[index].tx.write(|raw| -> Result<()> {
            let mut signal = TwsSignal::decode(raw)?;
            if signal.has_unread() {
                return Err(DriverError::TwsBusy(index));
            }
            raw[TWS_SIGNAL_SIZE..TWS_SIGNAL_SIZE + data.len()].copy_from_slice(data);
            signal.data_len = data.len() as u16;
            signal.write_count = signal.write_count.wrapping_add(1);
            raw[..TWS_SIGNAL_SIZE].copy_from_slice(&signal.encode());
            Ok(())
        })?;
        tracing::trace!(index, len = data.len(), "TWS packet written");
        self.platform.notify();
        Ok(data.len())
    }

    fn read_rx(&self, index: usize) -> Result<TwsSignal> {
        Ok(self.slots[index].rx.read(TwsSignal::decode)?)
    }

    pub fn mask(&self, index: usize) -> Result<u8> {
        Self::check(index)?;
        Ok(self.state.lock()[index].mask)
    }

    pub fn ack_state(&self, index: usize) -> Result<AckState> {
        Self::check(index)?;
        Ok(self.state.lock()[index].ack)
    }

    /// TWS interrupt on `index`: hand the timing to the executor, disarm
    /// and acknowledge.
    pub fn on_interrupt(&self, index: usize) {
        if index >= TWS_CHANNELS {
            tracing::warn!(index, "TWS interrupt on unknown channel");
            return;
        }
        self.interrupts.fetch_add(1, Ordering::Relaxed);

        match self.read_rx(index) {
            Ok(rx) => self.hand_off(TwsEvent {
                index,
                bt_clock: rx.bt_clock,
                intra_offset: rx.intra_offset,
            }),
            Err(err) => tracing::warn!(index, error = %err, "TWS rx slot unreadable"),
        }

        let mut state = self.state.lock();
        let channel = &mut state[index];
        self.update_mask(index, channel, INNER, false);
        match self.update_tx(index, |signal| signal.ack_count = signal.ack_count.wrapping_add(1)) {
            Ok(tx) => channel.ack = AckState::AwaitingAck {
                expected: tx.ack_count,
            },
            Err(err) => tracing::warn!(index, error = %err, "TWS tx slot unwritable"),
        }
        drop(state);
        self.platform.notify();
    }

    fn hand_off(&self, event: TwsEvent) {
        let Some(events) = &self.events else {
            return;
        };
        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.overruns.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(index = event.index, "TWS callback queue full, event dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// IPC interrupt: re-arm channels whose acknowledgement the peer has
    /// echoed.
    pub fn on_ipc_interrupt(&self) {
        let mut state = self.state.lock();
        for (index, channel) in state.iter_mut().enumerate() {
            let AckState::AwaitingAck { expected } = channel.ack else {
                continue;
            };
            match self.read_rx(index) {
                Ok(rx) if rx.ack_count == expected => {
                    channel.ack = AckState::Idle;
                    self.update_mask(index, channel, INNER, true);
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(index, error = %err, "TWS rx slot unreadable"),
            }
        }
    }

    /// Forget outstanding acknowledgements after a co-processor reset.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        for (index, channel) in state.iter_mut().enumerate() {
            channel.ack = AckState::Idle;
            self.update_mask(index, channel, INNER, true);
        }
        for slots in &self.slots {
            slots.rx.write(|raw| raw.fill(0));
            slots.tx.write(|raw| raw.fill(0));
        }
    }

    pub fn interrupts(&self) -> u64 {
        self.interrupts.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

impl Drop for TwsChannels {
    fn drop(&mut self) {
        self.events.take();
        if let Some(executor) = self.executor.take() {
            if executor.thread().id() != thread::current().id() {
                let _ = executor.join();
            }
        }
    }
}
