//! Lifecycle controller.
//!
//! A [`Driver`] owns every channel it shares with the co-processor. The first
//! `initialize` creates them and starts the dispatch thread; later calls only
//! (re)boot the co-processor if it is not ready. All lifecycle operations are
//! serialised by one lock, which the interrupt path never takes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use btlink_frame::{ControlLink, HciWriter, PacketType, TWS_SLOT_SIZE};
use btlink_ring::{ChannelId, Direction, Doorbell, RingChannel, SharedBlock, SharedMemory};
use crossbeam::atomic::AtomicCell;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::DriverConfig;
use crate::control::ControlDispatcher;
use crate::dispatch::{self, RxPath, RxRings};
use crate::error::{DriverError, Result};
use crate::handshake::{handshake_messages, log_control_message, DeviceAddress, HandshakeChannels};
use crate::host::{HciHost, LogSink, TracingLogSink};
use crate::mailbox::{Mailbox, MAILBOX_SIZE};
use crate::platform::{BootParams, Coprocessor, InterruptSink};
use crate::stats::{Counters, DriverStats};
use crate::tws::{TwsChannels, TwsSlots, TWS_CHANNELS};

/// Where the driver is in bringing the co-processor up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Uninitialized,
    ChannelsCreated,
    ImageLoaded,
    Started,
    Ready,
    Running,
    Reset,
    Exited,
}

impl Lifecycle {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::ChannelsCreated => "channels_created",
            Self::ImageLoaded => "image_loaded",
            Self::Started => "started",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Reset => "reset",
            Self::Exited => "exited",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every ring and block shared with the co-processor.
#[derive(Debug, Clone)]
struct Channels {
    control_tx: RingChannel,
    control_rx: RingChannel,
    hci_rx: RingChannel,
    hci_tx: RingChannel,
    log_rx: RingChannel,
    tws: [TwsSlots; TWS_CHANNELS],
    mailbox: SharedBlock,
}

impl Channels {
    fn create(memory: &SharedMemory, config: &DriverConfig, doorbell: Arc<Doorbell>) -> Result<Self> {
        let mut created = Vec::new();
        let result = Self::create_tracked(memory, config, doorbell, &mut created);
        if result.is_err() {
            for id in created {
                let _ = memory.destroy(id);
            }
        }
        result
    }

    fn create_tracked(
        memory: &SharedMemory,
        config: &DriverConfig,
        doorbell: Arc<Doorbell>,
        created: &mut Vec<ChannelId>,
    ) -> Result<Self> {
        let mut ring = |direction: Direction, capacity: usize| -> Result<RingChannel> {
            let doorbell = match direction {
                Direction::ToCoprocessor => Some(Arc::clone(&doorbell)),
                Direction::FromCoprocessor => None,
            };
            let ring = memory.create_ring(direction, capacity, doorbell)?;
            created.push(ring.id());
            Ok(ring)
        };
        let control_tx = ring(Direction::ToCoprocessor, config.control_ring_size)?;
        let control_rx = ring(Direction::FromCoprocessor, config.control_ring_size)?;
        let hci_rx = ring(Direction::FromCoprocessor, config.hci_rx_ring_size)?;
        let hci_tx = ring(Direction::ToCoprocessor, config.hci_tx_ring_size)?;
        let log_rx = ring(Direction::FromCoprocessor, config.log_ring_size)?;

        let mut block = |size: usize| -> Result<SharedBlock> {
            let block = memory.create_block(size)?;
            created.push(block.id());
            Ok(block)
        };
        let tws = [
            TwsSlots {
                rx: block(TWS_SLOT_SIZE)?,
                tx: block(TWS_SLOT_SIZE)?,
            },
            TwsSlots {
                rx: block(TWS_SLOT_SIZE)?,
                tx: block(TWS_SLOT_SIZE)?,
            },
        ];
        let mailbox = block(MAILBOX_SIZE)?;

        Ok(Self {
            control_tx,
            control_rx,
            hci_rx,
            hci_tx,
            log_rx,
            tws,
            mailbox,
        })
    }

    fn ids(&self) -> Vec<ChannelId> {
        let mut ids = vec![
            self.control_tx.id(),
            self.control_rx.id(),
            self.hci_rx.id(),
            self.hci_tx.id(),
            self.log_rx.id(),
        ];
        for slots in &self.tws {
            ids.push(slots.rx.id());
            ids.push(slots.tx.id());
        }
        ids.push(self.mailbox.id());
        ids
    }

    fn boot_params(&self) -> BootParams {
        BootParams {
            control_tx: self.control_tx.id(),
            control_rx: self.control_rx.id(),
            mailbox: self.mailbox.id(),
        }
    }

    fn handshake(&self) -> HandshakeChannels {
        HandshakeChannels {
            hci_rx: self.hci_rx.id(),
            hci_tx: self.hci_tx.id(),
            log_rx: self.log_rx.id(),
            tws: [
                (self.tws[0].rx.id(), self.tws[0].tx.id()),
                (self.tws[1].rx.id(), self.tws[1].tx.id()),
            ],
        }
    }

    fn reset_rings(&self) {
        for ring in [
            &self.control_tx,
            &self.control_rx,
            &self.hci_rx,
            &self.hci_tx,
            &self.log_rx,
        ] {
            ring.reset();
        }
    }

    fn destroy(&self, memory: &SharedMemory) {
        for id in self.ids() {
            if let Err(err) = memory.destroy(id) {
                tracing::warn!(channel = %id, error = %err, "channel already gone");
            }
        }
    }
}

/// State that exists while the driver is enabled.
struct Runtime {
    channels: Channels,
    control: Arc<ControlDispatcher>,
    writer: Mutex<HciWriter>,
    tws: TwsChannels,
    mailbox: Mailbox,
}

impl Runtime {
    fn new(inner: &Inner, channels: &Channels) -> Result<Self> {
        let config = &inner.config;
        let link = ControlLink::new(
            channels.control_tx.clone(),
            channels.control_rx.clone(),
            config.send_timeout(),
        );
        Ok(Self {
            channels: channels.clone(),
            control: ControlDispatcher::spawn(link, config.fragment_timeout())?,
            writer: Mutex::new(HciWriter::with_config(
                channels.hci_tx.clone(),
                config.writer_config(),
            )),
            tws: TwsChannels::new(
                Arc::clone(&inner.platform),
                channels.tws.clone(),
                config.tws_queue_depth,
            )?,
            mailbox: Mailbox::new(
                channels.mailbox.clone(),
                config.mailbox_timeout(),
                config.mailbox_poll_interval(),
            ),
        })
    }
}

struct Inner {
    platform: Arc<dyn Coprocessor>,
    memory: SharedMemory,
    config: DriverConfig,
    address: DeviceAddress,
    lifecycle: Mutex<()>,
    state: AtomicCell<Lifecycle>,
    runtime: RwLock<Option<Arc<Runtime>>>,
    rx: Arc<RxPath>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    controller_log: AtomicBool,
}

impl Inner {
    fn runtime(&self) -> Option<Arc<Runtime>> {
        self.runtime.read().clone()
    }

    fn enable(self: &Arc<Self>, host: Arc<dyn HciHost>) -> Result<Arc<Runtime>> {
        let channels = Channels::create(&self.memory, &self.config, self.platform.doorbell())?;
        let runtime = match Runtime::new(self, &channels) {
            Ok(runtime) => Arc::new(runtime),
            Err(err) => {
                channels.destroy(&self.memory);
                return Err(err);
            }
        };

        self.rx.set_host(host);
        self.rx.attach(RxRings {
            hci: channels.hci_rx.clone(),
            log: channels.log_rx.clone(),
        });
        *self.runtime.write() = Some(Arc::clone(&runtime));
        self.platform.attach(Arc::new(IrqSink(Arc::downgrade(self))));

        {
            let mut dispatch = self.dispatch.lock();
            if dispatch.is_none() {
                *dispatch = Some(dispatch::spawn(Arc::clone(&self.rx))?);
            }
        }

        runtime.tws.enable_inner();
        self.state.store(Lifecycle::ChannelsCreated);
        tracing::info!(channels = channels.ids().len(), "channels created");
        Ok(runtime)
    }

    /// Load, start, handshake, then wait for ready.
    fn boot(&self, runtime: &Runtime) -> Result<()> {
        let config = &self.config;
        self.platform.load(&config.firmware)?;
        self.state.store(Lifecycle::ImageLoaded);
        tracing::debug!(
            load_address = config.firmware.load_address,
            size = config.firmware.size,
            "firmware image loaded"
        );

        self.platform.start(&runtime.channels.boot_params())?;
        self.state.store(Lifecycle::Started);

        let messages = handshake_messages(&self.address, &runtime.channels.handshake());
        runtime.control.link().send_all(&messages)?;

        let timeout = config.ready_timeout();
        if !runtime.control.ready().wait(timeout) {
            tracing::error!(?timeout, "co-processor did not report ready");
            return Err(DriverError::ReadyTimeout(timeout));
        }
        self.state.store(Lifecycle::Ready);

        if self.controller_log.load(Ordering::Acquire) {
            let msg = log_control_message(true, runtime.channels.log_rx.id());
            runtime.control.link().send(&msg)?;
        }
        self.state.store(Lifecycle::Running);
        tracing::info!(address = %self.address, "co-processor running");
        Ok(())
    }

    fn on_ipc_interrupt(&self) {
        Counters::bump(&self.counters.ipc_interrupts);
        let Some(runtime) = self.runtime() else {
            return;
        };
        runtime.control.dispatch();
        self.rx.on_interrupt();
        runtime.tws.on_ipc_interrupt();
    }

    fn on_tws_interrupt(&self, index: usize) {
        if let Some(runtime) = self.runtime() {
            runtime.tws.on_interrupt(index);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.rx.signal.shutdown();
        if let Some(dispatch) = self.dispatch.lock().take() {
            if dispatch.thread().id() != thread::current().id() {
                let _ = dispatch.join();
            }
        }
    }
}

struct IrqSink(Weak<Inner>);

impl InterruptSink for IrqSink {
    fn on_ipc_interrupt(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.on_ipc_interrupt();
        }
    }

    fn on_tws_interrupt(&self, index: usize) {
        if let Some(inner) = self.0.upgrade() {
            inner.on_tws_interrupt(index);
        }
    }
}

/// Bluetooth co-processor driver.
///
/// Cheap to clone; clones share one driver. The dispatch thread stops when
/// the last clone is dropped.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<Inner>,
}

impl Driver {
    pub fn new(
        platform: Arc<dyn Coprocessor>,
        memory: SharedMemory,
        config: DriverConfig,
    ) -> Result<Self> {
        let address = config.device_address()?;
        let counters = Arc::new(Counters::default());
        let rx = Arc::new(RxPath::new(
            Arc::new(TracingLogSink),
            config.log_record_size,
            Arc::clone(&counters),
        ));
        let controller_log = AtomicBool::new(config.controller_log);
        Ok(Self {
            inner: Arc::new(Inner {
                platform,
                memory,
                config,
                address,
                lifecycle: Mutex::new(()),
                state: AtomicCell::new(Lifecycle::Uninitialized),
                runtime: RwLock::new(None),
                rx,
                dispatch: Mutex::new(None),
                counters,
                controller_log,
            }),
        })
    }

    /// Bring the co-processor up.
    ///
    /// The first call needs a host and creates all channels; later calls
    /// reuse them and return at once if the co-processor is already ready.
    /// Passing a host on a later call replaces the current one.
    pub fn initialize(&self, host: Option<Arc<dyn HciHost>>) -> Result<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock();

        let runtime = match inner.runtime() {
            Some(runtime) => {
                if let Some(host) = host {
                    inner.rx.set_host(host);
                }
                runtime
            }
            None => {
                let host = host.ok_or(DriverError::HostRequired)?;
                inner.enable(host)?
            }
        };

        if runtime.control.ready().is_set() {
            return Ok(());
        }
        inner.boot(&runtime)
    }

    /// Stop the co-processor and run the boot sequence again over the same
    /// channels, with their contents discarded.
    pub fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock();
        let runtime = inner.runtime().ok_or(DriverError::NotEnabled)?;

        runtime.control.ready().clear();
        runtime.control.offload().cancel();
        inner.state.store(Lifecycle::Reset);
        Counters::bump(&inner.counters.resets);
        tracing::info!("resetting co-processor");

        inner.platform.stop()?;
        runtime.channels.reset_rings();
        inner.rx.reset_cursor();
        runtime.tws.reset();
        inner.boot(&runtime)
    }

    /// Stop the co-processor and release every channel.
    pub fn exit(&self) -> Result<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock();
        let runtime = inner
            .runtime
            .write()
            .take()
            .ok_or(DriverError::NotEnabled)?;

        runtime.control.ready().clear();
        runtime.control.offload().cancel();
        let stopped = inner.platform.stop();
        inner.platform.detach();
        runtime.tws.disable_all();
        runtime.tws.clear_callbacks();
        inner.rx.detach();
        runtime.channels.destroy(&inner.memory);
        inner.state.store(Lifecycle::Exited);
        tracing::info!("driver exited");
        stopped
    }

    /// Send one HCI packet to the controller.
    pub fn send(&self, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(DriverError::InvalidArgument("empty HCI packet".into()));
        }
        let runtime = self.inner.runtime().ok_or(DriverError::NotReady)?;
        if !runtime.control.ready().is_set() {
            return Err(DriverError::NotReady);
        }
        runtime.writer.lock().send(packet_type, payload)?;
        Counters::bump(&self.inner.counters.hci_sent);
        tracing::trace!(%packet_type, data = %hex::encode(payload), "HCI packet sent");
        Ok(())
    }

    fn tws_runtime(&self, index: usize) -> Result<Arc<Runtime>> {
        if index >= TWS_CHANNELS {
            return Err(DriverError::InvalidTwsIndex(index));
        }
        self.inner.runtime().ok_or(DriverError::NotEnabled)
    }

    pub fn tws_enable(&self, index: usize) -> Result<()> {
        self.tws_runtime(index)?.tws.enable(index)
    }

    pub fn tws_disable(&self, index: usize) -> Result<()> {
        self.tws_runtime(index)?.tws.disable(index)
    }

    /// Run `callback(bt_clock, intra_offset)` on every TWS interrupt of
    /// channel `index`. Callbacks run on a dedicated thread.
    pub fn tws_register_callback<F>(&self, index: usize, callback: F) -> Result<()>
    where
        F: Fn(u32, u16) + Send + Sync + 'static,
    {
        self.tws_runtime(index)?
            .tws
            .register_callback(index, Some(Arc::new(callback)))
    }

    pub fn tws_set_mode(&self, index: usize, mode: u8) -> Result<()> {
        self.tws_runtime(index)?.tws.set_mode(index, mode)
    }

    /// Copy the packet the co-processor left on channel `index` into `buf`
    /// and return its length.
    pub fn tws_data_read(&self, index: usize, buf: &mut [u8]) -> Result<usize> {
        self.tws_runtime(index)?.tws.data_read(index, buf)
    }

    /// Leave `data` on channel `index` for the co-processor. Only one
    /// packet may be outstanding.
    pub fn tws_data_write(&self, index: usize, data: &[u8]) -> Result<usize> {
        self.tws_runtime(index)?.tws.data_write(index, data)
    }

    /// Route controller logs to the log ring (`true`) or the controller's
    /// UART. Applied at once if running, otherwise at the next boot.
    pub fn set_controller_log(&self, enabled: bool) -> Result<()> {
        self.inner.controller_log.store(enabled, Ordering::Release);
        let Some(runtime) = self.inner.runtime() else {
            return Ok(());
        };
        if !runtime.control.ready().is_set() {
            return Ok(());
        }
        let msg = log_control_message(enabled, runtime.channels.log_rx.id());
        runtime.control.link().send(&msg)?;
        Ok(())
    }

    /// Replace the destination of controller log lines.
    pub fn set_log_sink(&self, sink: Arc<dyn LogSink>) {
        self.inner.rx.set_log_sink(sink);
    }

    /// Synchronous request through the shared mailbox.
    pub fn mailbox_send_sync(&self, msg_id: u8, param1: u32, param2: u32) -> Result<i32> {
        let runtime = self.inner.runtime().ok_or(DriverError::NotEnabled)?;
        let platform = &self.inner.platform;
        runtime
            .mailbox
            .send_sync(msg_id, param1, param2, || platform.notify())
    }

    pub fn state(&self) -> Lifecycle {
        self.inner.state.load()
    }

    pub fn is_ready(&self) -> bool {
        self.inner
            .runtime()
            .is_some_and(|runtime| runtime.control.ready().is_set())
    }

    pub fn crypto_pending(&self) -> bool {
        self.inner
            .runtime()
            .is_some_and(|runtime| runtime.control.offload().is_pending())
    }

    pub fn address(&self) -> DeviceAddress {
        self.inner.address
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> DriverStats {
        let inner = &self.inner;
        let counters = &inner.counters;
        let runtime = inner.runtime();
        DriverStats {
            ipc_interrupts: Counters::get(&counters.ipc_interrupts),
            hci_received: Counters::get(&counters.hci_received),
            hci_dropped: Counters::get(&counters.hci_dropped),
            hci_sent: Counters::get(&counters.hci_sent),
            log_lines: Counters::get(&counters.log_lines),
            crypto_completed: runtime
                .as_ref()
                .map_or(0, |rt| rt.control.offload().completed()),
            control_ignored: runtime.as_ref().map_or(0, |rt| rt.control.ignored()),
            tws_interrupts: runtime.as_ref().map_or(0, |rt| rt.tws.interrupts()),
            tws_overruns: runtime.as_ref().map_or(0, |rt| rt.tws.overruns()),
            resets: Counters::get(&counters.resets),
            channels_created: inner.memory.created_count(),
            channels_live: inner.memory.live_count(),
        }
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .finish()
    }
}
