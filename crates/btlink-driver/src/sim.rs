//! In-process stand-in for the Bluetooth co-processor.
//!
//! [`SimulatedCoprocessor`] speaks the co-processor side of every channel
//! over the same [`SharedMemory`] the driver uses. A service thread wakes on
//! the doorbell, answers the handshake, collects HCI frames and crypto
//! replies, and completes mailbox requests. The remaining hooks let tests
//! and the CLI act as the controller.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use btlink_frame::{
    decode_frame, encode_frame, packet_len, ControlKind, ControlLink, ControlMessage,
    FragmentAssembler, HciPacket, PacketType, TwsSignal, TWS_DATA_SIZE, TWS_SIGNAL_SIZE,
};
use btlink_ring::{ChannelId, Doorbell, RingChannel, RingError, SharedBlock, SharedMemory};
use bytes::BytesMut;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::crypto::{CryptoOp, CryptoResponse, CryptoStatus};
use crate::error::{DriverError, Result};
use crate::handshake::DeviceAddress;
use crate::mailbox::{MailboxFrame, MailboxStatus, MAILBOX_SIZE};
use crate::platform::{BootParams, Coprocessor, FirmwareImage, InterruptSink};
use crate::tws::{TwsSlots, TWS_CHANNELS};

const SERVICE_POLL: Duration = Duration::from_millis(20);
const WRITE_TIMEOUT: Duration = Duration::from_millis(200);

/// How the simulated co-processor answers the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyBehavior {
    #[default]
    Immediate,
    Delayed(Duration),
    /// Never reports ready.
    Never,
}

/// Answers mailbox requests: `(msg_id, param1, param2) -> result`.
pub type MailboxHandler = Arc<dyn Fn(u8, u32, u32) -> i32 + Send + Sync>;

struct PendingReply {
    op: CryptoOp,
    word1: u32,
    assembler: FragmentAssembler,
}

#[derive(Default)]
struct Peer {
    control: Option<ControlLink>,
    mailbox: Option<SharedBlock>,
    address: Option<DeviceAddress>,
    hci_rx: Option<RingChannel>,
    hci_tx: Option<RingChannel>,
    log: Option<RingChannel>,
    tws: Option<[TwsSlots; TWS_CHANNELS]>,
    log_enabled: bool,
    hci_buf: BytesMut,
    reply: Option<PendingReply>,
    handshakes: u32,
}

struct Shared {
    memory: SharedMemory,
    doorbell: Arc<Doorbell>,
    sink: RwLock<Option<Arc<dyn InterruptSink>>>,
    ready: Mutex<ReadyBehavior>,
    running: AtomicBool,
    service_started: AtomicBool,
    peer: Mutex<Peer>,
    tws_irq: [AtomicBool; TWS_CHANNELS],
    loads: AtomicU32,
    starts: AtomicU32,
    stops: AtomicU32,
    hci_out: (Sender<HciPacket>, Receiver<HciPacket>),
    crypto_out: (Sender<CryptoResponse>, Receiver<CryptoResponse>),
    mailbox_handler: Mutex<Option<MailboxHandler>>,
}

/// Simulated Bluetooth co-processor.
#[derive(Clone)]
pub struct SimulatedCoprocessor {
    shared: Arc<Shared>,
}

impl SimulatedCoprocessor {
    pub fn new(memory: SharedMemory) -> Self {
        let default_handler: MailboxHandler = Arc::new(|_, _, _| 0);
        Self {
            shared: Arc::new(Shared {
                memory,
                doorbell: Arc::new(Doorbell::new()),
                sink: RwLock::new(None),
                ready: Mutex::new(ReadyBehavior::Immediate),
                running: AtomicBool::new(false),
                service_started: AtomicBool::new(false),
                peer: Mutex::new(Peer::default()),
                tws_irq: [AtomicBool::new(false), AtomicBool::new(false)],
                loads: AtomicU32::new(0),
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                hci_out: channel::unbounded(),
                crypto_out: channel::unbounded(),
                mailbox_handler: Mutex::new(Some(default_handler)),
            }),
        }
    }

    pub fn with_ready_behavior(self, behavior: ReadyBehavior) -> Self {
        self.set_ready_behavior(behavior);
        self
    }

    pub fn set_ready_behavior(&self, behavior: ReadyBehavior) {
        *self.shared.ready.lock() = behavior;
    }

    /// `None` leaves mailbox requests unanswered.
    pub fn set_mailbox_handler(&self, handler: Option<MailboxHandler>) {
        *self.shared.mailbox_handler.lock() = handler;
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn load_count(&self) -> u32 {
        self.shared.loads.load(Ordering::Relaxed)
    }

    pub fn start_count(&self) -> u32 {
        self.shared.starts.load(Ordering::Relaxed)
    }

    pub fn stop_count(&self) -> u32 {
        self.shared.stops.load(Ordering::Relaxed)
    }

    /// Complete handshakes received.
    pub fn handshake_count(&self) -> u32 {
        self.shared.peer.lock().handshakes
    }

    /// Address announced in the last handshake.
    pub fn device_address(&self) -> Option<DeviceAddress> {
        self.shared.peer.lock().address
    }

    pub fn log_enabled(&self) -> bool {
        self.shared.peer.lock().log_enabled
    }

    pub fn tws_irq_enabled(&self, index: usize) -> bool {
        self.shared
            .tws_irq
            .get(index)
            .is_some_and(|armed| armed.load(Ordering::Acquire))
    }

    /// Send one HCI packet to the host, framed and padded.
    pub fn inject_hci(&self, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        let mut frame = BytesMut::new();
        encode_frame(packet_type, payload, &mut frame)?;
        self.inject_raw_hci(&frame)
    }

    /// Write raw bytes into the HCI rx ring and raise the IPC interrupt.
    /// Lets tests split frames at arbitrary points.
    pub fn inject_raw_hci(&self, bytes: &[u8]) -> Result<()> {
        let ring = self.peer_ring(|peer| peer.hci_rx.clone())?;
        write_all(&ring, bytes)?;
        self.shared.raise_ipc();
        Ok(())
    }

    /// Write one controller log record.
    pub fn inject_log(&self, record: &[u8]) -> Result<()> {
        let ring = self.peer_ring(|peer| peer.log.clone())?;
        write_all(&ring, record)?;
        self.shared.raise_ipc();
        Ok(())
    }

    fn peer_ring(&self, f: impl FnOnce(&Peer) -> Option<RingChannel>) -> Result<RingChannel> {
        f(&*self.shared.peer.lock())
            .ok_or_else(|| DriverError::Platform("channels not announced yet".into()))
    }

    /// Ask the driver to run `op`. DH requests carry `request` as fragments.
    pub fn request_crypto(&self, op: CryptoOp, request: &[u8]) -> Result<()> {
        let link = self
            .shared
            .peer
            .lock()
            .control
            .clone()
            .ok_or(DriverError::NotEnabled)?;
        let mut msgs = vec![ControlMessage::new(op.kind(), 0)];
        if op.is_dh() {
            msgs.extend(ControlMessage::fragments(op.kind(), request));
        }
        for msg in &msgs {
            link.post(msg)?;
        }
        self.shared.raise_ipc();
        Ok(())
    }

    /// Next crypto response sent by the driver.
    pub fn wait_crypto_reply(&self, timeout: Duration) -> Option<CryptoResponse> {
        self.shared.crypto_out.1.recv_timeout(timeout).ok()
    }

    /// Next HCI packet sent by the host.
    pub fn wait_hci(&self, timeout: Duration) -> Option<HciPacket> {
        self.shared.hci_out.1.recv_timeout(timeout).ok()
    }

    /// Raise a TWS interrupt with the given timing. Returns false if the
    /// interrupt is not armed.
    pub fn fire_tws(&self, index: usize, bt_clock: u32, intra_offset: u16) -> bool {
        if !self.tws_irq_enabled(index) {
            return false;
        }
        let Some(slots) = self.tws_slots(index) else {
            return false;
        };
        slots.rx.write(|raw| {
            let mut signal = TwsSignal::decode(raw).unwrap_or_default();
            signal.bt_clock = bt_clock;
            signal.intra_offset = intra_offset;
            raw[..TWS_SIGNAL_SIZE].copy_from_slice(&signal.encode());
        });
        let sink = self.shared.sink.read().clone();
        match sink {
            Some(sink) => {
                sink.on_tws_interrupt(index);
                true
            }
            None => false,
        }
    }

    /// Echo the driver's acknowledgement counter and raise the IPC interrupt.
    pub fn ack_tws(&self, index: usize) -> Result<()> {
        let slots = self
            .tws_slots(index)
            .ok_or(DriverError::InvalidTwsIndex(index))?;
        let tx = slots.tx.read(TwsSignal::decode)?;
        slots.rx.write(|raw| -> Result<()> {
            let mut rx = TwsSignal::decode(raw)?;
            rx.ack_count = tx.ack_count;
            raw[..TWS_SIGNAL_SIZE].copy_from_slice(&rx.encode());
            Ok(())
        })?;
        self.shared.raise_ipc();
        Ok(())
    }

    /// The driver's tx slot for channel `index`.
    pub fn tws_tx(&self, index: usize) -> Option<TwsSignal> {
        let slots = self.tws_slots(index)?;
        slots.tx.read(TwsSignal::decode).ok()
    }

    /// Leave a packet in the rx slot of channel `index` for the driver.
    pub fn tws_push_data(&self, index: usize, data: &[u8]) -> Result<()> {
        let slots = self
            .tws_slots(index)
            .ok_or(DriverError::InvalidTwsIndex(index))?;
        if data.len() > TWS_DATA_SIZE {
            return Err(DriverError::InvalidArgument(format!(
                "TWS packet of {} bytes",
                data.len()
            )));
        }
        slots.rx.write(|raw| -> Result<()> {
            let mut rx = TwsSignal::decode(raw)?;
            if rx.has_unread() {
                return Err(DriverError::TwsBusy(index));
            }
            raw[TWS_SIGNAL_SIZE..TWS_SIGNAL_SIZE + data.len()].copy_from_slice(data);
            rx.data_len = data.len() as u16;
            rx.write_count = rx.write_count.wrapping_add(1);
            raw[..TWS_SIGNAL_SIZE].copy_from_slice(&rx.encode());
            Ok(())
        })
    }

    /// Take the driver's unread packet from the tx slot of channel `index`.
    pub fn tws_take_data(&self, index: usize) -> Option<Vec<u8>> {
        let slots = self.tws_slots(index)?;
        slots.tx.write(|raw| -> Option<Vec<u8>> {
            let mut tx = TwsSignal::decode(raw).ok()?;
            if !tx.has_unread() {
                return None;
            }
            let len = usize::from(tx.data_len).min(TWS_DATA_SIZE);
            let data = raw[TWS_SIGNAL_SIZE..TWS_SIGNAL_SIZE + len].to_vec();
            tx.read_count = tx.read_count.wrapping_add(1);
            raw[..TWS_SIGNAL_SIZE].copy_from_slice(&tx.encode());
            Some(data)
        })
    }

    fn tws_slots(&self, index: usize) -> Option<TwsSlots> {
        let peer = self.shared.peer.lock();
        peer.tws.as_ref()?.get(index).cloned()
    }

    fn ensure_service(&self) -> Result<()> {
        if self.shared.service_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let weak = Arc::downgrade(&self.shared);
        let doorbell = Arc::clone(&self.shared.doorbell);
        thread::Builder::new()
            .name("btlink-sim".into())
            .spawn(move || service_loop(weak, doorbell))?;
        Ok(())
    }
}

fn service_loop(weak: Weak<Shared>, doorbell: Arc<Doorbell>) {
    loop {
        let rung = doorbell.wait(SERVICE_POLL);
        let Some(shared) = weak.upgrade() else {
            break;
        };
        if rung && shared.running.load(Ordering::Acquire) {
            shared.service();
        }
    }
    tracing::debug!("simulated co-processor stopped");
}

fn write_all(ring: &RingChannel, bytes: &[u8]) -> Result<()> {
    let deadline = Instant::now() + WRITE_TIMEOUT;
    let mut written = 0;
    while written < bytes.len() {
        written += ring.put(&bytes[written..])?;
        if written == bytes.len() {
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match ring.wait_writable(1, remaining) {
            Ok(()) => {}
            Err(RingError::Timeout { .. }) => {
                return Err(DriverError::Platform(format!(
                    "ring {} full after {written} of {} bytes",
                    ring.id(),
                    bytes.len()
                )))
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

impl Shared {
    fn raise_ipc(&self) {
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink.on_ipc_interrupt();
        }
    }

    fn lookup_ring(&self, raw: u32) -> Option<RingChannel> {
        let ring = ChannelId::from_raw(raw).and_then(|id| self.memory.ring(id).ok());
        if ring.is_none() {
            tracing::warn!(channel = raw, "handshake names an unknown ring");
        }
        ring
    }

    fn lookup_block(&self, raw: u32) -> Option<SharedBlock> {
        let block = ChannelId::from_raw(raw).and_then(|id| self.memory.block(id).ok());
        if block.is_none() {
            tracing::warn!(block = raw, "handshake names an unknown block");
        }
        block
    }

    fn service(self: &Arc<Self>) {
        let raise = {
            let mut peer = self.peer.lock();
            let raise = self.service_control(&mut peer);
            self.service_hci(&mut peer);
            self.service_mailbox(&peer);
            raise
        };
        if raise {
            self.raise_ipc();
        }
    }

    /// Returns true if a message was sent back.
    fn service_control(self: &Arc<Self>, peer: &mut Peer) -> bool {
        let Some(link) = peer.control.clone() else {
            return false;
        };
        let mut raise = false;
        loop {
            let msg = match link.try_recv() {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "simulated control read failed");
                    break;
                }
            };
            let kind = match msg.control_kind() {
                Ok(kind) => kind,
                Err(err) => {
                    tracing::warn!(error = %err, "simulated co-processor got unknown message");
                    continue;
                }
            };
            match kind {
                ControlKind::Init => {
                    peer.address = Some(DeviceAddress::from_words(msg.word(0), msg.word(1)));
                }
                ControlKind::HciBuffers => {
                    peer.hci_rx = self.lookup_ring(msg.word(0));
                    peer.hci_tx = self.lookup_ring(msg.word(1));
                    peer.log = self.lookup_ring(msg.word(2));
                    peer.hci_buf.clear();
                }
                ControlKind::TwsBuffers => {
                    let slot = |rx, tx| {
                        Some(TwsSlots {
                            rx: self.lookup_block(rx)?,
                            tx: self.lookup_block(tx)?,
                        })
                    };
                    peer.tws = match (slot(msg.word(0), msg.word(1)), slot(msg.word(2), msg.word(3))) {
                        (Some(a), Some(b)) => Some([a, b]),
                        _ => None,
                    };
                    peer.handshakes += 1;
                    raise |= self.answer_handshake(&link);
                }
                ControlKind::LogOn => peer.log_enabled = true,
                ControlKind::LogOff => peer.log_enabled = false,
                ControlKind::HciReady => {
                    tracing::warn!("simulated co-processor got its own ready message");
                }
                ControlKind::GenP192PublicKey
                | ControlKind::GenP192DhKey
                | ControlKind::GenP256PublicKey
                | ControlKind::GenP256DhKey => {
                    if let Some(op) = CryptoOp::from_kind(kind) {
                        self.on_crypto_reply(peer, op, &msg);
                    }
                }
            }
        }
        raise
    }

    fn answer_handshake(self: &Arc<Self>, link: &ControlLink) -> bool {
        let ready = ControlMessage::new(ControlKind::HciReady, 0);
        match *self.ready.lock() {
            ReadyBehavior::Immediate => match link.send(&ready) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(error = %err, "simulated ready message not sent");
                    false
                }
            },
            ReadyBehavior::Delayed(delay) => {
                let shared = Arc::clone(self);
                let link = link.clone();
                thread::spawn(move || {
                    thread::sleep(delay);
                    if shared.running.load(Ordering::Acquire) && link.send(&ready).is_ok() {
                        shared.raise_ipc();
                    }
                });
                false
            }
            ReadyBehavior::Never => false,
        }
    }

    fn on_crypto_reply(&self, peer: &mut Peer, op: CryptoOp, msg: &ControlMessage) {
        if msg.fragment == 0 {
            let status = CryptoStatus::from_code(msg.word(0) as i32);
            let word1 = msg.word(1);
            if status == CryptoStatus::Success {
                peer.reply = Some(PendingReply {
                    op,
                    word1,
                    assembler: FragmentAssembler::new(op.kind(), op.response_len()),
                });
            } else {
                let _ = self.crypto_out.0.send(CryptoResponse::failure(op, status, word1));
            }
            return;
        }

        let Some(reply) = peer.reply.as_mut() else {
            tracing::warn!(%op, fragment = msg.fragment, "crypto fragment with no reply pending");
            return;
        };
        if reply.assembler.push(msg) {
            if let Some(reply) = peer.reply.take() {
                let _ = self.crypto_out.0.send(CryptoResponse {
                    op: reply.op,
                    status: CryptoStatus::Success,
                    word1: reply.word1,
                    payload: reply.assembler.into_data(),
                });
            }
        }
    }

    fn service_hci(&self, peer: &mut Peer) {
        let Some(ring) = peer.hci_tx.clone() else {
            return;
        };
        loop {
            match ring.get(usize::MAX) {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => peer.hci_buf.extend_from_slice(&chunk),
                Err(err) => {
                    tracing::warn!(error = %err, "simulated HCI read failed");
                    return;
                }
            }
        }

        loop {
            let (header, body) = match decode_frame(&mut peer.hci_buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "simulated HCI frame undecodable");
                    peer.hci_buf.clear();
                    break;
                }
            };
            let packet_type = match header.packet_type() {
                Ok(packet_type) => packet_type,
                Err(err) => {
                    tracing::warn!(error = %err, "simulated co-processor dropped frame");
                    continue;
                }
            };
            let len = packet_len(packet_type, &body)
                .unwrap_or(body.len())
                .min(body.len());
            let _ = self
                .hci_out
                .0
                .send(HciPacket::new(packet_type, body.slice(..len)));
        }
    }

    fn service_mailbox(&self, peer: &Peer) {
        let Some(block) = &peer.mailbox else {
            return;
        };
        let Some(handler) = self.mailbox_handler.lock().clone() else {
            return;
        };
        block.write(|raw| {
            let Some(mut frame) = MailboxFrame::decode(raw) else {
                return;
            };
            if frame.status != MailboxStatus::New {
                return;
            }
            frame.result = handler(frame.msg_id, frame.param1, frame.param2);
            frame.status = MailboxStatus::Complete;
            raw[..MAILBOX_SIZE].copy_from_slice(&frame.encode());
        });
    }
}

impl Coprocessor for SimulatedCoprocessor {
    fn load(&self, image: &FirmwareImage) -> Result<()> {
        if image.size == 0 {
            return Err(DriverError::Platform("empty firmware image".into()));
        }
        self.shared.loads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            load_address = image.load_address,
            size = image.size,
            "simulated image load"
        );
        Ok(())
    }

    fn start(&self, params: &BootParams) -> Result<()> {
        let memory = &self.shared.memory;
        let to_coprocessor = memory.ring(params.control_tx)?;
        let from_coprocessor = memory.ring(params.control_rx)?;
        let mailbox = memory.block(params.mailbox)?;
        {
            let mut peer = self.shared.peer.lock();
            peer.control = Some(ControlLink::new(
                from_coprocessor,
                to_coprocessor,
                WRITE_TIMEOUT,
            ));
            peer.mailbox = Some(mailbox);
        }
        self.ensure_service()?;
        self.shared.running.store(true, Ordering::Release);
        self.shared.starts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::Release);
        self.shared.stops.fetch_add(1, Ordering::Relaxed);
        let mut peer = self.shared.peer.lock();
        peer.hci_buf.clear();
        peer.reply = None;
        Ok(())
    }

    fn doorbell(&self) -> Arc<Doorbell> {
        Arc::clone(&self.shared.doorbell)
    }

    fn attach(&self, sink: Arc<dyn InterruptSink>) {
        *self.shared.sink.write() = Some(sink);
    }

    fn detach(&self) {
        *self.shared.sink.write() = None;
    }

    fn set_tws_irq(&self, index: usize, enabled: bool) {
        if let Some(armed) = self.shared.tws_irq.get(index) {
            armed.store(enabled, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_requires_known_channels() {
        let sim = SimulatedCoprocessor::new(SharedMemory::new());
        let bogus = ChannelId::from_raw(99).unwrap();
        let params = BootParams {
            control_tx: bogus,
            control_rx: bogus,
            mailbox: bogus,
        };
        assert!(matches!(sim.start(&params), Err(DriverError::Ring(_))));
        assert!(!sim.is_running());
    }

    #[test]
    fn empty_image_rejected() {
        let sim = SimulatedCoprocessor::new(SharedMemory::new());
        let image = FirmwareImage {
            load_address: 0,
            size: 0,
        };
        assert!(sim.load(&image).is_err());
        assert_eq!(sim.load_count(), 0);
    }

    #[test]
    fn hooks_need_handshake() {
        let sim = SimulatedCoprocessor::new(SharedMemory::new());
        assert!(sim.inject_hci(PacketType::Event, &[0x0e, 0x00]).is_err());
        assert!(!sim.fire_tws(0, 1, 2));
        assert!(sim.tws_tx(0).is_none());
    }
}
