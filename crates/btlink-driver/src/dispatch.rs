//! Receive-side dispatch thread.
//!
//! The interrupt path only bumps counters and posts a permit. The thread
//! takes one permit per unit of work, services HCI before logs and yields
//! after each unit.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use btlink_frame::{HciReassembler, Step};
use btlink_ring::RingChannel;
use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::host::{format_log_record, HciHost, LogSink};
use crate::stats::Counters;

const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Counting signal fed by the HCI and log activity counters.
#[derive(Debug, Default)]
pub struct ActivitySignal {
    hci: AtomicU32,
    log: AtomicU32,
    permits: Mutex<u32>,
    cv: Condvar,
    shutdown: AtomicBool,
}

impl ActivitySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post_hci(&self) {
        self.hci.fetch_add(1, Ordering::AcqRel);
        self.release();
    }

    pub fn post_log(&self) {
        self.log.fetch_add(1, Ordering::AcqRel);
        self.release();
    }

    /// Post HCI activity unless a unit is already queued.
    pub fn post_hci_if_idle(&self) {
        if self.hci.load(Ordering::Acquire) == 0 {
            self.post_hci();
        }
    }

    pub fn post_log_if_idle(&self) {
        if self.log.load(Ordering::Acquire) == 0 {
            self.post_log();
        }
    }

    pub fn hci_pending(&self) -> u32 {
        self.hci.load(Ordering::Acquire)
    }

    pub fn log_pending(&self) -> u32 {
        self.log.load(Ordering::Acquire)
    }

    fn release(&self) {
        *self.permits.lock() += 1;
        self.cv.notify_one();
    }

    /// Take one permit, waiting at most `timeout`.
    fn acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.cv.wait_for(&mut permits, deadline - now);
        }
        *permits -= 1;
        true
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.release();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Rings the dispatch thread reads from.
#[derive(Debug, Clone)]
pub(crate) struct RxRings {
    pub hci: RingChannel,
    pub log: RingChannel,
}

/// Everything the dispatch thread touches. Outlives any one set of rings.
pub(crate) struct RxPath {
    pub signal: ActivitySignal,
    rings: Mutex<Option<RxRings>>,
    reassembler: Mutex<HciReassembler>,
    host: Mutex<Option<Arc<dyn HciHost>>>,
    log_sink: Mutex<Arc<dyn LogSink>>,
    log_record_size: usize,
    counters: Arc<Counters>,
}

impl RxPath {
    pub fn new(log_sink: Arc<dyn LogSink>, log_record_size: usize, counters: Arc<Counters>) -> Self {
        Self {
            signal: ActivitySignal::new(),
            rings: Mutex::new(None),
            reassembler: Mutex::new(HciReassembler::new()),
            host: Mutex::new(None),
            log_sink: Mutex::new(log_sink),
            log_record_size: log_record_size.max(1),
            counters,
        }
    }

    pub fn attach(&self, rings: RxRings) {
        self.reassembler.lock().reset();
        *self.rings.lock() = Some(rings);
    }

    pub fn detach(&self) {
        *self.rings.lock() = None;
        *self.host.lock() = None;
        self.reassembler.lock().reset();
    }

    pub fn set_host(&self, host: Arc<dyn HciHost>) {
        *self.host.lock() = Some(host);
    }

    pub fn set_log_sink(&self, sink: Arc<dyn LogSink>) {
        *self.log_sink.lock() = sink;
    }

    /// Drop any half-assembled frame.
    pub fn reset_cursor(&self) {
        self.reassembler.lock().reset();
    }

    /// Called from the interrupt path.
    pub fn on_interrupt(&self) {
        let Some(rings) = self.rings.lock().clone() else {
            return;
        };
        if rings.hci.pending() {
            self.signal.post_hci_if_idle();
        }
        if rings.log.pending() {
            self.signal.post_log_if_idle();
        }
    }

    /// One unit of work. Returns false once shut down.
    fn run_once(&self) -> bool {
        if !self.signal.acquire(IDLE_WAIT) {
            return !self.signal.is_shutdown();
        }
        if self.signal.is_shutdown() {
            return false;
        }
        if ActivitySignal::take(&self.signal.hci) {
            self.service_hci();
        } else if ActivitySignal::take(&self.signal.log) {
            self.service_log();
        }
        true
    }

    fn service_hci(&self) {
        let Some(rings) = self.rings.lock().clone() else {
            return;
        };
        let host = self.host.lock().clone();

        let step = self.reassembler.lock().step(&rings.hci, |req| {
            let host = host.as_ref()?;
            host.get_buffer(req.packet_type, req.event_code, req.size)
        });

        match step {
            Ok(Step::NeedMore) => return,
            Ok(Step::Delivered(packet)) => {
                Counters::bump(&self.counters.hci_received);
                tracing::debug!(
                    packet_type = %packet.packet_type,
                    len = packet.len(),
                    "HCI packet received"
                );
                if let Some(host) = &host {
                    host.on_receive(packet);
                }
            }
            Ok(Step::Dropped(err)) => {
                Counters::bump(&self.counters.hci_dropped);
                tracing::warn!(error = %err, "HCI frame dropped");
                if let Some(host) = &host {
                    host.on_dropped(&err);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "HCI rx ring read failed");
                return;
            }
        }

        // Back-to-back frames: the interrupt for the next one may have been
        // coalesced with this one.
        if rings.hci.pending() {
            self.signal.post_hci_if_idle();
        }
    }

    fn service_log(&self) {
        let Some(rings) = self.rings.lock().clone() else {
            return;
        };
        let mut record = vec![0u8; self.log_record_size];
        match rings.log.get_into(&mut record) {
            Ok(0) => {}
            Ok(n) => {
                Counters::bump(&self.counters.log_lines);
                let line = format_log_record(&record[..n]);
                let sink = self.log_sink.lock().clone();
                sink.log_line(&line);
                if rings.log.pending() {
                    self.signal.post_log_if_idle();
                }
            }
            Err(err) => tracing::warn!(error = %err, "log ring read failed"),
        }
    }
}

/// Start the dispatch thread over `path`.
pub(crate) fn spawn(path: Arc<RxPath>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("btlink-dispatch".into())
        .spawn(move || {
            tracing::debug!("dispatch thread started");
            while path.run_once() {
                thread::yield_now();
            }
            tracing::debug!("dispatch thread stopped");
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use btlink_frame::{encode_frame, FrameError, HciPacket, PacketType};
    use btlink_ring::{ChannelId, Direction};
    use bytes::BytesMut;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        packets: Mutex<Vec<HciPacket>>,
        dropped: Mutex<Vec<String>>,
        refuse: AtomicBool,
    }

    impl HciHost for Recorder {
        fn get_buffer(
            &self,
            _packet_type: btlink_frame::PacketType,
            _event_code: Option<u8>,
            len: usize,
        ) -> Option<BytesMut> {
            if self.refuse.load(Ordering::SeqCst) {
                None
            } else {
                Some(BytesMut::with_capacity(len))
            }
        }

        fn on_receive(&self, packet: HciPacket) {
            self.packets.lock().push(packet);
        }

        fn on_dropped(&self, error: &FrameError) {
            self.dropped.lock().push(error.to_string());
        }
    }

    #[derive(Default)]
    struct Lines(Mutex<Vec<String>>);

    impl LogSink for Lines {
        fn log_line(&self, line: &str) {
            self.0.lock().push(line.to_string());
        }
    }

    struct Fixture {
        path: Arc<RxPath>,
        hci: RingChannel,
        log: RingChannel,
        host: Arc<Recorder>,
        lines: Arc<Lines>,
        thread: Option<JoinHandle<()>>,
    }

    impl Fixture {
        fn new() -> Self {
            let id = |n| ChannelId::from_raw(n).unwrap();
            let hci = RingChannel::new(id(1), Direction::FromCoprocessor, 256, None).unwrap();
            let log = RingChannel::new(id(2), Direction::FromCoprocessor, 256, None).unwrap();
            let lines = Arc::new(Lines::default());
            let path = Arc::new(RxPath::new(lines.clone(), 256, Arc::default()));
            let host = Arc::new(Recorder::default());
            path.attach(RxRings {
                hci: hci.clone(),
                log: log.clone(),
            });
            path.set_host(host.clone());
            let thread = Some(spawn(Arc::clone(&path)).unwrap());
            Self {
                path,
                hci,
                log,
                host,
                lines,
                thread,
            }
        }

        fn wait_for(&self, what: impl Fn() -> bool) -> bool {
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                if what() {
                    return true;
                }
                thread::sleep(Duration::from_millis(2));
            }
            false
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.path.signal.shutdown();
            if let Some(thread) = self.thread.take() {
                thread.join().unwrap();
            }
        }
    }

    #[test]
    fn take_never_underflows() {
        let counter = AtomicU32::new(1);
        assert!(ActivitySignal::take(&counter));
        assert!(!ActivitySignal::take(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn back_to_back_frames_from_one_interrupt() {
        let fx = Fixture::new();
        let mut buf = BytesMut::new();
        encode_frame(PacketType::Event, &[0x0e, 0x01, 0x01], &mut buf).unwrap();
        encode_frame(PacketType::Event, &[0x0f, 0x01, 0x02], &mut buf).unwrap();
        encode_frame(PacketType::Event, &[0x13, 0x01, 0x03], &mut buf).unwrap();
        assert_eq!(fx.hci.put(&buf).unwrap(), buf.len());

        fx.path.on_interrupt();
        assert!(fx.wait_for(|| fx.host.packets.lock().len() == 3));
        let codes: Vec<_> = fx
            .host
            .packets
            .lock()
            .iter()
            .map(|p| p.event_code().unwrap())
            .collect();
        assert_eq!(codes, [0x0e, 0x0f, 0x13]);
    }

    #[test]
    fn missing_buffer_reported_to_host() {
        let fx = Fixture::new();
        fx.host.refuse.store(true, Ordering::SeqCst);
        let mut buf = BytesMut::new();
        encode_frame(PacketType::Event, &[0x0e, 0x01, 0x01], &mut buf).unwrap();
        fx.hci.put(&buf).unwrap();

        fx.path.on_interrupt();
        assert!(fx.wait_for(|| fx.host.dropped.lock().len() == 1));
        assert!(fx.host.packets.lock().is_empty());
        assert!(fx.hci.is_empty());
    }

    #[test]
    fn log_records_are_prefixed() {
        let fx = Fixture::new();
        fx.log.put(b"scan start").unwrap();
        fx.path.on_interrupt();
        assert!(fx.wait_for(|| fx.lines.0.lock().len() == 1));
        assert_eq!(fx.lines.0.lock()[0], "<CT-I>scan start");
    }

    #[test]
    fn detached_path_ignores_interrupts() {
        let fx = Fixture::new();
        fx.path.detach();
        fx.hci.put(&[4, 0, 4, 0]).unwrap();
        fx.path.on_interrupt();
        assert_eq!(fx.path.signal.hci_pending(), 0);
    }
}
