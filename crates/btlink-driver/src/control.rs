use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use btlink_frame::{ControlKind, ControlLink, ControlMessage};
use parking_lot::Mutex;

use crate::crypto::CryptoOp;
use crate::error::Result;
use crate::handshake::ReadySignal;
use crate::offload::CryptoOffload;

/// Reads the co-processor's control ring and routes each message.
///
/// Only one caller drains the ring at a time; others return immediately.
/// While a crypto request is pending nothing is read, so the request's
/// fragments stay queued for the offload worker.
pub struct ControlDispatcher {
    link: ControlLink,
    draining: Mutex<()>,
    ready: ReadySignal,
    offload: CryptoOffload,
    ignored: AtomicU64,
}

impl ControlDispatcher {
    pub fn spawn(link: ControlLink, fragment_timeout: Duration) -> Result<Arc<Self>> {
        let this: Arc<Mutex<Weak<ControlDispatcher>>> = Arc::new(Mutex::new(Weak::new()));
        let retrigger = Arc::clone(&this);
        let offload = CryptoOffload::spawn(link.clone(), fragment_timeout, move |stray| {
            let dispatcher = retrigger.lock().upgrade();
            if let Some(dispatcher) = dispatcher {
                if let Some(msg) = stray {
                    dispatcher.handle(&msg);
                }
                dispatcher.dispatch();
            }
        })?;

        let dispatcher = Arc::new(Self {
            link,
            draining: Mutex::new(()),
            ready: ReadySignal::new(),
            offload,
            ignored: AtomicU64::new(0),
        });
        *this.lock() = Arc::downgrade(&dispatcher);
        Ok(dispatcher)
    }

    pub fn link(&self) -> &ControlLink {
        &self.link
    }

    pub fn ready(&self) -> &ReadySignal {
        &self.ready
    }

    pub fn offload(&self) -> &CryptoOffload {
        &self.offload
    }

    /// Messages that arrived with a type the driver does not handle.
    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    /// Drain queued control messages.
    pub fn dispatch(&self) {
        loop {
            {
                let Some(_guard) = self.draining.try_lock() else {
                    return;
                };
                self.drain();
            }
            // A message may have landed after the last read but before the
            // lock was released.
            if self.offload.is_pending() || !self.link.pending() {
                return;
            }
        }
    }

    fn drain(&self) {
        while !self.offload.is_pending() {
            match self.link.try_recv() {
                Ok(Some(msg)) => self.handle(&msg),
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(error = %err, "control ring read failed");
                    return;
                }
            }
        }
    }

    fn handle(&self, msg: &ControlMessage) {
        let kind = match msg.control_kind() {
            Ok(kind) => kind,
            Err(err) => {
                self.ignored.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "unknown control message");
                return;
            }
        };

        if kind == ControlKind::HciReady {
            tracing::info!("co-processor ready");
            self.ready.set();
        } else if let Some(op) = CryptoOp::from_kind(kind) {
            if let Err(err) = self.offload.try_begin(op) {
                tracing::warn!(%op, error = %err, "crypto request not started");
            }
        } else {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%kind, "unexpected control message from co-processor");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use btlink_ring::{ChannelId, Direction, RingChannel};

    use super::*;

    fn links() -> (ControlLink, ControlLink) {
        let id = |n| ChannelId::from_raw(n).unwrap();
        let to_peer = RingChannel::new(id(1), Direction::ToCoprocessor, 1024, None).unwrap();
        let from_peer = RingChannel::new(id(2), Direction::FromCoprocessor, 1024, None).unwrap();
        let timeout = Duration::from_millis(100);
        (
            ControlLink::new(to_peer.clone(), from_peer.clone(), timeout),
            ControlLink::new(from_peer, to_peer, timeout),
        )
    }

    #[test]
    fn ready_message_sets_signal() {
        let (driver, peer) = links();
        let dispatcher = ControlDispatcher::spawn(driver, Duration::from_millis(50)).unwrap();

        peer.send(&ControlMessage::new(ControlKind::HciReady, 0)).unwrap();
        dispatcher.dispatch();
        assert!(dispatcher.ready().is_set());
    }

    #[test]
    fn unexpected_kinds_are_counted() {
        let (driver, peer) = links();
        let dispatcher = ControlDispatcher::spawn(driver, Duration::from_millis(50)).unwrap();

        peer.post(&ControlMessage::new(ControlKind::LogOn, 0)).unwrap();
        let mut bogus = ControlMessage::new(ControlKind::Init, 0);
        bogus.kind = 0x7f;
        peer.send(&bogus).unwrap();
        dispatcher.dispatch();
        assert_eq!(dispatcher.ignored(), 2);
        assert!(!dispatcher.ready().is_set());
    }

    #[test]
    fn reading_pauses_while_crypto_pending() {
        let (driver, peer) = links();
        let dispatcher = ControlDispatcher::spawn(driver, Duration::from_millis(100)).unwrap();

        // DH request whose fragments never come.
        peer.post(&ControlMessage::new(ControlKind::GenP192DhKey, 0)).unwrap();
        dispatcher.dispatch();
        assert!(dispatcher.offload().is_pending());
        dispatcher.dispatch();
        assert_eq!(dispatcher.offload().completed(), 0);

        let deadline = Instant::now() + Duration::from_secs(2);
        while dispatcher.offload().is_pending() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!dispatcher.offload().is_pending());
        assert_eq!(dispatcher.offload().completed(), 1);

        let head = peer.try_recv().unwrap().unwrap();
        assert_eq!(head.word(0) as i32, -5);

        peer.send(&ControlMessage::new(ControlKind::HciReady, 0)).unwrap();
        dispatcher.dispatch();
        assert!(dispatcher.ready().is_set());
    }

    #[test]
    fn ready_during_crypto_request_is_not_lost() {
        let (driver, peer) = links();
        let dispatcher = ControlDispatcher::spawn(driver, Duration::from_secs(1)).unwrap();

        peer.post(&ControlMessage::new(ControlKind::GenP192DhKey, 0)).unwrap();
        dispatcher.dispatch();
        assert!(dispatcher.offload().is_pending());

        peer.send(&ControlMessage::new(ControlKind::HciReady, 0)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !dispatcher.ready().is_set() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(dispatcher.ready().is_set());
        assert!(!dispatcher.offload().is_pending());
        assert_eq!(dispatcher.ignored(), 0);
    }
}
