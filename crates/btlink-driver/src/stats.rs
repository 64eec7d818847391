use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters bumped from the interrupt path and the driver threads.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub ipc_interrupts: AtomicU64,
    pub hci_received: AtomicU64,
    pub hci_dropped: AtomicU64,
    pub hci_sent: AtomicU64,
    pub log_lines: AtomicU64,
    pub resets: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of driver activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverStats {
    pub ipc_interrupts: u64,
    pub hci_received: u64,
    pub hci_dropped: u64,
    pub hci_sent: u64,
    pub log_lines: u64,
    pub crypto_completed: u64,
    pub control_ignored: u64,
    pub tws_interrupts: u64,
    pub tws_overruns: u64,
    pub resets: u64,
    /// Channels and blocks created over the driver's lifetime.
    pub channels_created: u64,
    pub channels_live: usize,
}
