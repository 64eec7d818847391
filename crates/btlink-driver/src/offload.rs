use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use btlink_frame::{ControlLink, ControlMessage, FragmentAssembler};
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;

use crate::crypto::{self, CryptoOp, CryptoResponse, CryptoStatus};
use crate::error::{DriverError, Result};

/// Longest single wait for a request fragment before the worker checks
/// whether its request was cancelled.
const CANCEL_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
struct Job {
    op: CryptoOp,
    generation: u64,
}

/// Pending marker and the generation it belongs to.
#[derive(Default)]
struct Slot {
    op: Option<CryptoOp>,
    generation: u64,
}

enum Collected {
    Complete(Vec<u8>),
    Incomplete,
    /// A message of another type arrived before the request was whole.
    Interrupted(ControlMessage),
    Cancelled(Option<ControlMessage>),
}

/// Runs crypto requests on a worker thread, one at a time.
pub struct CryptoOffload {
    slot: Arc<Mutex<Slot>>,
    completed: Arc<AtomicU64>,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl CryptoOffload {
    /// Start the worker. `on_done` runs after each request finishes or is
    /// abandoned, with any control message the worker read that was not
    /// part of the request.
    pub fn spawn<F>(link: ControlLink, fragment_timeout: Duration, on_done: F) -> Result<Self>
    where
        F: Fn(Option<ControlMessage>) + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(Slot::default()));
        let completed = Arc::new(AtomicU64::new(0));
        let (tx, rx) = channel::unbounded::<Job>();

        let worker = {
            let slot = Arc::clone(&slot);
            let completed = Arc::clone(&completed);
            thread::Builder::new()
                .name("btlink-crypto".into())
                .spawn(move || {
                    for job in rx.iter() {
                        let current = || slot.lock().generation == job.generation;
                        if !current() {
                            tracing::debug!(op = %job.op, "skipping cancelled crypto request");
                            on_done(None);
                            continue;
                        }
                        let (response, stray) = match run(&link, job.op, fragment_timeout, &current) {
                            Ok(outcome) if current() => outcome,
                            Ok((_, stray)) | Err(stray) => {
                                tracing::info!(op = %job.op, "crypto request cancelled");
                                on_done(stray);
                                continue;
                            }
                        };
                        if let Err(err) = link.send_all(&response.to_messages()) {
                            tracing::error!(op = %job.op, error = %err, "failed to send crypto response");
                        }
                        completed.fetch_add(1, Ordering::Relaxed);
                        {
                            let mut slot = slot.lock();
                            if slot.generation == job.generation {
                                slot.op = None;
                            }
                        }
                        on_done(stray);
                    }
                    tracing::debug!("crypto worker stopped");
                })?
        };

        Ok(Self {
            slot,
            completed,
            jobs: Some(tx),
            worker: Some(worker),
        })
    }

    /// Claim the single crypto slot for `op` and queue it.
    pub fn try_begin(&self, op: CryptoOp) -> Result<()> {
        let mut slot = self.slot.lock();
        if let Some(current) = slot.op {
            tracing::warn!(requested = %op, %current, "crypto request while another is pending");
            return Err(DriverError::CryptoBusy);
        }
        let Some(jobs) = &self.jobs else {
            return Err(DriverError::NotEnabled);
        };
        jobs.send(Job {
            op,
            generation: slot.generation,
        })
        .map_err(|_| DriverError::NotEnabled)?;
        slot.op = Some(op);
        tracing::debug!(%op, "crypto request queued");
        Ok(())
    }

    /// Abandon the pending request, if any. The worker stops collecting
    /// its fragments and sends no response.
    pub fn cancel(&self) -> Option<CryptoOp> {
        let mut slot = self.slot.lock();
        slot.generation = slot.generation.wrapping_add(1);
        let cancelled = slot.op.take();
        if let Some(op) = cancelled {
            tracing::debug!(%op, "cancelling crypto request");
        }
        cancelled
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().op.is_some()
    }

    pub fn pending_op(&self) -> Option<CryptoOp> {
        self.slot.lock().op
    }

    /// Responses sent so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

impl Drop for CryptoOffload {
    fn drop(&mut self) {
        self.cancel();
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

/// Build the response to `op`. `Err` carries the stray message, if any,
/// when the request was cancelled midway.
fn run(
    link: &ControlLink,
    op: CryptoOp,
    fragment_timeout: Duration,
    current: &dyn Fn() -> bool,
) -> std::result::Result<(CryptoResponse, Option<ControlMessage>), Option<ControlMessage>> {
    if !op.is_dh() {
        return Ok((crypto::process(op, &[]), None));
    }
    match collect_request(link, op, fragment_timeout, current) {
        Collected::Complete(request) => Ok((crypto::process(op, &request), None)),
        Collected::Incomplete => Ok((
            CryptoResponse::failure(op, CryptoStatus::IncompleteRequest, 0),
            None,
        )),
        Collected::Interrupted(msg) => Ok((
            CryptoResponse::failure(op, CryptoStatus::IncompleteRequest, 0),
            Some(msg),
        )),
        Collected::Cancelled(stray) => Err(stray),
    }
}

fn collect_request(
    link: &ControlLink,
    op: CryptoOp,
    timeout: Duration,
    current: &dyn Fn() -> bool,
) -> Collected {
    let mut assembler = FragmentAssembler::new(op.kind(), op.request_len());
    let mut deadline = Instant::now() + timeout;
    while !assembler.is_complete() {
        if !current() {
            return Collected::Cancelled(None);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::warn!(
                %op,
                received = assembler.received(),
                expected = op.request_len(),
                "crypto request fragment missing"
            );
            return Collected::Incomplete;
        }
        match link.recv_timeout(remaining.min(CANCEL_POLL)) {
            Ok(Some(msg)) if !current() => return Collected::Cancelled(Some(msg)),
            Ok(Some(msg)) if !assembler.accepts(&msg) => {
                tracing::warn!(
                    %op,
                    got = msg.kind,
                    received = assembler.received(),
                    "crypto request interrupted by another message"
                );
                return Collected::Interrupted(msg);
            }
            Ok(Some(msg)) => {
                assembler.push(&msg);
                deadline = Instant::now() + timeout;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(%op, error = %err, "crypto request read failed");
                return Collected::Incomplete;
            }
        }
    }
    Collected::Complete(assembler.into_data())
}
