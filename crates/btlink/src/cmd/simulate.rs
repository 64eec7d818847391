use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use btlink_driver::crypto::dh_request;
use btlink_driver::sim::{ReadyBehavior, SimulatedCoprocessor};
use btlink_driver::{
    CryptoOp, CryptoResponse, CryptoStatus, Driver, DriverConfig, DriverStats, HciHost,
};
use btlink_frame::{FrameError, HciPacket, PacketType};
use btlink_ring::SharedMemory;
use bytes::BytesMut;
use crossbeam::channel::{self, Receiver, Sender};
use serde::Serialize;

use crate::cmd::SimulateArgs;
use crate::exit::{driver_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{pass_fail, print_json, print_pairs, print_rows, OutputFormat};

/// Command Complete for HCI_Reset.
const RESET_COMPLETE: [u8; 6] = [0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00];
const HCI_RESET: [u8; 3] = [0x03, 0x0c, 0x00];

/// Host that hands every packet to the command thread.
struct ChannelHost {
    packets: Sender<HciPacket>,
    dropped: AtomicU64,
}

impl HciHost for ChannelHost {
    fn get_buffer(
        &self,
        _packet_type: PacketType,
        _event_code: Option<u8>,
        len: usize,
    ) -> Option<BytesMut> {
        Some(BytesMut::with_capacity(len))
    }

    fn on_receive(&self, packet: HciPacket) {
        let _ = self.packets.send(packet);
    }

    fn on_dropped(&self, error: &FrameError) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%error, "host dropped a frame");
    }
}

#[derive(Debug, Serialize)]
struct CryptoCheck {
    curve: &'static str,
    agreed: bool,
    secret_len: usize,
}

#[derive(Debug, Serialize)]
struct SimulateReport {
    address: String,
    state: String,
    boot_ms: f64,
    hci_round_trips: usize,
    host_dropped: u64,
    crypto: Vec<CryptoCheck>,
    tws_events: usize,
    mailbox_result: i32,
    stats: DriverStats,
    ok: bool,
}

pub fn run(args: SimulateArgs, format: OutputFormat, config: DriverConfig) -> CliResult<i32> {
    let wait = Duration::from_millis(args.wait_ms);
    let ready = match args.ready_delay_ms {
        Some(ms) => ReadyBehavior::Delayed(Duration::from_millis(ms)),
        None => ReadyBehavior::Immediate,
    };

    let memory = SharedMemory::new();
    let sim = SimulatedCoprocessor::new(memory.clone()).with_ready_behavior(ready);
    let driver = Driver::new(Arc::new(sim.clone()), memory, config)
        .map_err(|err| driver_error("driver setup", err))?;

    let (tx, packets) = channel::unbounded();
    let host = Arc::new(ChannelHost {
        packets: tx,
        dropped: AtomicU64::new(0),
    });

    let started = Instant::now();
    driver
        .initialize(Some(host.clone()))
        .map_err(|err| driver_error("initialize", err))?;
    let boot_ms = (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0;
    tracing::info!(address = %driver.address(), boot_ms, "simulated co-processor up");

    if args.controller_log {
        driver
            .set_controller_log(true)
            .map_err(|err| driver_error("controller log", err))?;
        sim.inject_log(b"simulated controller log online")
            .map_err(|err| driver_error("controller log", err))?;
    }

    let hci_round_trips = exchange_hci(&driver, &sim, &packets, args.packets, wait)?;

    let mut crypto = Vec::new();
    if !args.skip_crypto {
        crypto.push(crypto_round(&sim, "p192", CryptoOp::P192PublicKey, CryptoOp::P192DhKey, wait)?);
        crypto.push(crypto_round(&sim, "p256", CryptoOp::P256PublicKey, CryptoOp::P256DhKey, wait)?);
    }

    let tws_events = fire_tws(&driver, &sim, args.tws_events, wait)?;

    let mailbox_result = driver
        .mailbox_send_sync(1, 0, 0)
        .map_err(|err| driver_error("mailbox", err))?;

    let state = driver.state().to_string();
    let stats = driver.stats();
    driver.exit().map_err(|err| driver_error("exit", err))?;

    let ok = hci_round_trips == args.packets
        && crypto.iter().all(|check| check.agreed)
        && tws_events == args.tws_events;
    let report = SimulateReport {
        address: driver.address().to_string(),
        state,
        boot_ms,
        hci_round_trips,
        host_dropped: host.dropped.load(Ordering::Relaxed),
        crypto,
        tws_events,
        mailbox_result,
        stats,
        ok,
    };
    print_report(&report, format);

    Ok(if ok { SUCCESS } else { FAILURE })
}

/// One event up and one command down per round.
fn exchange_hci(
    driver: &Driver,
    sim: &SimulatedCoprocessor,
    packets: &Receiver<HciPacket>,
    rounds: usize,
    wait: Duration,
) -> CliResult<usize> {
    let mut completed = 0;
    for round in 0..rounds {
        sim.inject_hci(PacketType::Event, &RESET_COMPLETE)
            .map_err(|err| driver_error("inject event", err))?;
        let event = packets
            .recv_timeout(wait)
            .map_err(|_| CliError::new(TIMEOUT, format!("event {round} not delivered")))?;

        driver
            .send(PacketType::Command, &HCI_RESET)
            .map_err(|err| driver_error("send command", err))?;
        let command = sim
            .wait_hci(wait)
            .ok_or_else(|| CliError::new(TIMEOUT, format!("command {round} not received")))?;

        if event.data[..] == RESET_COMPLETE && command.data[..] == HCI_RESET {
            completed += 1;
        } else {
            tracing::warn!(round, "HCI round trip corrupted");
        }
    }
    Ok(completed)
}

fn request(
    sim: &SimulatedCoprocessor,
    op: CryptoOp,
    payload: &[u8],
    wait: Duration,
) -> CliResult<CryptoResponse> {
    sim.request_crypto(op, payload)
        .map_err(|err| driver_error("crypto request", err))?;
    sim.wait_crypto_reply(wait)
        .ok_or_else(|| CliError::new(TIMEOUT, format!("no reply to {op}")))
}

/// Two key pairs generated by the driver, then DH from both sides.
fn crypto_round(
    sim: &SimulatedCoprocessor,
    curve: &'static str,
    public_op: CryptoOp,
    dh_op: CryptoOp,
    wait: Duration,
) -> CliResult<CryptoCheck> {
    let a = request(sim, public_op, &[], wait)?;
    let b = request(sim, public_op, &[], wait)?;
    if a.status != CryptoStatus::Success || b.status != CryptoStatus::Success {
        return Err(CliError::new(
            FAILURE,
            format!("{public_op} failed: {:?}/{:?}", a.status, b.status),
        ));
    }

    let key_len = public_op.scalar_len() * 2;
    let (pub_a, priv_a) = a.payload.split_at(key_len);
    let (pub_b, priv_b) = b.payload.split_at(key_len);
    let ab = request(sim, dh_op, &dh_request(pub_b, priv_a, 1), wait)?;
    let ba = request(sim, dh_op, &dh_request(pub_a, priv_b, 2), wait)?;

    let agreed = ab.status == CryptoStatus::Success
        && ba.status == CryptoStatus::Success
        && ab.payload == ba.payload;
    tracing::debug!(curve, agreed, "crypto round complete");
    Ok(CryptoCheck {
        curve,
        agreed,
        secret_len: ab.payload.len(),
    })
}

fn fire_tws(
    driver: &Driver,
    sim: &SimulatedCoprocessor,
    events: usize,
    wait: Duration,
) -> CliResult<usize> {
    if events == 0 {
        return Ok(0);
    }
    let (tx, rx) = channel::unbounded();
    driver
        .tws_register_callback(0, move |clock, offset| {
            let _ = tx.send((clock, offset));
        })
        .map_err(|err| driver_error("tws callback", err))?;
    driver
        .tws_enable(0)
        .map_err(|err| driver_error("tws enable", err))?;

    let mut delivered = 0;
    for event in 0..events {
        let clock = 0x0001_0000 + (event as u32) * 0x100;
        if !sim.fire_tws(0, clock, 625) {
            tracing::warn!(event, "TWS interrupt not armed");
            break;
        }
        match rx.recv_timeout(wait) {
            Ok((seen, _)) if seen == clock => delivered += 1,
            Ok((seen, _)) => tracing::warn!(event, seen, clock, "TWS clock mismatch"),
            Err(_) => return Err(CliError::new(TIMEOUT, format!("TWS event {event} not delivered"))),
        }
        sim.ack_tws(0).map_err(|err| driver_error("tws ack", err))?;
    }

    driver
        .tws_disable(0)
        .map_err(|err| driver_error("tws disable", err))?;
    Ok(delivered)
}

fn print_report(report: &SimulateReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            print_pairs(
                "SIMULATION",
                &[
                    ("address", report.address.clone()),
                    ("state", report.state.clone()),
                    ("boot_ms", report.boot_ms.to_string()),
                    ("hci_round_trips", report.hci_round_trips.to_string()),
                    ("host_dropped", report.host_dropped.to_string()),
                    ("tws_events", report.tws_events.to_string()),
                    ("mailbox_result", report.mailbox_result.to_string()),
                    ("ipc_interrupts", report.stats.ipc_interrupts.to_string()),
                    ("hci_received", report.stats.hci_received.to_string()),
                    ("hci_sent", report.stats.hci_sent.to_string()),
                    ("log_lines", report.stats.log_lines.to_string()),
                    ("crypto_completed", report.stats.crypto_completed.to_string()),
                    ("channels_created", report.stats.channels_created.to_string()),
                    ("result", pass_fail(report.ok).to_string()),
                ],
            );
            if !report.crypto.is_empty() {
                print_rows(
                    &["CURVE", "AGREEMENT", "SECRET"],
                    report
                        .crypto
                        .iter()
                        .map(|check| {
                            vec![
                                check.curve.to_string(),
                                pass_fail(check.agreed).to_string(),
                                format!("{} bytes", check.secret_len),
                            ]
                        })
                        .collect(),
                );
            }
        }
        OutputFormat::Pretty => {
            println!(
                "address={} state={} boot_ms={}",
                report.address, report.state, report.boot_ms
            );
            println!(
                "hci round_trips={} dropped={}",
                report.hci_round_trips, report.host_dropped
            );
            for check in &report.crypto {
                println!(
                    "crypto curve={} agreed={} secret_len={}",
                    check.curve, check.agreed, check.secret_len
                );
            }
            println!(
                "tws events={} mailbox result={}",
                report.tws_events, report.mailbox_result
            );
            println!(
                "stats ipc={} received={} sent={} crypto={} channels={}",
                report.stats.ipc_interrupts,
                report.stats.hci_received,
                report.stats.hci_sent,
                report.stats.crypto_completed,
                report.stats.channels_created
            );
            println!("result={}", pass_fail(report.ok));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> SimulateArgs {
        SimulateArgs {
            packets: 2,
            tws_events: 2,
            skip_crypto: false,
            ready_delay_ms: None,
            controller_log: true,
            wait_ms: 2000,
        }
    }

    #[test]
    fn full_simulation_succeeds() {
        let code = run(args(), OutputFormat::Json, DriverConfig::default())
            .expect("simulation should run");
        assert_eq!(code, SUCCESS);
    }

    #[test]
    fn ready_never_arriving_times_out() {
        let config = DriverConfig {
            ready_timeout_ms: 20,
            ..DriverConfig::default()
        };
        let args = SimulateArgs {
            ready_delay_ms: Some(500),
            ..args()
        };
        let err = run(args, OutputFormat::Json, config).expect_err("boot should time out");
        assert_eq!(err.code, TIMEOUT);
    }
}
