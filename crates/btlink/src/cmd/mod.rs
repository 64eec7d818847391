use std::path::Path;

use btlink_driver::DriverConfig;
use clap::{Args, Subcommand};

use crate::exit::{driver_error, CliResult};
use crate::output::OutputFormat;

pub mod selftest;
pub mod simulate;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bring a driver up against the simulated co-processor and exercise it.
    Simulate(SimulateArgs),
    /// Check P-192 and P-256 key agreement.
    Selftest(SelftestArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat, config: Option<&Path>) -> CliResult<i32> {
    match command {
        Command::Simulate(args) => simulate::run(args, format, load_config(config)?),
        Command::Selftest(args) => selftest::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

fn load_config(path: Option<&Path>) -> CliResult<DriverConfig> {
    match path {
        Some(path) => {
            let context = format!("config {}", path.display());
            let config = DriverConfig::from_path(path).map_err(|err| driver_error(&context, err))?;
            tracing::debug!(path = %path.display(), "loaded driver config");
            Ok(config)
        }
        None => Ok(DriverConfig::default()),
    }
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// HCI round trips to run (one event up, one command down each).
    #[arg(long, default_value = "4")]
    pub packets: usize,
    /// TWS interrupts to fire on channel 0.
    #[arg(long, default_value = "2")]
    pub tws_events: usize,
    /// Skip the crypto offload round.
    #[arg(long)]
    pub skip_crypto: bool,
    /// Delay before the simulated co-processor reports ready.
    #[arg(long, value_name = "MS")]
    pub ready_delay_ms: Option<u64>,
    /// Route controller logs to the log ring and emit a sample line.
    #[arg(long)]
    pub controller_log: bool,
    /// How long to wait for each simulated reply.
    #[arg(long, value_name = "MS", default_value = "1000")]
    pub wait_ms: u64,
}

#[derive(Args, Debug)]
pub struct SelftestArgs {
    /// Key agreements to run per curve.
    #[arg(long, default_value = "1")]
    pub rounds: usize,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
