mod cmd;
mod exit;
mod logging;
mod output;

use std::path::PathBuf;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "btlink", version, about = "Bluetooth co-processor link diagnostics")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Driver configuration file (JSON).
    #[arg(long, value_name = "FILE", env = "BTLINK_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format, cli.config.as_deref());

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simulate_subcommand() {
        let cli = Cli::try_parse_from([
            "btlink",
            "simulate",
            "--packets",
            "8",
            "--tws-events",
            "3",
        ])
        .expect("simulate args should parse");

        match cli.command {
            Command::Simulate(args) => {
                assert_eq!(args.packets, 8);
                assert_eq!(args.tws_events, 3);
                assert!(!args.skip_crypto);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "btlink",
            "selftest",
            "--format",
            "json",
            "--config",
            "/tmp/btlink.json",
        ])
        .expect("global flags should parse");

        assert!(matches!(cli.command, Command::Selftest(_)));
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/btlink.json")));
    }

    #[test]
    fn rejects_unknown_format() {
        let err = Cli::try_parse_from(["btlink", "--format", "xml", "version"])
            .expect_err("unknown format should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }
}
