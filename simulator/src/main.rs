//! Simulate telemetry and classified streams over a constrained wireless mesh.

use clap::{value_parser, Arg, ArgAction, Command};
use meshsim_simulator::{run, Config, Scenario};
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info};

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Flag for JSON-formatted logs
const JSON_FLAG: &str = "json";

/// Directory reports are written to when `--output` is omitted
const DEFAULT_OUTPUT: &str = "results";

fn scenario_command(scenario: Scenario, about: &'static str) -> Command {
    Command::new(scenario.as_str())
        .about(about)
        .arg(
            Arg::new("config")
                .long("config")
                .help("Path to YAML config file (defaults are used when omitted)")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .default_value(DEFAULT_OUTPUT)
                .help("Directory to write the trace and reports to")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .help("Seed overriding the configured one")
                .value_parser(value_parser!(u64)),
        )
}

fn main() -> ExitCode {
    // Define application
    let matches = Command::new("meshsim")
        .version(crate_version())
        .about("Simulate telemetry and classified streams over a constrained wireless mesh.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(JSON_FLAG)
                .long(JSON_FLAG)
                .help("Emit logs as JSON")
                .action(ArgAction::SetTrue),
        )
        .subcommand(scenario_command(
            Scenario::Telemetry,
            "Run sensors that publish bounded, jittered telemetry to an acknowledging aggregator.",
        ))
        .subcommand(scenario_command(
            Scenario::Streaming,
            "Run a high priority video flow and a best effort bulk flow through one bottleneck.",
        ))
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    if matches.get_flag(JSON_FLAG) {
        tracing_subscriber::fmt().json().with_max_level(level).init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }

    // Parse subcommand
    let (scenario, matches) = match matches.subcommand() {
        Some((cmd, matches)) if cmd == Scenario::Telemetry.as_str() => {
            (Scenario::Telemetry, matches)
        }
        Some((cmd, matches)) if cmd == Scenario::Streaming.as_str() => {
            (Scenario::Streaming, matches)
        }
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
            return ExitCode::FAILURE;
        }
        None => {
            error!("no subcommand provided");
            return ExitCode::FAILURE;
        }
    };

    // Load configuration
    let mut cfg = match matches.get_one::<PathBuf>("config") {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(error = ?e, path = %path.display(), "failed to load config");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    if let Some(seed) = matches.get_one::<u64>("seed") {
        cfg.seed = *seed;
    }
    let output = matches
        .get_one::<PathBuf>("output")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));

    // Run
    match run(scenario, &cfg, &output) {
        Ok(outcome) => {
            for flow in &outcome.report.flows {
                info!(
                    flow = %flow.id,
                    source = %flow.source,
                    destination = %flow.destination,
                    dscp = flow.dscp,
                    tx = flow.tx_packets,
                    rx = flow.rx_packets,
                    avg_delay = ?flow.avg_delay,
                    throughput_mbps = ?flow.throughput_mbps,
                    loss_rate = ?flow.loss_rate,
                    "flow"
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = ?e, "simulation failed");
            ExitCode::FAILURE
        }
    }
}
