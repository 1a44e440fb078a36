//! Simulate telemetry and classified streams over a constrained wireless mesh.
//!
//! Two scenarios are available:
//!
//! - [Scenario::Telemetry]: `sensors` publishers report to a single aggregator (the last
//!   node) that acknowledges every datagram. The aggregator's ingress interface is the
//!   configured `gateway`.
//! - [Scenario::Streaming]: a video source (marked [FlowIntent::Video]) and a bulk source
//!   (marked [FlowIntent::Bulk]) share the ingress interface of a single server.
//!
//! A run produces a [Report] along with the Prometheus exposition of every counter the run
//! registered. [run] additionally writes the event trace and the plain-text reports into
//! an output directory.

use meshsim_analysis::{output, Analyzer, Report};
use meshsim_node::{
    publisher::{self, Publisher, Role},
    stream::{Sink, Source, SourceConfig},
    Application, FlowIntent, Message, Metrics,
};
use meshsim_runtime::{
    deterministic::{self, Runner},
    network::{self, Interface},
    NodeId,
};
use meshsim_trace::Trace;
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{
    collections::BTreeMap,
    fmt,
    fs::{self, File},
    io::BufWriter,
    net::{IpAddr, SocketAddr},
    path::Path,
    time::Duration,
};
use thiserror::Error;
use tracing::info;

pub mod config;

pub use config::Config;

/// File the event trace is written to.
pub const TRACE_FILE: &str = "trace.csv";

/// Errors that can occur when running a simulation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("runtime error: {0}")]
    Runtime(#[from] meshsim_runtime::Error),
    #[error("trace error: {0}")]
    Trace(#[from] meshsim_trace::Error),
    #[error("analysis error: {0}")]
    Analysis(#[from] meshsim_analysis::Error),
    #[error("metrics encoding failed")]
    Metrics(#[from] fmt::Error),
}

/// The deployment to simulate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scenario {
    Telemetry,
    Streaming,
}

impl Scenario {
    /// Name of the scenario (and of its CLI subcommand).
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::Streaming => "streaming",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a simulation run.
pub struct Outcome {
    pub report: Report,

    /// Nodes reported in the per-node output files.
    pub reported: Vec<NodeId>,

    /// Simulated time at which the run ended.
    pub end: Duration,

    /// Prometheus text exposition of the run's counters.
    pub metrics: String,
}

struct Deployment {
    runner: Runner<Message>,
    registry: Registry,
    nodes: BTreeMap<NodeId, Application>,
    reported: Vec<NodeId>,
}

impl Deployment {
    fn new(cfg: &Config, default_link: &config::LinkConfig) -> Result<Self, Error> {
        let mut registry = Registry::default();
        let runner = Runner::new(
            deterministic::Config {
                seed: cfg.seed,
                deadline: Some(cfg.duration()),
                network: network::Config {
                    default_link: default_link.into(),
                    ..Default::default()
                },
            },
            registry.sub_registry_with_prefix("runtime"),
        )?;
        Ok(Self {
            runner,
            registry,
            nodes: BTreeMap::new(),
            reported: Vec::new(),
        })
    }

    fn finish(mut self, cfg: &Config, trace: &Trace) -> Result<Outcome, Error> {
        let end = self.runner.run(&mut self.nodes);
        let report = Analyzer::new(cfg.energy).analyze(
            &self.runner.flows(),
            &trace.snapshot(),
            &self.nodes,
        );
        let mut metrics = String::new();
        encode(&mut metrics, &self.registry)?;
        Ok(Outcome {
            report,
            reported: self.reported,
            end,
            metrics,
        })
    }
}

/// Run the telemetry scenario, appending every event to `trace`.
pub fn telemetry(cfg: &Config, trace: &Trace) -> Result<Outcome, Error> {
    cfg.validate()?;
    let mut deployment = Deployment::new(cfg, &cfg.link)?;
    let metrics = Metrics::init(deployment.registry.sub_registry_with_prefix("app"));
    let classifier = cfg.classifier();
    let telemetry = &cfg.telemetry;
    let aggregator = telemetry.sensors;
    let aggregator_ip = IpAddr::V6(cfg.address(aggregator)?);
    let start = Duration::from_millis(telemetry.start_ms);
    let stop = Duration::from_millis(telemetry.stop_ms);

    for node in 0..=aggregator {
        let (role, interface, intent) = if node == aggregator {
            (Role::Aggregator, Interface::from(&cfg.gateway), None)
        } else {
            (Role::Sensor, Interface::default(), telemetry.intent)
        };
        let network = deployment.runner.network();
        network.attach(node, IpAddr::V6(cfg.address(node)?), interface)?;
        if telemetry.bind_failures.contains(&node) {
            network.reject_binds(node)?;
        }

        let publisher = Publisher::new(
            publisher::Config {
                role,
                port: telemetry.port,
                aggregator: aggregator_ip,
                max_messages: telemetry.max_messages,
                base_interval: Duration::from_millis(telemetry.base_interval_ms),
                jitter: Duration::from_millis(telemetry.jitter_ms),
                intent,
            },
            classifier.clone(),
            trace.clone(),
            metrics.clone(),
        );
        deployment
            .nodes
            .insert(node, Application::Publisher(publisher));
        let begin = if role == Role::Aggregator {
            Duration::ZERO
        } else {
            deployment.reported.push(node);
            start
        };
        deployment.runner.schedule(node, begin, Message::Start);
        deployment.runner.schedule(node, stop, Message::Stop);
    }
    info!(
        sensors = telemetry.sensors,
        max_messages = telemetry.max_messages,
        seed = cfg.seed,
        "running telemetry scenario"
    );
    deployment.finish(cfg, trace)
}

/// Run the streaming scenario, appending every event to `trace`.
pub fn streaming(cfg: &Config, trace: &Trace) -> Result<Outcome, Error> {
    cfg.validate()?;
    let streaming = &cfg.streaming;
    let mut deployment = Deployment::new(cfg, &streaming.link)?;
    let metrics = Metrics::init(deployment.registry.sub_registry_with_prefix("app"));
    let classifier = cfg.classifier();
    let server = config::STREAMING_SERVER;
    let peer = SocketAddr::new(IpAddr::V6(cfg.address(server)?), streaming.port);
    let start = Duration::from_millis(streaming.start_ms);
    let stop = Duration::from_millis(streaming.stop_ms);

    let network = deployment.runner.network();
    for node in 0..server {
        network.attach(node, IpAddr::V6(cfg.address(node)?), Interface::default())?;
    }
    network.attach(
        server,
        IpAddr::V6(cfg.address(server)?),
        (&streaming.server).into(),
    )?;

    let sources = [
        (FlowIntent::Video, streaming.video_rate_bps),
        (FlowIntent::Bulk, streaming.bulk_rate_bps),
    ];
    for (node, (intent, rate_bps)) in (0..).zip(sources) {
        let source = Source::new(
            SourceConfig {
                peer,
                rate_bps,
                packet_size: streaming.packet_size,
                intent: Some(intent),
            },
            classifier.clone(),
            trace.clone(),
            metrics.clone(),
        );
        deployment.nodes.insert(node, Application::Source(source));
        deployment.reported.push(node);
        deployment.runner.schedule(node, start, Message::Start);
        deployment.runner.schedule(node, stop, Message::Stop);
    }
    let sink = Sink::new(streaming.port, trace.clone(), metrics);
    deployment.nodes.insert(server, Application::Sink(sink));
    deployment
        .runner
        .schedule(server, Duration::ZERO, Message::Start);
    deployment.runner.schedule(
        server,
        Duration::from_millis(streaming.sink_stop_ms),
        Message::Stop,
    );
    info!(
        video_rate_bps = streaming.video_rate_bps,
        bulk_rate_bps = streaming.bulk_rate_bps,
        seed = cfg.seed,
        "running streaming scenario"
    );
    deployment.finish(cfg, trace)
}

/// Write the plain-text reports of `outcome` into `dir`.
pub fn write_reports(outcome: &Outcome, dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(dir)?;
    let create = |name: &str| -> Result<BufWriter<File>, Error> {
        Ok(BufWriter::new(File::create(dir.join(name))?))
    };
    let report = &outcome.report;
    output::latency(report, create("latency.txt")?)?;
    output::messages_sent(
        report,
        outcome.reported.iter().copied(),
        create("messages_sent.txt")?,
    )?;
    output::energy(report, outcome.reported.iter().copied(), create("energy.txt")?)?;
    output::flows(report, create("simulation_results.csv")?)?;
    fs::write(dir.join("metrics.txt"), &outcome.metrics)?;
    Ok(())
}

/// Run `scenario`, writing the trace and every report into `dir`.
pub fn run(scenario: Scenario, cfg: &Config, dir: &Path) -> Result<Outcome, Error> {
    fs::create_dir_all(dir)?;
    let trace = Trace::open(dir.join(TRACE_FILE));
    let outcome = match scenario {
        Scenario::Telemetry => telemetry(cfg, &trace),
        Scenario::Streaming => streaming(cfg, &trace),
    };
    trace.close()?;
    let outcome = outcome?;
    write_reports(&outcome, dir)?;
    info!(
        %scenario,
        end = ?outcome.end,
        flows = outcome.report.flows.len(),
        dir = %dir.display(),
        "wrote reports"
    );
    Ok(outcome)
}
