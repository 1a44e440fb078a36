//! Typed simulation configuration loaded from YAML.

use crate::Error;
use meshsim_analysis::energy::EnergyModel;
use meshsim_node::{stream, Classifier, FlowIntent, TrafficClass};
use meshsim_runtime::{
    network::{Interface, Link, EPHEMERAL_PORT_RANGE},
    NodeId,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, net::Ipv6Addr, path::Path, time::Duration};

/// Largest datagram a stream may send.
const MAX_PACKET_SIZE: usize = 1280;

/// Smallest datagram a stream may send (the sequence number prefix).
const MIN_PACKET_SIZE: usize = 8;

/// Shortest gap a stream may leave between two datagrams.
const MIN_STREAM_INTERVAL: Duration = Duration::from_micros(1);

/// Node hosting the streaming server (sources use the nodes below it).
pub const STREAMING_SERVER: NodeId = 2;

/// Latency and loss of the links between nodes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub success_rate: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            latency_ms: 15.0,
            jitter_ms: 5.0,
            success_rate: 1.0,
        }
    }
}

impl From<&LinkConfig> for Link {
    fn from(cfg: &LinkConfig) -> Self {
        Self {
            latency_ms: cfg.latency_ms,
            jitter_ms: cfg.jitter_ms,
            success_rate: cfg.success_rate,
        }
    }
}

/// Ingress capacity of a node's interface.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct InterfaceConfig {
    pub ingress_bps: Option<u64>,
    pub queue_limit: Option<usize>,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            ingress_bps: Some(250_000),
            queue_limit: Some(50),
        }
    }
}

impl From<&InterfaceConfig> for Interface {
    fn from(cfg: &InterfaceConfig) -> Self {
        Self {
            ingress_bps: cfg.ingress_bps,
            queue_limit: cfg.queue_limit,
        }
    }
}

/// Sensors publishing telemetry to an aggregator.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    pub sensors: u32,
    pub port: u16,
    pub prefix: Ipv6Addr,
    pub max_messages: u64,
    pub base_interval_ms: u64,
    pub jitter_ms: u64,
    pub start_ms: u64,
    pub stop_ms: u64,

    /// Marking applied by sensors (unmarked when absent).
    pub intent: Option<FlowIntent>,

    /// Nodes whose endpoints fail to bind.
    pub bind_failures: Vec<NodeId>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sensors: 10,
            port: 1883,
            prefix: Ipv6Addr::new(0x2001, 0xdb8, 1, 0, 0, 0, 0, 0),
            max_messages: 20,
            base_interval_ms: 5_000,
            jitter_ms: 500,
            start_ms: 1_000,
            stop_ms: 100_000,
            intent: None,
            bind_failures: Vec::new(),
        }
    }
}

/// A video and a bulk flow sharing one server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StreamingConfig {
    pub video_rate_bps: u64,
    pub bulk_rate_bps: u64,
    pub packet_size: usize,
    pub port: u16,
    pub start_ms: u64,
    pub stop_ms: u64,
    pub sink_stop_ms: u64,
    pub link: LinkConfig,
    pub server: InterfaceConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            video_rate_bps: 2_000_000,
            bulk_rate_bps: 5_000_000,
            packet_size: 1_000,
            port: 9,
            start_ms: 1_000,
            stop_ms: 10_000,
            sink_stop_ms: 11_000,
            link: LinkConfig {
                latency_ms: 10.0,
                jitter_ms: 0.0,
                success_rate: 1.0,
            },
            server: InterfaceConfig {
                ingress_bps: Some(5_000_000),
                queue_limit: Some(50),
            },
        }
    }
}

/// Configuration of a simulation run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub seed: u64,
    pub duration_ms: u64,
    pub telemetry: TelemetryConfig,
    pub streaming: StreamingConfig,
    pub link: LinkConfig,
    pub gateway: InterfaceConfig,
    pub energy: EnergyModel,
    pub classes: BTreeMap<FlowIntent, TrafficClass>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 42,
            duration_ms: 100_000,
            telemetry: TelemetryConfig::default(),
            streaming: StreamingConfig::default(),
            link: LinkConfig::default(),
            gateway: InterfaceConfig::default(),
            energy: EnergyModel::default(),
            classes: BTreeMap::from([
                (FlowIntent::Video, TrafficClass::HighPriority),
                (FlowIntent::Telemetry, TrafficClass::AssuredForwarding),
                (FlowIntent::Bulk, TrafficClass::BestEffort),
            ]),
        }
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidConfig(reason.into())
}

fn validate_link(name: &str, link: &LinkConfig) -> Result<(), Error> {
    if !(0.0..=1.0).contains(&link.success_rate) {
        return Err(invalid(format!("{name}.success_rate must be in [0, 1]")));
    }
    if !(link.latency_ms >= 0.0 && link.jitter_ms >= 0.0) {
        return Err(invalid(format!("{name} latency and jitter must be non-negative")));
    }
    Ok(())
}

fn validate_port(name: &str, port: u16) -> Result<(), Error> {
    if port == 0 || EPHEMERAL_PORT_RANGE.contains(&port) {
        return Err(invalid(format!("{name} must be a non-zero, non-ephemeral port")));
    }
    Ok(())
}

impl Config {
    /// Parse and validate a YAML document.
    pub fn parse(yaml: &str) -> Result<Self, Error> {
        let cfg: Self = serde_yaml::from_str(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate the YAML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Reject values that would make a run meaningless or impossible.
    pub fn validate(&self) -> Result<(), Error> {
        let telemetry = &self.telemetry;
        if telemetry.sensors == 0 || telemetry.sensors >= u32::from(u16::MAX) {
            return Err(invalid("telemetry.sensors must be in [1, 65535)"));
        }
        if telemetry.base_interval_ms == 0 {
            return Err(invalid("telemetry.base_interval_ms must be positive"));
        }
        if telemetry.jitter_ms.checked_mul(1_000_000).is_none() {
            return Err(invalid("telemetry.jitter_ms must fit in u64 nanoseconds"));
        }
        if telemetry.stop_ms < telemetry.start_ms {
            return Err(invalid("telemetry.stop_ms must not precede telemetry.start_ms"));
        }
        if let Some(node) = telemetry
            .bind_failures
            .iter()
            .find(|node| **node > telemetry.sensors)
        {
            return Err(invalid(format!("telemetry.bind_failures names unknown node {node}")));
        }
        validate_port("telemetry.port", telemetry.port)?;

        let streaming = &self.streaming;
        if streaming.video_rate_bps == 0 || streaming.bulk_rate_bps == 0 {
            return Err(invalid("streaming rates must be positive"));
        }
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&streaming.packet_size) {
            return Err(invalid(format!(
                "streaming.packet_size must be in [{MIN_PACKET_SIZE}, {MAX_PACKET_SIZE}]"
            )));
        }
        for (name, rate_bps) in [
            ("video_rate_bps", streaming.video_rate_bps),
            ("bulk_rate_bps", streaming.bulk_rate_bps),
        ] {
            if stream::interval(streaming.packet_size, rate_bps) < MIN_STREAM_INTERVAL {
                return Err(invalid(format!(
                    "streaming.{name} sends packets less than {MIN_STREAM_INTERVAL:?} apart"
                )));
            }
        }
        if streaming.stop_ms < streaming.start_ms || streaming.sink_stop_ms < streaming.stop_ms {
            return Err(invalid("streaming start, stop and sink_stop must be ordered"));
        }
        validate_port("streaming.port", streaming.port)?;
        validate_link("streaming.link", &streaming.link)?;

        validate_link("link", &self.link)?;
        self.address(telemetry.sensors.max(STREAMING_SERVER))?;
        if !(self.energy.tx_joules >= 0.0 && self.energy.rx_joules >= 0.0) {
            return Err(invalid("energy costs must be non-negative"));
        }
        Ok(())
    }

    /// Simulated time after which a run stops.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Classifier built from the configured `classes`.
    pub fn classifier(&self) -> Classifier {
        Classifier::new(self.classes.clone(), TrafficClass::BestEffort)
    }

    /// Address of `node`: the configured prefix with `node + 1` as interface identifier.
    pub fn address(&self, node: NodeId) -> Result<Ipv6Addr, Error> {
        u128::from(self.telemetry.prefix)
            .checked_add(u128::from(node) + 1)
            .map(Ipv6Addr::from)
            .ok_or_else(|| invalid(format!("telemetry.prefix has no address for node {node}")))
    }
}
