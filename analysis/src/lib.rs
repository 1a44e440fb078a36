//! Derive per-flow and per-node performance metrics from a simulation run.
//!
//! The [Analyzer] is read-only: it consumes the flow snapshot captured by the network,
//! the event [Snapshot] and the [Counters] of every node, and produces a [Report].
//! Metrics that would require dividing by zero (no packet received, no packet
//! transmitted, a single received packet for throughput) are reported as absent.
//!
//! Per-node energy is computed from the node counters ([energy::EnergyLedger]). The
//! event trace is tallied independently so the two sources can be cross-checked.

use meshsim_node::Counters;
use meshsim_runtime::{
    flows::{FlowId, FlowRecord},
    NodeId,
};
use meshsim_trace::{EventKind, Snapshot};
use std::{collections::BTreeMap, io, net::SocketAddr, time::Duration};
use thiserror::Error;
use tracing::warn;

pub mod energy;
pub mod output;

use energy::{EnergyLedger, EnergyModel};

/// Errors that can occur when producing reports.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Performance of a single flow.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowMetrics {
    pub id: FlowId,
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub dscp: u8,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,

    /// Mean one-way delay of received packets.
    pub avg_delay: Option<Duration>,

    /// Received bits per second (in Mbps) between the first and last reception.
    pub throughput_mbps: Option<f64>,

    /// Percentage of transmitted packets that were not received.
    pub loss_rate: Option<f64>,
}

impl FlowMetrics {
    /// Derive the metrics of a flow, leaving out any that would divide by zero.
    pub fn new(record: &FlowRecord) -> Self {
        let avg_delay = (record.rx_packets > 0).then(|| {
            Duration::from_nanos(
                (record.delay_sum.as_nanos() / u128::from(record.rx_packets)) as u64,
            )
        });
        let throughput_mbps = match (record.first_rx, record.last_rx) {
            (Some(first), Some(last)) if last > first => {
                Some(record.rx_bytes as f64 * 8.0 / (last - first).as_secs_f64() / 1e6)
            }
            _ => None,
        };
        let loss_rate = (record.tx_packets > 0).then(|| {
            record.tx_packets.saturating_sub(record.rx_packets) as f64 * 100.0
                / record.tx_packets as f64
        });
        Self {
            id: record.id,
            source: record.source,
            destination: record.destination,
            dscp: record.dscp(),
            tx_packets: record.tx_packets,
            rx_packets: record.rx_packets,
            rx_bytes: record.rx_bytes,
            avg_delay,
            throughput_mbps,
            loss_rate,
        }
    }
}

/// Activity of a single node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeMetrics {
    pub node: NodeId,
    pub sent: u64,
    pub received: u64,
    pub energy_joules: f64,

    /// Transmission attempts traced for the node (including failed sends).
    pub traced_sent: u64,

    /// `ReceivedPacket` events traced for the node.
    pub traced_received: u64,
}

impl NodeMetrics {
    /// Whether the trace agrees with the node counters.
    pub fn consistent(&self) -> bool {
        self.traced_sent == self.sent && self.traced_received == self.received
    }
}

/// Average performance of every flow sharing a DSCP code point.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassSummary {
    pub dscp: u8,
    pub flows: usize,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub avg_delay: Option<Duration>,
    pub throughput_mbps: Option<f64>,
    pub loss_rate: Option<f64>,
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

impl ClassSummary {
    fn new(dscp: u8, flows: &[&FlowMetrics]) -> Self {
        let delays: Vec<u128> = flows
            .iter()
            .filter_map(|f| f.avg_delay)
            .map(|d| d.as_nanos())
            .collect();
        let avg_delay = (!delays.is_empty()).then(|| {
            Duration::from_nanos((delays.iter().sum::<u128>() / delays.len() as u128) as u64)
        });
        Self {
            dscp,
            flows: flows.len(),
            tx_packets: flows.iter().map(|f| f.tx_packets).sum(),
            rx_packets: flows.iter().map(|f| f.rx_packets).sum(),
            avg_delay,
            throughput_mbps: mean(flows.iter().filter_map(|f| f.throughput_mbps)),
            loss_rate: mean(flows.iter().filter_map(|f| f.loss_rate)),
        }
    }
}

/// Everything derived from a run.
#[derive(Clone, Debug, PartialEq)]
pub struct Report {
    /// Ordered by [FlowId].
    pub flows: Vec<FlowMetrics>,
    pub nodes: BTreeMap<NodeId, NodeMetrics>,
    pub classes: BTreeMap<u8, ClassSummary>,

    /// Cumulative energy of each node over simulated time.
    pub timeline: BTreeMap<NodeId, Vec<(Duration, f64)>>,
}

impl Report {
    pub fn flow(&self, id: FlowId) -> Option<&FlowMetrics> {
        self.flows.iter().find(|flow| flow.id == id)
    }
}

/// Computes a [Report] from the artifacts of a run.
#[derive(Clone, Debug, Default)]
pub struct Analyzer {
    model: EnergyModel,
}

impl Analyzer {
    /// Create an analyzer charging energy according to `model`.
    pub fn new(model: EnergyModel) -> Self {
        Self { model }
    }

    /// Produce the [Report] of a run from its flows, its trace and the counters of
    /// every node.
    pub fn analyze<C: Counters>(
        &self,
        flows: &[FlowRecord],
        trace: &Snapshot,
        nodes: &BTreeMap<NodeId, C>,
    ) -> Report {
        let mut flows: Vec<_> = flows.iter().map(FlowMetrics::new).collect();
        flows.sort_by_key(|flow| flow.id);

        // Group flows by class
        let mut by_dscp: BTreeMap<u8, Vec<&FlowMetrics>> = BTreeMap::new();
        for flow in &flows {
            by_dscp.entry(flow.dscp).or_default().push(flow);
        }
        let classes = by_dscp
            .into_iter()
            .map(|(dscp, flows)| (dscp, ClassSummary::new(dscp, &flows)))
            .collect();

        // Tally the trace
        let mut tally: BTreeMap<NodeId, (u64, u64)> = BTreeMap::new();
        for record in trace {
            let entry = tally.entry(record.node).or_default();
            if record.is_transmission() {
                entry.0 += 1;
            } else if record.kind == EventKind::ReceivedPacket {
                entry.1 += 1;
            }
        }

        // Compute energy from the counters
        let ledger = EnergyLedger::new(self.model, nodes);
        let nodes = ledger
            .nodes()
            .map(|node| {
                let (traced_sent, traced_received) =
                    tally.get(&node).copied().unwrap_or_default();
                let metrics = NodeMetrics {
                    node,
                    sent: ledger.sent(node),
                    received: ledger.received(node),
                    energy_joules: ledger.energy(node),
                    traced_sent,
                    traced_received,
                };
                if !metrics.consistent() {
                    warn!(node, ?metrics, "trace disagrees with counters");
                }
                (node, metrics)
            })
            .collect();

        Report {
            flows,
            nodes,
            classes,
            timeline: energy::timeline(&self.model, trace),
        }
    }
}
