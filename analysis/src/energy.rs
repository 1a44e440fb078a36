//! Per-node energy estimates from fixed per-event costs.

use meshsim_node::Counters;
use meshsim_runtime::NodeId;
use meshsim_trace::{EventKind, Record, Snapshot};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

/// Energy spent per transmitted and per received datagram.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyModel {
    pub tx_joules: f64,
    pub rx_joules: f64,
}

impl Default for EnergyModel {
    fn default() -> Self {
        Self {
            tx_joules: 0.015,
            rx_joules: 0.005,
        }
    }
}

impl EnergyModel {
    /// Energy (in joules) spent sending `sent` and receiving `received` datagrams.
    pub fn energy(&self, sent: u64, received: u64) -> f64 {
        sent as f64 * self.tx_joules + received as f64 * self.rx_joules
    }

    /// Energy attributed to a single traced event.
    ///
    /// Every transmission attempt costs `tx_joules`, including the ones the endpoint
    /// rejected, matching the node counters.
    pub fn cost(&self, record: &Record) -> f64 {
        if record.is_transmission() {
            return self.tx_joules;
        }
        match record.kind {
            EventKind::ReceivedPacket => self.rx_joules,
            _ => 0.0,
        }
    }
}

/// Sent and received counters of every node, captured once at the end of a run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnergyLedger {
    model: EnergyModel,
    counters: BTreeMap<NodeId, (u64, u64)>,
}

impl EnergyLedger {
    /// Capture the counters of `nodes`.
    pub fn new<'a, C, I>(model: EnergyModel, nodes: I) -> Self
    where
        C: Counters + 'a,
        I: IntoIterator<Item = (&'a NodeId, &'a C)>,
    {
        let counters = nodes
            .into_iter()
            .map(|(node, counters)| (*node, (counters.sent(), counters.received())))
            .collect();
        Self { model, counters }
    }

    pub fn sent(&self, node: NodeId) -> u64 {
        self.counters.get(&node).map_or(0, |(sent, _)| *sent)
    }

    pub fn received(&self, node: NodeId) -> u64 {
        self.counters.get(&node).map_or(0, |(_, received)| *received)
    }

    /// Energy (in joules) spent by `node`.
    pub fn energy(&self, node: NodeId) -> f64 {
        self.model.energy(self.sent(node), self.received(node))
    }

    /// Energy spent by every node.
    pub fn total(&self) -> f64 {
        self.counters
            .values()
            .map(|(sent, received)| self.model.energy(*sent, *received))
            .sum()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.counters.keys().copied()
    }
}

/// Cumulative energy of each node after every traced event that costs energy.
pub fn timeline(model: &EnergyModel, trace: &Snapshot) -> BTreeMap<NodeId, Vec<(Duration, f64)>> {
    let mut timeline: BTreeMap<NodeId, Vec<(Duration, f64)>> = BTreeMap::new();
    for record in trace {
        let cost = model.cost(record);
        if cost == 0.0 {
            continue;
        }
        let points = timeline.entry(record.node).or_default();
        let total = points.last().map_or(0.0, |(_, total)| *total) + cost;
        points.push((record.timestamp, total));
    }
    timeline
}
