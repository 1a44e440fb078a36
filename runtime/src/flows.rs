//! Per-flow packet accounting.
//!
//! A flow is the set of datagrams sharing a (source address, destination address)
//! pair, where both addresses include the port. The [Monitor] is updated by the
//! [crate::network::Network] as datagrams are sent, delivered or dropped and can
//! be snapshotted at any time.

use std::{collections::HashMap, fmt, net::SocketAddr, time::Duration};

/// Identifier of a flow, assigned from `1` in first-seen order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(pub u32);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Accumulated statistics for a single flow.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowRecord {
    pub id: FlowId,
    pub source: SocketAddr,
    pub destination: SocketAddr,

    /// ToS byte of the first datagram observed on the flow.
    pub tos: u8,

    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,

    /// Datagrams the fabric knows it dropped (loss, full queue, no listener).
    pub lost_packets: u64,

    /// Sum of the one-way delay of every received datagram.
    pub delay_sum: Duration,

    pub first_tx: Duration,
    pub last_tx: Duration,
    pub first_rx: Option<Duration>,
    pub last_rx: Option<Duration>,
}

impl FlowRecord {
    /// DSCP code point of the flow.
    pub const fn dscp(&self) -> u8 {
        self.tos >> 2
    }
}

/// Accumulates a [FlowRecord] for every flow observed on the network.
#[derive(Default)]
pub struct Monitor {
    index: HashMap<(SocketAddr, SocketAddr), usize>,
    records: Vec<FlowRecord>,
}

impl Monitor {
    /// Record a transmitted datagram, returning the slot of its flow.
    pub(crate) fn transmitted(
        &mut self,
        source: SocketAddr,
        destination: SocketAddr,
        tos: u8,
        len: usize,
        now: Duration,
    ) -> usize {
        let slot = match self.index.get(&(source, destination)) {
            Some(slot) => *slot,
            None => {
                let slot = self.records.len();
                self.records.push(FlowRecord {
                    id: FlowId(slot as u32 + 1),
                    source,
                    destination,
                    tos,
                    tx_packets: 0,
                    tx_bytes: 0,
                    rx_packets: 0,
                    rx_bytes: 0,
                    lost_packets: 0,
                    delay_sum: Duration::ZERO,
                    first_tx: now,
                    last_tx: now,
                    first_rx: None,
                    last_rx: None,
                });
                self.index.insert((source, destination), slot);
                slot
            }
        };
        let record = &mut self.records[slot];
        record.tx_packets += 1;
        record.tx_bytes += len as u64;
        record.last_tx = now;
        slot
    }

    /// Record a datagram handed to a listening endpoint.
    pub(crate) fn received(&mut self, slot: usize, len: usize, delay: Duration, now: Duration) {
        let record = &mut self.records[slot];
        record.rx_packets += 1;
        record.rx_bytes += len as u64;
        record.delay_sum += delay;
        record.first_rx.get_or_insert(now);
        record.last_rx = Some(now);
    }

    /// Record a datagram dropped by the fabric.
    pub(crate) fn lost(&mut self, slot: usize) {
        self.records[slot].lost_packets += 1;
    }

    /// Returns a copy of every record, ordered by [FlowId].
    pub fn snapshot(&self) -> Vec<FlowRecord> {
        self.records.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_flow_ids_in_first_seen_order() {
        let mut monitor = Monitor::default();
        let a = monitor.transmitted(addr("[::1]:1"), addr("[::2]:9"), 0, 10, Duration::ZERO);
        let b = monitor.transmitted(addr("[::3]:1"), addr("[::2]:9"), 0, 10, Duration::ZERO);
        let c = monitor.transmitted(addr("[::1]:1"), addr("[::2]:9"), 0, 10, Duration::ZERO);
        assert_eq!(a, c);
        assert_ne!(a, b);

        let flows = monitor.snapshot();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].id, FlowId(1));
        assert_eq!(flows[0].tx_packets, 2);
        assert_eq!(flows[1].id, FlowId(2));
    }

    #[test]
    fn test_receive_accounting() {
        let mut monitor = Monitor::default();
        let slot = monitor.transmitted(
            addr("[::1]:1"),
            addr("[::2]:9"),
            46 << 2,
            100,
            Duration::from_secs(1),
        );
        monitor.received(slot, 100, Duration::from_millis(20), Duration::from_millis(1020));
        monitor.transmitted(addr("[::1]:1"), addr("[::2]:9"), 0, 100, Duration::from_secs(2));
        monitor.lost(slot);

        let record = &monitor.snapshot()[0];
        assert_eq!(record.dscp(), 46);
        assert_eq!(record.tx_packets, 2);
        assert_eq!(record.rx_packets, 1);
        assert_eq!(record.rx_bytes, 100);
        assert_eq!(record.lost_packets, 1);
        assert_eq!(record.delay_sum, Duration::from_millis(20));
        assert_eq!(record.first_rx, Some(Duration::from_millis(1020)));
        assert_eq!(record.last_tx, Duration::from_secs(2));
    }
}
