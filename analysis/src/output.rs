//! Plain-text renderings of a [Report].

use crate::{Error, Report};
use meshsim_runtime::NodeId;
use std::io::Write;

/// Header of the per-flow CSV.
pub const FLOWS_HEADER: &str = "FlowID,Source,Destination,DSCP,TxPackets,RxPackets,Throughput(Mbps),AvgDelay(ms),PacketLossRate(%)";

fn optional(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(String::new, |value| format!("{value:.precision$}"))
}

/// One average delay (in seconds) per flow that received at least one packet.
pub fn latency(report: &Report, mut writer: impl Write) -> Result<(), Error> {
    for flow in &report.flows {
        if let Some(delay) = flow.avg_delay {
            writeln!(writer, "{:.6}", delay.as_secs_f64())?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// One sent count per node in `nodes`.
pub fn messages_sent(
    report: &Report,
    nodes: impl IntoIterator<Item = NodeId>,
    mut writer: impl Write,
) -> Result<(), Error> {
    for node in nodes {
        let sent = report.nodes.get(&node).map_or(0, |metrics| metrics.sent);
        writeln!(writer, "{sent}")?;
    }
    writer.flush()?;
    Ok(())
}

/// One energy estimate (in joules) per node in `nodes`.
pub fn energy(
    report: &Report,
    nodes: impl IntoIterator<Item = NodeId>,
    mut writer: impl Write,
) -> Result<(), Error> {
    for node in nodes {
        let energy = report
            .nodes
            .get(&node)
            .map_or(0.0, |metrics| metrics.energy_joules);
        writeln!(writer, "{energy:.6}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Every flow as a CSV row. Absent metrics are left empty.
pub fn flows(report: &Report, mut writer: impl Write) -> Result<(), Error> {
    writeln!(writer, "{FLOWS_HEADER}")?;
    for flow in &report.flows {
        writeln!(
            writer,
            "{},{},{},{},{},{},{},{},{}",
            flow.id,
            flow.source,
            flow.destination,
            flow.dscp,
            flow.tx_packets,
            flow.rx_packets,
            optional(flow.throughput_mbps, 6),
            optional(flow.avg_delay.map(|d| d.as_secs_f64() * 1e3), 3),
            optional(flow.loss_rate, 2),
        )?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FlowMetrics, NodeMetrics};
    use meshsim_runtime::flows::FlowId;
    use std::{collections::BTreeMap, time::Duration};

    fn report() -> Report {
        let flow = |id, rx, avg_delay: Option<Duration>, throughput_mbps, loss_rate| FlowMetrics {
            id: FlowId(id),
            source: "[2001:db8:1::1]:32768".parse().unwrap(),
            destination: "[2001:db8:1::4]:1883".parse().unwrap(),
            dscp: 26,
            tx_packets: 10,
            rx_packets: rx,
            rx_bytes: rx * 100,
            avg_delay,
            throughput_mbps,
            loss_rate,
        };
        let node = |node, sent, energy_joules| {
            (
                node,
                NodeMetrics {
                    node,
                    sent,
                    received: 0,
                    energy_joules,
                    traced_sent: sent,
                    traced_received: 0,
                },
            )
        };
        Report {
            flows: vec![
                flow(1, 4, Some(Duration::from_millis(200)), Some(0.0032), Some(60.0)),
                flow(2, 0, None, None, Some(100.0)),
            ],
            nodes: BTreeMap::from([node(0, 10, 0.15), node(1, 3, 0.045)]),
            classes: BTreeMap::new(),
            timeline: BTreeMap::new(),
        }
    }

    fn render(f: impl FnOnce(&mut Vec<u8>) -> Result<(), Error>) -> String {
        let mut buffer = Vec::new();
        f(&mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_latency_skips_silent_flows() {
        let report = report();
        assert_eq!(render(|w| latency(&report, w)), "0.200000\n");
    }

    #[test]
    fn test_per_node_lines() {
        let report = report();
        assert_eq!(render(|w| messages_sent(&report, [0, 1, 2], w)), "10\n3\n0\n");
        assert_eq!(
            render(|w| energy(&report, [0, 1], w)),
            "0.150000\n0.045000\n"
        );
    }

    #[test]
    fn test_flows_csv() {
        let report = report();
        let csv = render(|w| flows(&report, w));
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines[0], FLOWS_HEADER);
        assert_eq!(
            lines[1],
            "1,[2001:db8:1::1]:32768,[2001:db8:1::4]:1883,26,10,4,0.003200,200.000,60.00"
        );
        assert_eq!(
            lines[2],
            "2,[2001:db8:1::1]:32768,[2001:db8:1::4]:1883,26,10,0,,,100.00"
        );
    }
}
