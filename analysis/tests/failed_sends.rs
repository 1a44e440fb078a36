use meshsim_analysis::{energy::EnergyModel, Analyzer};
use meshsim_node::{
    publisher::{Config, Publisher, Role},
    Application, Classifier, Message, Metrics,
};
use meshsim_runtime::{
    deterministic::{self, Runner},
    network::{self, Interface},
    NodeId,
};
use meshsim_trace::{EventKind, Trace};
use prometheus_client::registry::Registry;
use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv6Addr},
    time::Duration,
};

fn ip(node: NodeId) -> IpAddr {
    IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 1, 0, 0, 0, 0, node as u16 + 1))
}

#[test]
fn test_rejected_sends_cost_energy() {
    let mut registry = Registry::default();
    let mut runner = Runner::new(
        deterministic::Config {
            seed: 0,
            deadline: Some(Duration::from_secs(30)),
            network: network::Config {
                // Smaller than any telemetry reading
                max_datagram_size: 8,
                ..Default::default()
            },
        },
        &mut registry,
    )
    .unwrap();
    let metrics = Metrics::init(&mut registry);
    let trace = Trace::memory();
    let mut nodes = BTreeMap::new();
    for (node, role) in [(0, Role::Sensor), (1, Role::Aggregator)] {
        runner
            .network()
            .attach(node, ip(node), Interface::default())
            .unwrap();
        let cfg = Config {
            role,
            port: 1883,
            aggregator: ip(1),
            max_messages: 4,
            base_interval: Duration::from_secs(1),
            jitter: Duration::ZERO,
            intent: None,
        };
        let publisher = Publisher::new(
            cfg,
            Classifier::default(),
            trace.clone(),
            metrics.clone(),
        );
        nodes.insert(node, Application::Publisher(publisher));
        runner.schedule(node, Duration::ZERO, Message::Start);
    }
    runner.run(&mut nodes);

    let snapshot = trace.snapshot();
    assert_eq!(snapshot.count(0, EventKind::SentPacket), 0);
    assert_eq!(snapshot.count(0, EventKind::Error), 4);

    let model = EnergyModel::default();
    let report = Analyzer::new(model).analyze(&runner.flows(), &snapshot, &nodes);
    let sensor = &report.nodes[&0];
    assert_eq!(sensor.sent, 4);
    assert_eq!(sensor.traced_sent, 4);
    assert!(sensor.consistent());
    assert!((sensor.energy_joules - 4.0 * model.tx_joules).abs() < 1e-12);

    // The timeline ends at the energy derived from the counters
    let timeline = &report.timeline[&0];
    assert_eq!(timeline.len(), 4);
    assert!(timeline.windows(2).all(|w| w[0].1 < w[1].1));
    assert!((timeline[3].1 - sensor.energy_joules).abs() < 1e-12);
}
