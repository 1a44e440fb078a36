//! Publish bounded, jittered telemetry and acknowledge it at an aggregator.
//!
//! A [Publisher] moves through [State::Idle], [State::Running] and [State::Waiting]
//! until it is stopped (or fails to bind). Sensors publish immediately on start and
//! then after every `base_interval + uniform(0, jitter)` until `max_messages` have
//! been attempted. The aggregator never publishes: it drains every datagram waiting at
//! its endpoint and replies to each with [ACK].
//!
//! Each scheduled publish carries the publisher's generation. Stopping bumps the
//! generation (and cancels the pending timer), so a publish that was already in flight
//! is ignored.

use crate::{Classifier, Counters, FlowIntent, Message, Metrics, Peer};
use bytes::Bytes;
use meshsim_runtime::{
    deterministic::{Actor, Context, Input},
    Clock, Datagram, Error, NodeId, Scheduler, Socket, Timer, Transport,
};
use meshsim_trace::{EventKind, Trace, FAILED_SEND};
use rand::Rng;
use std::{
    fmt,
    net::{IpAddr, Ipv6Addr, SocketAddr},
    time::Duration,
};
use tracing::{debug, warn};

/// Payload of every acknowledgment.
pub const ACK: &[u8] = b"ACK";

/// Part a [Publisher] plays in a deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Sensor,
    Aggregator,
}

/// Lifecycle of a [Publisher] (or a stream endpoint).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Waiting,
    Stopped,
    Failed,
}

/// Configuration for a [Publisher].
#[derive(Clone, Debug)]
pub struct Config {
    pub role: Role,

    /// Port the aggregator listens on.
    pub port: u16,

    /// Address of the aggregator.
    pub aggregator: IpAddr,

    /// Maximum number of publish attempts.
    pub max_messages: u64,

    /// Minimum delay between two publish attempts.
    pub base_interval: Duration,

    /// Upper bound (inclusive) of the uniform delay added to `base_interval`.
    pub jitter: Duration,

    /// Marking applied to outbound datagrams (unmarked when `None`).
    pub intent: Option<FlowIntent>,
}

/// A single telemetry reading.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryMessage {
    pub node: NodeId,
    pub sequence: u64,

    /// Degrees Celsius in `[20.0, 30.0)` with a resolution of 0.1.
    pub temperature: f64,

    /// Relative humidity in `[50, 80)`.
    pub humidity: u8,
}

impl TelemetryMessage {
    /// Synthesize a reading.
    pub fn random<R: Rng + ?Sized>(rng: &mut R, node: NodeId, sequence: u64) -> Self {
        let temperature = f64::from(rng.gen_range(200u16..300)) / 10.0;
        let humidity = rng.gen_range(50..80);
        Self {
            node,
            sequence,
            temperature,
            humidity,
        }
    }

    /// Encode the reading as its text line.
    pub fn encode(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl fmt::Display for TelemetryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} Temp: {:.1} °C, Hum: {}%",
            self.sequence, self.temperature, self.humidity
        )
    }
}

/// Telemetry publisher (or aggregator) state machine.
pub struct Publisher {
    cfg: Config,
    classifier: Classifier,
    trace: Trace,
    metrics: Metrics,

    state: State,
    socket: Option<Socket>,
    timer: Option<Timer>,
    generation: u64,

    sent: u64,
    acknowledged: u64,
    received: u64,
}

impl Publisher {
    /// Create an idle publisher. Nothing is bound until [Message::Start] is handled.
    pub fn new(cfg: Config, classifier: Classifier, trace: Trace, metrics: Metrics) -> Self {
        Self {
            cfg,
            classifier,
            trace,
            metrics,
            state: State::Idle,
            socket: None,
            timer: None,
            generation: 0,
            sent: 0,
            acknowledged: 0,
            received: 0,
        }
    }

    pub const fn state(&self) -> State {
        self.state
    }

    pub const fn role(&self) -> Role {
        self.cfg.role
    }

    fn start(&mut self, context: &mut Context<'_, Message>) {
        if self.state != State::Idle {
            debug!(node = context.node(), state = ?self.state, "ignoring start");
            return;
        }
        self.state = State::Running;
        if let Err(err) = self.open(context) {
            let node = context.node();
            warn!(node, ?err, "failed to bind");
            self.trace.append(
                context.current(),
                node,
                EventKind::Error,
                format!("bind failed: {err}"),
            );
            self.metrics.failures.get_or_create(&Peer::new(node)).inc();
            self.state = State::Failed;
            return;
        }
        if self.cfg.role == Role::Sensor {
            self.publish(context);
        }
    }

    fn open(&mut self, context: &mut Context<'_, Message>) -> Result<(), Error> {
        if self.socket.is_some() {
            return Ok(());
        }
        let unspecified = IpAddr::V6(Ipv6Addr::UNSPECIFIED);
        let socket = match self.cfg.role {
            Role::Aggregator => context.bind(SocketAddr::new(unspecified, self.cfg.port))?,
            Role::Sensor => {
                let socket = context.bind(SocketAddr::new(unspecified, 0))?;
                let peer = SocketAddr::new(self.cfg.aggregator, self.cfg.port);
                if let Err(err) = context.connect(&socket, peer) {
                    context.close(socket);
                    return Err(err);
                }
                socket
            }
        };
        self.socket = Some(socket);
        Ok(())
    }

    fn publish(&mut self, context: &mut Context<'_, Message>) {
        let node = context.node();
        let now = context.current();
        if self.sent >= self.cfg.max_messages {
            self.trace.append(
                now,
                node,
                EventKind::ReachedMaxMessages,
                format!("sent={} max={}", self.sent, self.cfg.max_messages),
            );
            return;
        }
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        self.state = State::Running;

        // Send the next reading
        let sequence = self.sent + 1;
        let message = TelemetryMessage::random(context, node, sequence);
        let mut datagram = Datagram::new(message.encode());
        if let Some(intent) = self.cfg.intent {
            self.classifier.mark(&mut datagram, intent);
        }
        let len = datagram.len();
        let tos = datagram.tos;
        match context.send(socket, datagram) {
            Ok(size) => {
                debug!(node, seq = sequence, size, tos, "sent telemetry");
                self.trace.append(
                    now,
                    node,
                    EventKind::SentPacket,
                    format!("seq={sequence} size={size} tos={tos}"),
                );
            }
            Err(err) => {
                debug!(node, seq = sequence, ?err, "failed to send telemetry");
                self.trace.append(
                    now,
                    node,
                    EventKind::Error,
                    format!("{FAILED_SEND}: seq={sequence} size={len} error={err}"),
                );
                self.metrics.failures.get_or_create(&Peer::new(node)).inc();
            }
        }
        self.sent += 1;
        self.metrics.sent.get_or_create(&Peer::new(node)).inc();

        // Schedule the next reading
        if self.sent >= self.cfg.max_messages {
            self.trace.append(
                now,
                node,
                EventKind::ReachedMaxMessages,
                format!("sent={} max={}", self.sent, self.cfg.max_messages),
            );
            return;
        }
        let jitter = u64::try_from(self.cfg.jitter.as_nanos()).unwrap_or(u64::MAX);
        let jitter = context.gen_range(0..=jitter);
        let delay = self.cfg.base_interval + Duration::from_nanos(jitter);
        let generation = self.generation;
        self.timer = Some(context.schedule(delay, Message::Publish { generation }));
        self.state = State::Waiting;
    }

    fn receive(&mut self, context: &mut Context<'_, Message>, address: SocketAddr) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        if socket.local_addr() != address {
            return;
        }
        let node = context.node();
        while let Some((from, datagram)) = context.recv_from(socket) {
            let now = context.current();
            self.received += 1;
            self.metrics.received.get_or_create(&Peer::new(node)).inc();
            self.trace.append(
                now,
                node,
                EventKind::ReceivedPacket,
                format!("from={from} size={}", datagram.len()),
            );
            if self.cfg.role != Role::Aggregator {
                continue;
            }

            // Acknowledge
            let mut ack = Datagram::new(Bytes::from_static(ACK));
            if let Some(intent) = self.cfg.intent {
                self.classifier.mark(&mut ack, intent);
            }
            self.acknowledged += 1;
            match context.send_to(socket, from, ack) {
                Ok(size) => {
                    self.metrics
                        .acknowledged
                        .get_or_create(&Peer::new(node))
                        .inc();
                    self.trace.append(
                        now,
                        node,
                        EventKind::GatewayResponse,
                        format!("to={from} size={size}"),
                    );
                }
                Err(err) => {
                    self.metrics.failures.get_or_create(&Peer::new(node)).inc();
                    self.trace.append(
                        now,
                        node,
                        EventKind::Error,
                        format!("{FAILED_SEND}: ack to={from} error={err}"),
                    );
                }
            }
        }
    }

    fn stop(&mut self, context: &mut Context<'_, Message>) {
        if matches!(self.state, State::Stopped | State::Failed) {
            return;
        }
        self.state = State::Stopped;
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            context.cancel(timer);
        }
        if let Some(socket) = self.socket.take() {
            context.close(socket);
        }
        debug!(node = context.node(), sent = self.sent, received = self.received, "stopped");
    }
}

impl Actor<Message> for Publisher {
    fn handle(&mut self, context: &mut Context<'_, Message>, input: Input<Message>) {
        match input {
            Input::Message(Message::Start) => self.start(context),
            Input::Message(Message::Stop) => self.stop(context),
            Input::Message(Message::Publish { generation }) => {
                if generation != self.generation
                    || !matches!(self.state, State::Running | State::Waiting)
                {
                    debug!(node = context.node(), generation, "ignoring stale publish");
                    return;
                }
                self.timer = None;
                self.publish(context);
            }
            Input::Readable(address) => self.receive(context, address),
        }
    }
}

impl Counters for Publisher {
    /// Telemetry publish attempts plus acknowledgment attempts.
    fn sent(&self) -> u64 {
        self.sent + self.acknowledged
    }

    fn received(&self) -> u64 {
        self.received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use meshsim_runtime::{
        deterministic::{self, Runner},
        network::{self, Interface},
    };
    use meshsim_trace::Snapshot;
    use prometheus_client::registry::Registry;
    use rand::{rngs::StdRng, SeedableRng};
    use std::collections::BTreeMap;
    use test_case::test_case;

    const PORT: u16 = 1883;

    fn ip(node: NodeId) -> IpAddr {
        IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 1, 0, 0, 0, 0, node as u16 + 1))
    }

    struct Deployment {
        runner: Runner<Message>,
        nodes: BTreeMap<NodeId, Publisher>,
        trace: Trace,
        aggregator: NodeId,
    }

    impl Deployment {
        fn new(
            seed: u64,
            sensors: NodeId,
            max_messages: u64,
            jitter: Duration,
            network: network::Config,
        ) -> Self {
            let mut registry = Registry::default();
            let mut runner = Runner::new(
                deterministic::Config {
                    seed,
                    deadline: Some(Duration::from_secs(100)),
                    network,
                },
                &mut registry,
            )
            .unwrap();
            let metrics = Metrics::init(&mut registry);
            let trace = Trace::memory();
            let aggregator = sensors;
            let mut nodes = BTreeMap::new();
            for node in 0..=sensors {
                runner
                    .network()
                    .attach(node, ip(node), Interface::default())
                    .unwrap();
                let role = if node == aggregator {
                    Role::Aggregator
                } else {
                    Role::Sensor
                };
                let cfg = Config {
                    role,
                    port: PORT,
                    aggregator: ip(aggregator),
                    max_messages,
                    base_interval: Duration::from_secs(1),
                    jitter,
                    intent: None,
                };
                nodes.insert(
                    node,
                    Publisher::new(cfg, Classifier::default(), trace.clone(), metrics.clone()),
                );
                let start = if node == aggregator {
                    Duration::ZERO
                } else {
                    Duration::from_secs(1)
                };
                runner.schedule(node, start, Message::Start);
            }
            Self {
                runner,
                nodes,
                trace,
                aggregator,
            }
        }

        fn run(&mut self) -> Snapshot {
            self.runner.run(&mut self.nodes);
            self.trace.snapshot()
        }
    }

    #[test_case(0; "empty budget")]
    #[test_case(1; "single message")]
    #[test_case(5; "five messages")]
    fn test_budget_respected(max_messages: u64) {
        let mut deployment =
            Deployment::new(0, 3, max_messages, Duration::ZERO, network::Config::default());
        let snapshot = deployment.run();

        for sensor in 0..3 {
            let publisher = &deployment.nodes[&sensor];
            assert_eq!(publisher.sent(), max_messages);
            assert_eq!(publisher.received(), max_messages);
            assert_eq!(
                snapshot.count(sensor, EventKind::SentPacket),
                max_messages as usize
            );
            assert_eq!(snapshot.count(sensor, EventKind::ReachedMaxMessages), 1);
        }
        let aggregator = deployment.aggregator;
        assert_eq!(deployment.nodes[&aggregator].received(), 3 * max_messages);
        assert_eq!(deployment.nodes[&aggregator].sent(), 3 * max_messages);
        assert_eq!(
            snapshot.count(aggregator, EventKind::GatewayResponse),
            3 * max_messages as usize
        );
    }

    #[test]
    fn test_jitter_bounds() {
        for seed in 0..5 {
            let mut deployment = Deployment::new(
                seed,
                1,
                20,
                Duration::from_millis(500),
                network::Config::default(),
            );
            let snapshot = deployment.run();
            let sends: Vec<_> = snapshot
                .iter()
                .filter(|record| record.node == 0 && record.kind == EventKind::SentPacket)
                .map(|record| record.timestamp)
                .collect();
            assert_eq!(sends.len(), 20);
            assert_eq!(sends[0], Duration::from_secs(1));
            for pair in sends.windows(2) {
                let gap = pair[1] - pair[0];
                assert!(gap >= Duration::from_secs(1), "gap too small: {gap:?}");
                assert!(gap <= Duration::from_millis(1500), "gap too large: {gap:?}");
            }
        }
    }

    #[test_traced]
    fn test_stop_cancels_pending_publish() {
        let mut deployment =
            Deployment::new(0, 1, 20, Duration::ZERO, network::Config::default());
        let stop = Duration::from_millis(3500);
        deployment.runner.schedule(0, stop, Message::Stop);
        deployment
            .runner
            .schedule(0, Duration::from_secs(5), Message::Publish { generation: 0 });
        let snapshot = deployment.run();

        let publisher = &deployment.nodes[&0];
        assert_eq!(publisher.state(), State::Stopped);
        assert_eq!(publisher.sent(), 3);
        assert!(snapshot
            .iter()
            .filter(|record| record.node == 0)
            .all(|record| record.timestamp <= stop));
    }

    #[test_traced("WARN")]
    fn test_bind_failure_halts_publisher() {
        let mut deployment =
            Deployment::new(0, 2, 5, Duration::ZERO, network::Config::default());
        deployment.runner.network().reject_binds(0).unwrap();
        let snapshot = deployment.run();

        let failed = &deployment.nodes[&0];
        assert_eq!(failed.state(), State::Failed);
        assert_eq!(failed.sent(), 0);
        assert_eq!(snapshot.count(0, EventKind::Error), 1);
        assert_eq!(snapshot.count(0, EventKind::SentPacket), 0);

        // Other sensors are unaffected
        assert_eq!(deployment.nodes[&1].sent(), 5);
        assert_eq!(deployment.nodes[&deployment.aggregator].received(), 5);
    }

    #[test]
    fn test_aggregator_bind_failure() {
        let mut deployment =
            Deployment::new(0, 2, 4, Duration::ZERO, network::Config::default());
        let aggregator = deployment.aggregator;
        deployment.runner.network().reject_binds(aggregator).unwrap();
        let snapshot = deployment.run();

        assert_eq!(deployment.nodes[&aggregator].state(), State::Failed);
        assert_eq!(snapshot.count(aggregator, EventKind::ReceivedPacket), 0);
        for sensor in 0..2 {
            assert_eq!(deployment.nodes[&sensor].sent(), 4);
            assert_eq!(deployment.nodes[&sensor].received(), 0);
        }
        for flow in deployment.runner.flows() {
            assert_eq!(flow.tx_packets, 4);
            assert_eq!(flow.lost_packets, 4);
        }
    }

    #[test]
    fn test_send_failure_is_not_fatal() {
        let mut deployment = Deployment::new(
            0,
            1,
            4,
            Duration::ZERO,
            network::Config {
                max_datagram_size: 8,
                ..Default::default()
            },
        );
        let snapshot = deployment.run();

        assert_eq!(deployment.nodes[&0].sent(), 4);
        assert_eq!(snapshot.count(0, EventKind::SentPacket), 0);
        assert_eq!(snapshot.count(0, EventKind::Error), 4);
        assert_eq!(snapshot.count(0, EventKind::ReachedMaxMessages), 1);
        let attempts = snapshot
            .iter()
            .filter(|record| record.node == 0 && record.is_transmission())
            .count();
        assert_eq!(attempts, 4);
        assert!(deployment.runner.flows().is_empty());
    }

    #[test]
    fn test_marking() {
        let mut deployment =
            Deployment::new(0, 1, 2, Duration::ZERO, network::Config::default());
        deployment.nodes.get_mut(&0).unwrap().cfg.intent = Some(FlowIntent::Telemetry);
        deployment.run();

        let flows = deployment.runner.flows();
        assert_eq!(flows.len(), 2);
        let telemetry = flows
            .iter()
            .find(|flow| flow.destination.port() == PORT)
            .unwrap();
        assert_eq!(telemetry.dscp(), 26);
        let ack = flows
            .iter()
            .find(|flow| flow.source.port() == PORT)
            .unwrap();
        assert_eq!(ack.dscp(), 0);
    }

    #[test]
    fn test_message_encoding() {
        let message = TelemetryMessage {
            node: 0,
            sequence: 3,
            temperature: 24.5,
            humidity: 63,
        };
        assert_eq!(message.to_string(), "#3 Temp: 24.5 °C, Hum: 63%");
        assert_eq!(
            message.encode(),
            Bytes::from_static("#3 Temp: 24.5 °C, Hum: 63%".as_bytes())
        );
    }

    #[test]
    fn test_random_reading_ranges() {
        let mut rng = StdRng::seed_from_u64(0);
        for sequence in 0..1_000 {
            let message = TelemetryMessage::random(&mut rng, 0, sequence);
            assert!((20.0..30.0).contains(&message.temperature));
            assert!((50..80).contains(&message.humidity));
            let tenths = message.temperature * 10.0;
            assert!((tenths - tenths.round()).abs() < 1e-9);
        }
    }
}
