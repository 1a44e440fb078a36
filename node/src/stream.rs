//! Constant bit rate flows and the sinks that absorb them.

use crate::{publisher::State, Classifier, Counters, FlowIntent, Message, Metrics, Peer};
use bytes::{BufMut, BytesMut};
use meshsim_runtime::{
    deterministic::{Actor, Context, Input},
    Clock, Datagram, Error, Scheduler, Socket, Timer, Transport,
};
use meshsim_trace::{EventKind, Trace, FAILED_SEND};
use std::{
    net::{IpAddr, Ipv6Addr, SocketAddr},
    time::Duration,
};
use tracing::{debug, warn};

/// Configuration for a [Source].
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub peer: SocketAddr,
    pub rate_bps: u64,

    /// Size of every datagram (including the sequence number prefix).
    pub packet_size: usize,

    pub intent: Option<FlowIntent>,
}

/// Time between two consecutive `packet_size` datagrams sent at `rate_bps`.
///
/// Never shorter than a nanosecond, so a source always makes progress.
pub fn interval(packet_size: usize, rate_bps: u64) -> Duration {
    let bits = packet_size as u128 * 8;
    let rate = u128::from(rate_bps.max(1));
    let nanos = u64::try_from(bits * 1_000_000_000 / rate).unwrap_or(u64::MAX);
    Duration::from_nanos(nanos.max(1))
}

impl SourceConfig {
    /// Time between two consecutive datagrams.
    pub fn interval(&self) -> Duration {
        interval(self.packet_size, self.rate_bps)
    }
}

/// Sends fixed-size datagrams to a peer at a constant rate.
pub struct Source {
    cfg: SourceConfig,
    classifier: Classifier,
    trace: Trace,
    metrics: Metrics,

    state: State,
    socket: Option<Socket>,
    timer: Option<Timer>,
    generation: u64,
    sent: u64,
}

impl Source {
    /// Create an idle source. It binds an ephemeral port and connects to `peer` on start.
    pub fn new(cfg: SourceConfig, classifier: Classifier, trace: Trace, metrics: Metrics) -> Self {
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
        }
    }

    pub const fn state(&self) -> State {
        self.state
    }

    fn start(&mut self, context: &mut Context<'_, Message>) {
        if self.state != State::Idle {
            return;
        }
        let result = context
            .bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0))
            .and_then(|socket| match context.connect(&socket, self.cfg.peer) {
                Ok(()) => Ok(socket),
                Err(err) => {
                    context.close(socket);
                    Err(err)
                }
            });
        match result {
            Ok(socket) => {
                self.socket = Some(socket);
                self.state = State::Running;
                self.tick(context);
            }
            Err(err) => self.fail(context, err),
        }
    }

    fn fail(&mut self, context: &mut Context<'_, Message>, err: Error) {
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
    }

    fn tick(&mut self, context: &mut Context<'_, Message>) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        let node = context.node();
        let now = context.current();
        let sequence = self.sent + 1;

        let mut payload = BytesMut::with_capacity(self.cfg.packet_size);
        payload.put_u64(sequence);
        payload.resize(self.cfg.packet_size.max(8), 0);
        let mut datagram = Datagram::new(payload.freeze());
        if let Some(intent) = self.cfg.intent {
            self.classifier.mark(&mut datagram, intent);
        }
        let tos = datagram.tos;
        match context.send(socket, datagram) {
            Ok(size) => self.trace.append(
                now,
                node,
                EventKind::SentPacket,
                format!("seq={sequence} size={size} tos={tos}"),
            ),
            Err(err) => {
                self.metrics.failures.get_or_create(&Peer::new(node)).inc();
                self.trace.append(
                    now,
                    node,
                    EventKind::Error,
                    format!("{FAILED_SEND}: seq={sequence} error={err}"),
                );
            }
        }
        self.sent += 1;
        self.metrics.sent.get_or_create(&Peer::new(node)).inc();

        let generation = self.generation;
        self.timer = Some(context.schedule(self.cfg.interval(), Message::Publish { generation }));
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
        debug!(node = context.node(), sent = self.sent, "stopped source");
    }
}

impl Actor<Message> for Source {
    fn handle(&mut self, context: &mut Context<'_, Message>, input: Input<Message>) {
        match input {
            Input::Message(Message::Start) => self.start(context),
            Input::Message(Message::Stop) => self.stop(context),
            Input::Message(Message::Publish { generation }) => {
                if generation == self.generation && self.state == State::Running {
                    self.timer = None;
                    self.tick(context);
                }
            }
            Input::Readable(_) => {
                // Sources never expect replies
                if let Some(socket) = self.socket.as_ref() {
                    while context.recv_from(socket).is_some() {}
                }
            }
        }
    }
}

impl Counters for Source {
    fn sent(&self) -> u64 {
        self.sent
    }

    fn received(&self) -> u64 {
        0
    }
}

/// Absorbs every datagram sent to its port.
pub struct Sink {
    port: u16,
    trace: Trace,
    metrics: Metrics,

    state: State,
    socket: Option<Socket>,
    received: u64,
    received_bytes: u64,
}

impl Sink {
    /// Create a sink that listens on `port` once started.
    pub fn new(port: u16, trace: Trace, metrics: Metrics) -> Self {
        Self {
            port,
            trace,
            metrics,
            state: State::Idle,
            socket: None,
            received: 0,
            received_bytes: 0,
        }
    }

    pub const fn state(&self) -> State {
        self.state
    }

    /// Payload bytes received so far.
    pub const fn received_bytes(&self) -> u64 {
        self.received_bytes
    }
}

impl Actor<Message> for Sink {
    fn handle(&mut self, context: &mut Context<'_, Message>, input: Input<Message>) {
        let node = context.node();
        match input {
            Input::Message(Message::Start) => {
                if self.state != State::Idle {
                    return;
                }
                let address = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), self.port);
                match context.bind(address) {
                    Ok(socket) => {
                        self.socket = Some(socket);
                        self.state = State::Running;
                    }
                    Err(err) => {
                        warn!(node, ?err, "failed to bind");
                        self.trace.append(
                            context.current(),
                            node,
                            EventKind::Error,
                            format!("bind failed: {err}"),
                        );
                        self.metrics.failures.get_or_create(&Peer::new(node)).inc();
                        self.state = State::Failed;
                    }
                }
            }
            Input::Message(Message::Stop) => {
                if let Some(socket) = self.socket.take() {
                    context.close(socket);
                    self.state = State::Stopped;
                }
            }
            Input::Message(Message::Publish { .. }) => {}
            Input::Readable(_) => {
                let Some(socket) = self.socket.as_ref() else {
                    return;
                };
                while let Some((from, datagram)) = context.recv_from(socket) {
                    self.received += 1;
                    self.received_bytes += datagram.len() as u64;
                    self.metrics.received.get_or_create(&Peer::new(node)).inc();
                    self.trace.append(
                        context.current(),
                        node,
                        EventKind::ReceivedPacket,
                        format!("from={from} size={}", datagram.len()),
                    );
                }
            }
        }
    }
}

impl Counters for Sink {
    fn sent(&self) -> u64 {
        0
    }

    fn received(&self) -> u64 {
        self.received
    }
}
