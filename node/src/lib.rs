//! Run telemetry publishers, aggregators and classified streams on simulated nodes.
//!
//! Every simulated node runs one [Application]. All applications consume the same
//! [Message] type so that a single [Runner](meshsim_runtime::deterministic::Runner)
//! can drive a mixed deployment:
//!
//! - [publisher::Publisher] with [publisher::Role::Sensor] emits bounded, jittered
//!   telemetry to an aggregator and counts the acknowledgments it receives.
//! - [publisher::Publisher] with [publisher::Role::Aggregator] counts arriving telemetry
//!   and acknowledges each datagram to its sender.
//! - [stream::Source] and [stream::Sink] generate and absorb a constant bit rate flow.
//!
//! Outbound datagrams are marked by a [Classifier] whenever the application is
//! configured with a [FlowIntent]. Every send, receive and failure is appended to the
//! shared [Trace](meshsim_trace::Trace).

use meshsim_runtime::{
    deterministic::{Actor, Context, Input},
    NodeId,
};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

pub mod classifier;
pub mod publisher;
pub mod stream;

pub use classifier::{Classifier, FlowIntent, TrafficClass};

/// Input delivered to an [Application].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message {
    /// Begin operating.
    Start,
    /// Stop operating and release the endpoint.
    Stop,
    /// Emit the next datagram if `generation` is still current.
    Publish { generation: u64 },
}

/// Read access to per-node traffic counters.
pub trait Counters {
    /// Number of datagrams the application attempted to send.
    fn sent(&self) -> u64;

    /// Number of datagrams the application received.
    fn received(&self) -> u64;
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct Peer {
    node: String,
}

impl Peer {
    pub(crate) fn new(node: NodeId) -> Self {
        Self {
            node: node.to_string(),
        }
    }
}

/// Application-level counters shared by every node of a run.
#[derive(Clone, Default)]
pub struct Metrics {
    pub(crate) sent: Family<Peer, Counter>,
    pub(crate) received: Family<Peer, Counter>,
    pub(crate) acknowledged: Family<Peer, Counter>,
    pub(crate) failures: Family<Peer, Counter>,
}

impl Metrics {
    /// Register the counters of every application with `registry`.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "messages_sent",
            "Messages sent by node",
            metrics.sent.clone(),
        );
        registry.register(
            "messages_received",
            "Messages received by node",
            metrics.received.clone(),
        );
        registry.register(
            "acknowledgments_sent",
            "Acknowledgments sent by node",
            metrics.acknowledged.clone(),
        );
        registry.register(
            "failures",
            "Bind and send failures by node",
            metrics.failures.clone(),
        );
        metrics
    }
}

/// The application running on a simulated node.
pub enum Application {
    Publisher(publisher::Publisher),
    Source(stream::Source),
    Sink(stream::Sink),
}

impl Actor<Message> for Application {
    fn handle(&mut self, context: &mut Context<'_, Message>, input: Input<Message>) {
        match self {
            Self::Publisher(publisher) => publisher.handle(context, input),
            Self::Source(source) => source.handle(context, input),
            Self::Sink(sink) => sink.handle(context, input),
        }
    }
}

impl Counters for Application {
    fn sent(&self) -> u64 {
        match self {
            Self::Publisher(publisher) => publisher.sent(),
            Self::Source(source) => source.sent(),
            Self::Sink(sink) => sink.sent(),
        }
    }

    fn received(&self) -> u64 {
        match self {
            Self::Publisher(publisher) => publisher.received(),
            Self::Source(source) => source.received(),
            Self::Sink(sink) => sink.received(),
        }
    }
}
