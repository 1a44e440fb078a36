//! In-memory datagram fabric with configurable link performance.
//!
//! Nodes are [attached](Network::attach) with a single IP address and an
//! [Interface] describing their ingress capacity. Datagrams travel over
//! unidirectional [Link]s (a default link applies to any pair without an explicit
//! one) and are subject to:
//!
//! - Serialization at the receiving interface when it has a finite capacity. Expedited
//!   datagrams (IP precedence 5 and above, see [Priority]) are served ahead of normal
//!   ones; each priority has its own tail-drop queue.
//! - A normally distributed propagation delay (clamped at zero).
//! - Random loss according to the link's success rate.
//!
//! Datagrams that arrive at an address nobody is bound to are dropped. Everything
//! the fabric observes is accounted in the [flows::Monitor](crate::flows::Monitor).

use crate::{flows::Monitor, Error, NodeId, Socket};
use bytes::Bytes;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    net::{IpAddr, SocketAddr},
    ops::Range,
    time::Duration,
};
use tracing::{debug, trace};

/// Range of ephemeral ports assigned when binding to port `0`.
///
/// Explicitly binding to a port in this range is rejected.
pub const EPHEMERAL_PORT_RANGE: Range<u16> = 32768..61000;

/// IP precedence at or above which a datagram is expedited.
const EXPEDITED_PRECEDENCE: u8 = 5;

/// Queueing treatment of a datagram at a capacity-limited interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    Expedited,
    Normal,
}

/// A datagram and the ToS byte it carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Bytes,
    pub tos: u8,
}

impl Datagram {
    /// Create an unmarked datagram.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            tos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Queueing treatment derived from the IP precedence bits of the ToS byte.
    pub const fn priority(&self) -> Priority {
        if self.tos >> 5 >= EXPEDITED_PRECEDENCE {
            Priority::Expedited
        } else {
            Priority::Normal
        }
    }
}

/// Describes a connection between two nodes.
///
/// Links are unidirectional (and must be set up in both directions
/// for a bidirectional connection).
#[derive(Clone, Debug, PartialEq)]
pub struct Link {
    /// Mean latency for the delivery of a datagram in milliseconds.
    pub latency_ms: f64,

    /// Standard deviation of the latency for the delivery of a datagram in milliseconds.
    pub jitter_ms: f64,

    /// Probability of a datagram being delivered successfully (in range [0,1]).
    pub success_rate: f64,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            latency_ms: 10.0,
            jitter_ms: 0.0,
            success_rate: 1.0,
        }
    }
}

impl Link {
    fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.success_rate) {
            return Err(Error::InvalidSuccessRate(self.success_rate));
        }
        if !(self.latency_ms >= 0.0 && self.jitter_ms >= 0.0) {
            return Err(Error::InvalidLatency(self.latency_ms, self.jitter_ms));
        }
        Ok(())
    }

    fn sample<R: Rng>(&self, rng: &mut R) -> Duration {
        let latency = if self.jitter_ms > 0.0 {
            match Normal::new(self.latency_ms, self.jitter_ms) {
                Ok(normal) => normal.sample(rng),
                Err(_) => self.latency_ms,
            }
        } else {
            self.latency_ms
        };
        Duration::from_nanos((latency.max(0.0) * 1_000_000.0).round() as u64)
    }
}

/// Ingress characteristics of an attached node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Interface {
    /// Capacity in bits per second (unlimited when `None`).
    pub ingress_bps: Option<u64>,

    /// Maximum datagrams waiting per priority before tail drop (unbounded when `None`).
    pub queue_limit: Option<usize>,
}

/// Configuration for a [Network].
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum payload size accepted by [crate::Transport::send].
    pub max_datagram_size: usize,

    /// Link used between any two nodes without an explicit one.
    pub default_link: Link,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_datagram_size: 1280,
            default_link: Link::default(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Peer {
    node: String,
}

impl Peer {
    fn new(node: NodeId) -> Self {
        Self {
            node: node.to_string(),
        }
    }
}

#[derive(Default)]
struct Metrics {
    sent: Family<Peer, Counter>,
    received: Family<Peer, Counter>,
    dropped: Family<Peer, Counter>,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "datagrams_sent",
            "Datagrams sent by node",
            metrics.sent.clone(),
        );
        registry.register(
            "datagrams_received",
            "Datagrams delivered to an endpoint by node",
            metrics.received.clone(),
        );
        registry.register(
            "datagrams_dropped",
            "Datagrams dropped by the fabric by sending node",
            metrics.dropped.clone(),
        );
        metrics
    }
}

struct Host {
    ip: IpAddr,
    interface: Interface,
    reject_binds: bool,

    /// Time at which each priority's queue drains.
    expedited_until: Duration,
    normal_until: Duration,
}

impl Host {
    /// Enqueue a datagram at the ingress interface, returning when it has been
    /// fully received (or `None` if the queue is full).
    fn admit(&mut self, now: Duration, len: usize, priority: Priority) -> Option<Duration> {
        let Some(bps) = self.interface.ingress_bps.filter(|bps| *bps > 0) else {
            return Some(now);
        };
        let bits = len as u128 * 8;
        let serialization = Duration::from_nanos((bits * 1_000_000_000 / bps as u128) as u64);
        let busy = match priority {
            Priority::Expedited => self.expedited_until,
            Priority::Normal => self.normal_until,
        };
        let start = busy.max(now);
        if let Some(limit) = self.interface.queue_limit {
            let backlog = (start - now).as_nanos();
            if backlog > serialization.as_nanos() * limit as u128 {
                return None;
            }
        }
        let finish = start + serialization;
        match priority {
            Priority::Expedited => {
                // Expedited traffic consumes capacity normal traffic would otherwise use
                self.expedited_until = finish;
                self.normal_until = self.normal_until.max(now) + serialization;
            }
            Priority::Normal => {
                self.normal_until = finish;
            }
        }
        Some(finish)
    }
}

struct Endpoint {
    owner: NodeId,
    local: SocketAddr,
    peer: Option<SocketAddr>,
    inbox: VecDeque<(SocketAddr, Datagram)>,
}

struct InFlight {
    origin: NodeId,
    source: SocketAddr,
    datagram: Datagram,
    sent: Duration,
    flow: usize,
}

/// Implementation of a simulated datagram network.
pub struct Network {
    cfg: Config,

    hosts: BTreeMap<NodeId, Host>,
    addresses: HashMap<IpAddr, NodeId>,
    links: HashMap<(NodeId, NodeId), Link>,

    endpoints: HashMap<u64, Endpoint>,
    bound: HashMap<SocketAddr, u64>,
    next_endpoint: u64,
    next_ephemeral: u16,

    in_flight: HashMap<SocketAddr, BTreeMap<(Duration, u64), InFlight>>,
    next_datagram: u64,

    flows: Monitor,
    metrics: Metrics,
}

impl Network {
    /// Create a new network, registering its metrics with `registry`.
    pub fn new(cfg: Config, registry: &mut Registry) -> Result<Self, Error> {
        cfg.default_link.validate()?;
        Ok(Self {
            cfg,
            hosts: BTreeMap::new(),
            addresses: HashMap::new(),
            links: HashMap::new(),
            endpoints: HashMap::new(),
            bound: HashMap::new(),
            next_endpoint: 0,
            next_ephemeral: EPHEMERAL_PORT_RANGE.start,
            in_flight: HashMap::new(),
            next_datagram: 0,
            flows: Monitor::default(),
            metrics: Metrics::init(registry),
        })
    }

    /// Attach a node to the network with the given address.
    pub fn attach(&mut self, node: NodeId, ip: IpAddr, interface: Interface) -> Result<(), Error> {
        if self.hosts.contains_key(&node) {
            return Err(Error::DuplicateNode(node));
        }
        if self.addresses.contains_key(&ip) {
            return Err(Error::DuplicateAddress(ip));
        }
        self.addresses.insert(ip, node);
        self.hosts.insert(
            node,
            Host {
                ip,
                interface,
                reject_binds: false,
                expedited_until: Duration::ZERO,
                normal_until: Duration::ZERO,
            },
        );
        Ok(())
    }

    /// Returns the address of an attached node.
    pub fn address(&self, node: NodeId) -> Option<IpAddr> {
        self.hosts.get(&node).map(|host| host.ip)
    }

    /// Create a unidirectional link between two nodes.
    ///
    /// Link can be called multiple times for the same sender/receiver. The latest
    /// setting will be used.
    pub fn link(&mut self, sender: NodeId, receiver: NodeId, link: Link) -> Result<(), Error> {
        if sender == receiver {
            return Err(Error::LinkingSelf);
        }
        link.validate()?;
        self.links.insert((sender, receiver), link);
        Ok(())
    }

    /// Make every future bind attempted by `node` fail.
    pub fn reject_binds(&mut self, node: NodeId) -> Result<(), Error> {
        let host = self.hosts.get_mut(&node).ok_or(Error::UnknownNode(node))?;
        host.reject_binds = true;
        Ok(())
    }

    /// Returns a snapshot of every flow observed so far.
    pub fn flows(&self) -> Vec<crate::flows::FlowRecord> {
        self.flows.snapshot()
    }

    pub(crate) fn bind(&mut self, node: NodeId, address: SocketAddr) -> Result<Socket, Error> {
        let host = self.hosts.get(&node).ok_or(Error::UnknownNode(node))?;
        let (ip, reject_binds) = (host.ip, host.reject_binds);
        if reject_binds {
            return Err(Error::BindFailed(address));
        }
        if !address.ip().is_unspecified() && address.ip() != ip {
            return Err(Error::BindFailed(address));
        }
        let port = match address.port() {
            0 => self.ephemeral(ip)?,
            port if EPHEMERAL_PORT_RANGE.contains(&port) => {
                return Err(Error::BindFailed(address));
            }
            port => port,
        };
        let local = SocketAddr::new(ip, port);
        if self.bound.contains_key(&local) {
            return Err(Error::AddressInUse(local));
        }

        let id = self.next_endpoint;
        self.next_endpoint += 1;
        self.bound.insert(local, id);
        self.endpoints.insert(
            id,
            Endpoint {
                owner: node,
                local,
                peer: None,
                inbox: VecDeque::new(),
            },
        );
        trace!(node, %local, "bound endpoint");
        Ok(Socket::new(id, local))
    }

    fn ephemeral(&mut self, ip: IpAddr) -> Result<u16, Error> {
        for _ in EPHEMERAL_PORT_RANGE {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port + 1 >= EPHEMERAL_PORT_RANGE.end {
                EPHEMERAL_PORT_RANGE.start
            } else {
                port + 1
            };
            if !self.bound.contains_key(&SocketAddr::new(ip, port)) {
                return Ok(port);
            }
        }
        Err(Error::BindFailed(SocketAddr::new(ip, 0)))
    }

    pub(crate) fn connect(&mut self, socket: &Socket, peer: SocketAddr) -> Result<(), Error> {
        if peer.ip().is_unspecified() || peer.port() == 0 {
            return Err(Error::InvalidAddress(peer));
        }
        let endpoint = self
            .endpoints
            .get_mut(&socket.id())
            .ok_or(Error::Closed)?;
        endpoint.peer = Some(peer);
        Ok(())
    }

    /// Accept a datagram for transmission.
    ///
    /// Returns the number of bytes sent and, if the datagram survived the link, the
    /// time at which it arrives at `peer` (or the connected peer when `None`).
    pub(crate) fn send<R: Rng>(
        &mut self,
        socket: &Socket,
        peer: Option<SocketAddr>,
        datagram: Datagram,
        now: Duration,
        rng: &mut R,
    ) -> Result<(usize, Option<(SocketAddr, Duration)>), Error> {
        let endpoint = self.endpoints.get(&socket.id()).ok_or(Error::Closed)?;
        let destination = peer.or(endpoint.peer).ok_or(Error::NotConnected)?;
        if destination.ip().is_unspecified() || destination.port() == 0 {
            return Err(Error::InvalidAddress(destination));
        }
        let len = datagram.len();
        if len > self.cfg.max_datagram_size {
            return Err(Error::MessageTooLarge(len));
        }
        let origin = endpoint.owner;
        let source = endpoint.local;
        let flow = self
            .flows
            .transmitted(source, destination, datagram.tos, len, now);
        self.metrics.sent.get_or_create(&Peer::new(origin)).inc();

        // Determine if anyone owns the destination address
        let Some(recipient) = self.addresses.get(&destination.ip()).copied() else {
            self.drop_datagram(origin, flow, destination, "no route");
            return Ok((len, None));
        };

        // Apply link settings (lost datagrams never reach the recipient's interface)
        let link = self
            .links
            .get(&(origin, recipient))
            .unwrap_or(&self.cfg.default_link)
            .clone();
        if !rng.gen_bool(link.success_rate) {
            self.drop_datagram(origin, flow, destination, "random link failure");
            return Ok((len, None));
        }

        // Queue at the recipient's interface
        let Some(host) = self.hosts.get_mut(&recipient) else {
            self.drop_datagram(origin, flow, destination, "no route");
            return Ok((len, None));
        };
        let Some(received) = host.admit(now, len, datagram.priority()) else {
            self.drop_datagram(origin, flow, destination, "queue full");
            return Ok((len, None));
        };
        let arrival = received + link.sample(rng);

        let sequence = self.next_datagram;
        self.next_datagram += 1;
        self.in_flight.entry(destination).or_default().insert(
            (arrival, sequence),
            InFlight {
                origin,
                source,
                datagram,
                sent: now,
                flow,
            },
        );
        trace!(origin, %source, %destination, ?arrival, len, "sending datagram");
        Ok((len, Some((destination, arrival))))
    }

    fn drop_datagram(
        &mut self,
        origin: NodeId,
        flow: usize,
        destination: SocketAddr,
        reason: &'static str,
    ) {
        debug!(origin, %destination, reason, "dropping datagram");
        self.flows.lost(flow);
        self.metrics.dropped.get_or_create(&Peer::new(origin)).inc();
    }

    /// Hand every datagram due at `destination` to the endpoint bound there.
    ///
    /// Returns the owner of the endpoint if at least one datagram was delivered.
    pub(crate) fn deliver(&mut self, destination: SocketAddr, now: Duration) -> Option<NodeId> {
        let queue = self.in_flight.get_mut(&destination)?;
        let mut due = Vec::new();
        while let Some(entry) = queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }
        if queue.is_empty() {
            self.in_flight.remove(&destination);
        }
        if due.is_empty() {
            return None;
        }

        let Some(endpoint) = self
            .bound
            .get(&destination)
            .and_then(|id| self.endpoints.get_mut(id))
        else {
            for datagram in due {
                self.drop_datagram(datagram.origin, datagram.flow, destination, "no listener");
            }
            return None;
        };
        let owner = endpoint.owner;
        for InFlight {
            source,
            datagram,
            sent,
            flow,
            ..
        } in due
        {
            let len = datagram.len();
            endpoint.inbox.push_back((source, datagram));
            self.flows.received(flow, len, now - sent, now);
            self.metrics.received.get_or_create(&Peer::new(owner)).inc();
        }
        Some(owner)
    }

    pub(crate) fn recv_from(&mut self, socket: &Socket) -> Option<(SocketAddr, Datagram)> {
        self.endpoints.get_mut(&socket.id())?.inbox.pop_front()
    }

    pub(crate) fn close(&mut self, socket: Socket) {
        if let Some(endpoint) = self.endpoints.remove(&socket.id()) {
            self.bound.remove(&endpoint.local);
            trace!(node = endpoint.owner, local = %endpoint.local, "closed endpoint");
        }
    }
}
