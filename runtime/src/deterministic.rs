//! A deterministic runtime that delivers inputs to simulated nodes in virtual time.
//!
//! All work is expressed as inputs delivered to an [Actor]: either a message the
//! actor scheduled for itself (or that was injected with [Runner::schedule]) or a
//! notification that datagrams are waiting at one of its endpoints. The [Runner]
//! pops inputs in order of time. Inputs due at the same time are ordered by a
//! value drawn from the seeded random number generator, so interleavings at tie
//! timestamps vary with the seed but are reproducible for a given one.
//!
//! # Example
//!
//! ```rust
//! use meshsim_runtime::{
//!     deterministic::{Actor, Config, Context, Input, Runner},
//!     Clock, Scheduler,
//! };
//! use prometheus_client::registry::Registry;
//! use std::{collections::BTreeMap, time::Duration};
//!
//! struct Ticker {
//!     ticks: u32,
//! }
//!
//! impl Actor<()> for Ticker {
//!     fn handle(&mut self, context: &mut Context<'_, ()>, _: Input<()>) {
//!         self.ticks += 1;
//!         context.schedule(Duration::from_secs(1), ());
//!     }
//! }
//!
//! let mut registry = Registry::default();
//! let mut runner = Runner::new(
//!     Config {
//!         deadline: Some(Duration::from_secs(4)),
//!         ..Default::default()
//!     },
//!     &mut registry,
//! )
//! .unwrap();
//! runner.schedule(0, Duration::ZERO, ());
//! let mut actors = BTreeMap::from([(0, Ticker { ticks: 0 })]);
//! runner.run(&mut actors);
//! assert_eq!(actors[&0].ticks, 5);
//! ```

use crate::{
    flows::FlowRecord,
    network::{self, Network},
    Clock, Datagram, Error, NodeId, Scheduler, Socket, Timer, Transport,
};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    time::Duration,
};
use tracing::{debug, trace};

/// Configuration for the `deterministic` runtime.
#[derive(Clone, Debug)]
pub struct Config {
    /// Seed for the random number generator.
    pub seed: u64,

    /// Inputs due after this point are never delivered.
    pub deadline: Option<Duration>,

    /// Configuration of the datagram fabric.
    pub network: network::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 42,
            deadline: None,
            network: network::Config::default(),
        }
    }
}

/// Input delivered to an [Actor].
#[derive(Debug, PartialEq, Eq)]
pub enum Input<M> {
    /// A message previously scheduled for this node.
    Message(M),

    /// One or more datagrams are waiting at the endpoint bound to this address.
    Readable(SocketAddr),
}

/// A simulated node.
pub trait Actor<M> {
    /// Process a single input.
    fn handle(&mut self, context: &mut Context<'_, M>, input: Input<M>);
}

/// Ordering of pending inputs: time, then a seeded tiebreak, then FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    time: Duration,
    tiebreak: u64,
    sequence: u64,
}

enum Task<M> {
    Message { node: NodeId, message: M },
    Deliver { destination: SocketAddr },
}

#[derive(Default)]
struct Metrics {
    inputs: Counter,
    timers_cancelled: Counter,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "inputs_processed",
            "Total number of inputs delivered to actors",
            metrics.inputs.clone(),
        );
        registry.register(
            "timers_cancelled",
            "Total number of scheduled messages cancelled before firing",
            metrics.timers_cancelled.clone(),
        );
        metrics
    }
}

struct Executor<M> {
    now: Duration,
    deadline: Option<Duration>,
    sequence: u64,
    rng: StdRng,
    queue: BTreeMap<Key, Task<M>>,

    /// Pending messages that can still be cancelled.
    timers: HashMap<u64, Key>,

    metrics: Metrics,
}

impl<M> Executor<M> {
    fn push(&mut self, time: Duration, task: Task<M>) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        let key = Key {
            time,
            tiebreak: self.rng.next_u64(),
            sequence,
        };
        if matches!(task, Task::Message { .. }) {
            self.timers.insert(sequence, key);
        }
        self.queue.insert(key, task);
        sequence
    }

    fn cancel(&mut self, timer: Timer) -> bool {
        let Timer(sequence) = timer;
        let Some(key) = self.timers.remove(&sequence) else {
            return false;
        };
        let cancelled = self.queue.remove(&key).is_some();
        if cancelled {
            self.metrics.timers_cancelled.inc();
        }
        cancelled
    }

    fn next(&mut self) -> Option<Task<M>> {
        let entry = self.queue.first_entry()?;
        if let Some(deadline) = self.deadline {
            if entry.key().time > deadline {
                self.now = self.now.max(deadline);
                return None;
            }
        }
        let (key, task) = entry.remove_entry();
        self.timers.remove(&key.sequence);
        self.now = key.time;
        self.metrics.inputs.inc();
        Some(task)
    }
}

/// Environment available to an [Actor] while it handles an input.
pub struct Context<'a, M> {
    node: NodeId,
    executor: &'a mut Executor<M>,
    network: &'a mut Network,
}

impl<M> Context<'_, M> {
    /// The node this context acts on behalf of.
    pub const fn node(&self) -> NodeId {
        self.node
    }

    fn transmit(
        &mut self,
        socket: &Socket,
        peer: Option<SocketAddr>,
        datagram: Datagram,
    ) -> Result<usize, Error> {
        let now = self.executor.now;
        let (len, arrival) =
            self.network
                .send(socket, peer, datagram, now, &mut self.executor.rng)?;
        if let Some((destination, at)) = arrival {
            self.executor.push(at, Task::Deliver { destination });
        }
        Ok(len)
    }
}

impl<M> Clock for Context<'_, M> {
    fn current(&self) -> Duration {
        self.executor.now
    }
}

impl<M> Scheduler<M> for Context<'_, M> {
    fn schedule(&mut self, delay: Duration, message: M) -> Timer {
        let time = self.executor.now + delay;
        let node = self.node;
        Timer::new(self.executor.push(time, Task::Message { node, message }))
    }

    fn cancel(&mut self, timer: Timer) -> bool {
        self.executor.cancel(timer)
    }
}

impl<M> Transport for Context<'_, M> {
    fn bind(&mut self, address: SocketAddr) -> Result<Socket, Error> {
        self.network.bind(self.node, address)
    }

    fn connect(&mut self, socket: &Socket, peer: SocketAddr) -> Result<(), Error> {
        self.network.connect(socket, peer)
    }

    fn send(&mut self, socket: &Socket, datagram: Datagram) -> Result<usize, Error> {
        self.transmit(socket, None, datagram)
    }

    fn send_to(
        &mut self,
        socket: &Socket,
        peer: SocketAddr,
        datagram: Datagram,
    ) -> Result<usize, Error> {
        self.transmit(socket, Some(peer), datagram)
    }

    fn recv_from(&mut self, socket: &Socket) -> Option<(SocketAddr, Datagram)> {
        self.network.recv_from(socket)
    }

    fn close(&mut self, socket: Socket) {
        self.network.close(socket)
    }
}

impl<M> RngCore for Context<'_, M> {
    fn next_u32(&mut self) -> u32 {
        self.executor.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.executor.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.executor.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.executor.rng.try_fill_bytes(dest)
    }
}

/// Drives [Actor]s until no input remains or the deadline is reached.
pub struct Runner<M> {
    executor: Executor<M>,
    network: Network,
}

impl<M> Runner<M> {
    /// Create a new runner, registering runtime and network metrics with `registry`.
    pub fn new(cfg: Config, registry: &mut Registry) -> Result<Self, Error> {
        let network = Network::new(cfg.network, registry.sub_registry_with_prefix("network"))?;
        let executor = Executor {
            now: Duration::ZERO,
            deadline: cfg.deadline,
            sequence: 0,
            rng: StdRng::seed_from_u64(cfg.seed),
            queue: BTreeMap::new(),
            timers: HashMap::new(),
            metrics: Metrics::init(registry.sub_registry_with_prefix("executor")),
        };
        Ok(Self { executor, network })
    }

    /// Access the network to attach nodes, configure links or inject faults.
    pub fn network(&mut self) -> &mut Network {
        &mut self.network
    }

    /// Current simulated time.
    pub const fn current(&self) -> Duration {
        self.executor.now
    }

    /// Deliver `message` to `node` at the absolute time `at`.
    pub fn schedule(&mut self, node: NodeId, at: Duration, message: M) -> Timer {
        let at = at.max(self.executor.now);
        Timer::new(self.executor.push(at, Task::Message { node, message }))
    }

    /// Returns a snapshot of every flow observed so far.
    pub fn flows(&self) -> Vec<FlowRecord> {
        self.network.flows()
    }

    /// Process inputs until none remain or the next one is due after the deadline.
    ///
    /// Returns the simulated time at which processing stopped.
    pub fn run<A: Actor<M>>(&mut self, actors: &mut BTreeMap<NodeId, A>) -> Duration {
        while let Some(task) = self.executor.next() {
            let (node, input) = match task {
                Task::Message { node, message } => (node, Input::Message(message)),
                Task::Deliver { destination } => {
                    let now = self.executor.now;
                    let Some(owner) = self.network.deliver(destination, now) else {
                        continue;
                    };
                    (owner, Input::Readable(destination))
                }
            };
            let Some(actor) = actors.get_mut(&node) else {
                debug!(node, "dropping input for unknown node");
                continue;
            };
            trace!(node, now = ?self.executor.now, "delivering input");
            let mut context = Context {
                node,
                executor: &mut self.executor,
                network: &mut self.network,
            };
            actor.handle(&mut context, input);
        }
        self.executor.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Interface;
    use commonware_macros::test_traced;
    use std::net::{IpAddr, Ipv6Addr};

    const PORT: u16 = 1883;

    fn ip(node: NodeId) -> IpAddr {
        IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 1, 0, 0, 0, 0, node as u16 + 1))
    }

    fn runner<M>(seed: u64, deadline: Option<Duration>, nodes: NodeId) -> Runner<M> {
        let mut registry = Registry::default();
        let mut runner = Runner::new(
            Config {
                seed,
                deadline,
                network: network::Config::default(),
            },
            &mut registry,
        )
        .unwrap();
        for node in 0..nodes {
            runner
                .network()
                .attach(node, ip(node), Interface::default())
                .unwrap();
        }
        runner
    }

    #[derive(Debug)]
    enum Message {
        Tick(u32),
        Cancel(u32),
    }

    #[derive(Default)]
    struct Recorder {
        fired: Vec<(Duration, u32)>,
        pending: HashMap<u32, Timer>,
    }

    impl Actor<Message> for Recorder {
        fn handle(&mut self, context: &mut Context<'_, Message>, input: Input<Message>) {
            match input {
                Input::Message(Message::Tick(id)) => {
                    self.fired.push((context.current(), id));
                    if id < 2 {
                        let timer =
                            context.schedule(Duration::from_secs(1), Message::Tick(id + 10));
                        self.pending.insert(id + 10, timer);
                    }
                }
                Input::Message(Message::Cancel(id)) => {
                    if let Some(timer) = self.pending.remove(&id) {
                        assert!(context.cancel(timer));
                        assert!(!context.cancel(timer));
                    }
                }
                Input::Readable(_) => unreachable!(),
            }
        }
    }

    #[test_traced]
    fn test_schedule_and_cancel() {
        let mut runner = runner(0, None, 1);
        runner.schedule(0, Duration::from_secs(1), Message::Tick(0));
        runner.schedule(0, Duration::from_secs(1), Message::Tick(1));
        runner.schedule(0, Duration::from_millis(1500), Message::Cancel(11));
        let mut actors = BTreeMap::from([(0, Recorder::default())]);
        let end = runner.run(&mut actors);

        let mut fired = actors[&0].fired.clone();
        fired.sort();
        assert_eq!(
            fired,
            vec![
                (Duration::from_secs(1), 0),
                (Duration::from_secs(1), 1),
                (Duration::from_secs(2), 10),
            ]
        );
        assert_eq!(end, Duration::from_secs(2));
    }

    struct Forever {
        fired: u32,
    }

    impl Actor<()> for Forever {
        fn handle(&mut self, context: &mut Context<'_, ()>, _: Input<()>) {
            self.fired += 1;
            context.schedule(Duration::from_secs(1), ());
        }
    }

    #[test]
    fn test_deadline_truncates() {
        let mut runner = runner(0, Some(Duration::from_secs(10)), 1);
        runner.schedule(0, Duration::ZERO, ());
        let mut actors = BTreeMap::from([(0, Forever { fired: 0 })]);
        let end = runner.run(&mut actors);
        assert_eq!(actors[&0].fired, 11);
        assert_eq!(end, Duration::from_secs(10));
    }

    struct Order {
        log: Vec<NodeId>,
    }

    fn tie_order(seed: u64) -> Vec<NodeId> {
        let mut runner = runner(seed, None, 0);
        for node in 0..16 {
            runner.schedule(node, Duration::from_secs(1), node);
        }
        let mut actors: BTreeMap<NodeId, Order> =
            (0..16).map(|node| (node, Order { log: Vec::new() })).collect();
        runner.run(&mut actors);
        let mut order: Vec<(usize, NodeId)> = Vec::new();
        for (node, actor) in &actors {
            for position in &actor.log {
                order.push((*position as usize, *node));
            }
        }
        order.sort();
        order.into_iter().map(|(_, node)| node).collect()
    }

    impl Actor<NodeId> for Order {
        fn handle(&mut self, context: &mut Context<'_, NodeId>, _: Input<NodeId>) {
            // Record the global position of this input
            let position = context.executor.metrics.inputs.get() as NodeId;
            self.log.push(position);
        }
    }

    #[test]
    fn test_same_seed_same_order() {
        for seed in 0..10 {
            assert_eq!(tie_order(seed), tie_order(seed));
        }
        let mut all = tie_order(3);
        all.sort();
        assert_eq!(all, (0..16).collect::<Vec<_>>());
    }

    #[derive(Debug)]
    enum Echo {
        Listen,
        Burst(u32),
    }

    #[derive(Default)]
    struct Endpoint {
        socket: Option<Socket>,
        wakeups: u32,
        received: Vec<(Duration, SocketAddr, Datagram)>,
    }

    impl Actor<Echo> for Endpoint {
        fn handle(&mut self, context: &mut Context<'_, Echo>, input: Input<Echo>) {
            match input {
                Input::Message(Echo::Listen) => {
                    let address = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), PORT);
                    self.socket = Some(context.bind(address).unwrap());
                }
                Input::Message(Echo::Burst(count)) => {
                    let socket = context.bind("[::]:0".parse().unwrap()).unwrap();
                    context
                        .connect(&socket, SocketAddr::new(ip(0), PORT))
                        .unwrap();
                    for i in 0..count {
                        let sent = context
                            .send(&socket, Datagram::new(format!("msg-{i}")))
                            .unwrap();
                        assert_eq!(sent, 5);
                    }
                    self.socket = Some(socket);
                }
                Input::Readable(address) => {
                    let socket = self.socket.as_ref().unwrap();
                    assert_eq!(socket.local_addr(), address);
                    self.wakeups += 1;
                    while let Some((from, datagram)) = context.recv_from(socket) {
                        self.received.push((context.current(), from, datagram));
                    }
                }
            }
        }
    }

    #[test_traced("DEBUG")]
    fn test_deliveries_drained_per_wakeup() {
        let mut runner = runner(7, None, 2);
        runner.schedule(0, Duration::ZERO, Echo::Listen);
        runner.schedule(1, Duration::from_secs(1), Echo::Burst(3));
        let mut actors = BTreeMap::from([(0, Endpoint::default()), (1, Endpoint::default())]);
        runner.run(&mut actors);

        let listener = &actors[&0];
        assert_eq!(listener.received.len(), 3);
        assert_eq!(listener.wakeups, 1);
        for (at, from, _) in &listener.received {
            assert_eq!(*at, Duration::from_millis(1010));
            assert_eq!(from.ip(), ip(1));
        }

        let flows = runner.flows();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].tx_packets, 3);
        assert_eq!(flows[0].rx_packets, 3);
        assert_eq!(flows[0].delay_sum, Duration::from_millis(30));
    }

    #[test]
    fn test_closed_endpoint_receives_nothing() {
        struct Closer {
            socket: Option<Socket>,
            readable: u32,
        }

        impl Actor<bool> for Closer {
            fn handle(&mut self, context: &mut Context<'_, bool>, input: Input<bool>) {
                match input {
                    Input::Message(true) => {
                        let address = format!("[::]:{PORT}").parse().unwrap();
                        self.socket = Some(context.bind(address).unwrap());
                    }
                    Input::Message(false) => {
                        if let Some(socket) = self.socket.take() {
                            context.close(socket);
                        }
                    }
                    Input::Readable(_) => self.readable += 1,
                }
            }
        }

        struct Sender;

        impl Actor<bool> for Sender {
            fn handle(&mut self, context: &mut Context<'_, bool>, _: Input<bool>) {
                let socket = context.bind("[::]:0".parse().unwrap()).unwrap();
                context
                    .send_to(&socket, SocketAddr::new(ip(0), PORT), Datagram::new("late"))
                    .unwrap();
                context.close(socket);
            }
        }

        let mut runner: Runner<bool> = runner(1, None, 2);
        runner.schedule(0, Duration::ZERO, true);
        runner.schedule(0, Duration::from_millis(1005), false);
        runner.schedule(1, Duration::from_secs(1), true);

        let mut closer = BTreeMap::from([(
            0,
            Closer {
                socket: None,
                readable: 0,
            },
        )]);
        // Drive both actor kinds by splitting the run at the send time
        runner.executor.deadline = Some(Duration::from_millis(999));
        runner.run(&mut closer);
        runner.executor.deadline = Some(Duration::from_millis(1000));
        runner.run(&mut BTreeMap::from([(1, Sender)]));
        runner.executor.deadline = None;
        runner.run(&mut closer);

        assert_eq!(closer[&0].readable, 0);
        let flows = runner.flows();
        assert_eq!(flows[0].rx_packets, 0);
        assert_eq!(flows[0].lost_packets, 1);
    }
}
