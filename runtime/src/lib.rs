//! Drive simulated nodes over a virtual clock and an in-memory datagram fabric.
//!
//! This crate supplies the primitives a simulated application consumes: a virtual
//! clock ([Clock]), a way to deliver an input to a node at a future simulated
//! time ([Scheduler]), and datagram endpoints addressed by IP address and port
//! ([Transport]). The [deterministic] module implements all three on top of a
//! seeded, single-threaded event queue so that a run is fully reproducible given
//! its seed.
//!
//! # Terminology
//!
//! A [deterministic::Runner] owns the event queue and the [network::Network]. Each
//! time an input is due, the runner hands the owning node a [deterministic::Context]
//! (implementing [Clock], [Scheduler] and [Transport]) and the input itself.
//!
//! # Non-goals
//!
//! Radio propagation, MAC contention, address autoconfiguration and routing are
//! not modelled. Every attached node can reach every other attached node over a
//! link with configurable latency, jitter and delivery probability.

use std::{net::SocketAddr, time::Duration};
use thiserror::Error;

pub mod deterministic;
pub mod flows;
pub mod network;

pub use network::{Datagram, Priority};

/// Identifier of a simulated node.
pub type NodeId = u32;

/// Errors that can occur when interacting with the runtime.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("bind failed: {0}")]
    BindFailed(SocketAddr),
    #[error("address in use: {0}")]
    AddressInUse(SocketAddr),
    #[error("invalid address: {0}")]
    InvalidAddress(SocketAddr),
    #[error("not connected")]
    NotConnected,
    #[error("closed")]
    Closed,
    #[error("message too large: {0}")]
    MessageTooLarge(usize),
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("duplicate node: {0}")]
    DuplicateNode(NodeId),
    #[error("duplicate address: {0}")]
    DuplicateAddress(std::net::IpAddr),
    #[error("not valid to link self")]
    LinkingSelf,
    #[error("invalid success rate (must be in [0, 1]): {0}")]
    InvalidSuccessRate(f64),
    #[error("invalid latency (must be non-negative): mean={0} jitter={1}")]
    InvalidLatency(f64, f64),
}

/// Handle to a pending input created by [Scheduler::schedule].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timer(u64);

impl Timer {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// A bound datagram endpoint.
///
/// The handle is intentionally not `Clone`: [Transport::close] consumes it, so an
/// endpoint can only be torn down once.
#[derive(Debug, PartialEq, Eq)]
pub struct Socket {
    id: u64,
    local: SocketAddr,
}

impl Socket {
    pub(crate) const fn new(id: u64, local: SocketAddr) -> Self {
        Self { id, local }
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    /// Address the endpoint is bound to.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// Interface that provides the elapsed simulated time.
pub trait Clock {
    /// Returns the time elapsed since the start of the simulation.
    fn current(&self) -> Duration;
}

/// Interface to deliver a message to the calling node at a future simulated time.
pub trait Scheduler<M>: Clock {
    /// Deliver `message` to the calling node after `delay`.
    fn schedule(&mut self, delay: Duration, message: M) -> Timer;

    /// Cancel a pending delivery.
    ///
    /// Returns `false` if the timer already fired (or was already cancelled).
    fn cancel(&mut self, timer: Timer) -> bool;
}

/// Interface to send and receive datagrams.
pub trait Transport {
    /// Bind an endpoint to the given address.
    ///
    /// An unspecified IP binds to the node's own address and port `0` selects an
    /// ephemeral port.
    fn bind(&mut self, address: SocketAddr) -> Result<Socket, Error>;

    /// Set the default destination of `socket`.
    fn connect(&mut self, socket: &Socket, peer: SocketAddr) -> Result<(), Error>;

    /// Send a datagram to the connected peer, returning the number of bytes sent.
    fn send(&mut self, socket: &Socket, datagram: Datagram) -> Result<usize, Error>;

    /// Send a datagram to an explicit peer, returning the number of bytes sent.
    fn send_to(
        &mut self,
        socket: &Socket,
        peer: SocketAddr,
        datagram: Datagram,
    ) -> Result<usize, Error>;

    /// Take the next pending datagram (and the address it was sent from), if any.
    fn recv_from(&mut self, socket: &Socket) -> Option<(SocketAddr, Datagram)>;

    /// Close the endpoint. Datagrams arriving afterwards are dropped.
    fn close(&mut self, socket: Socket);
}
