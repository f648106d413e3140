//! Connectionless datagram delivery.
//!
//! A bound UDP socket owns one [`UdpBinding`].  Datagrams arriving for it are
//! split by remote peer into [`UdpEndpoint`]s, created on first contact.  An
//! endpoint is only a demultiplexing unit: there is no handshake, no
//! teardown, and no state beyond a bounded queue.
//!
//! ```text
//!                    ┌─▶ UdpEndpoint(10.0.0.1:5000)  [d0, d2]
//!  UdpBinding(:53) ──┤
//!                    └─▶ UdpEndpoint(10.0.0.9:6000)  [d1]
//!
//!  arrivals: 10.0.0.1:5000, 10.0.0.9:6000, 10.0.0.1:5000
//! ```
//!
//! The arrival list preserves device order across peers, so `recvfrom` on
//! the socket returns datagrams in the order they were read.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;

/// Queue of datagrams received from one remote peer.
#[derive(Debug)]
pub struct UdpEndpoint {
    peer: SocketAddrV4,
    queue: VecDeque<Vec<u8>>,
    depth: usize,
    dropped: u64,
}

impl UdpEndpoint {
    pub fn new(peer: SocketAddrV4, depth: usize) -> Self {
        Self {
            peer,
            queue: VecDeque::new(),
            depth: depth.max(1),
            dropped: 0,
        }
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    /// Append a datagram.  Returns `false` (and counts a drop) when the queue
    /// is full.
    pub fn push(&mut self, datagram: Vec<u8>) -> bool {
        if self.queue.len() >= self.depth {
            self.dropped += 1;
            return false;
        }
        self.queue.push_back(datagram);
        true
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Datagrams discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Everything received by one bound UDP socket.
#[derive(Debug)]
pub struct UdpBinding {
    pub local: SocketAddrV4,
    peers: HashMap<SocketAddrV4, UdpEndpoint>,
    arrivals: VecDeque<SocketAddrV4>,
    depth: usize,
}

impl UdpBinding {
    pub fn new(local: SocketAddrV4, depth: usize) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            arrivals: VecDeque::new(),
            depth,
        }
    }

    /// Queue a datagram from `from`, creating its endpoint if this is the
    /// first contact.  Returns `false` if the peer's queue was full.
    pub fn deliver(&mut self, from: SocketAddrV4, payload: Vec<u8>) -> bool {
        let (local, depth) = (self.local, self.depth);
        let endpoint = self.peers.entry(from).or_insert_with(|| {
            log::debug!("[sock] udp {} new peer {}", local, from);
            UdpEndpoint::new(from, depth)
        });
        if !endpoint.push(payload) {
            log::debug!("[sock] udp {} queue for {} full", local, from);
            return false;
        }
        self.arrivals.push_back(from);
        true
    }

    /// Oldest queued datagram across all peers.
    pub fn pop_any(&mut self) -> Option<(Vec<u8>, SocketAddrV4)> {
        while let Some(peer) = self.arrivals.pop_front() {
            if let Some(data) = self.peers.get_mut(&peer).and_then(UdpEndpoint::pop) {
                return Some((data, peer));
            }
        }
        None
    }

    /// Oldest queued datagram from one particular peer.
    pub fn pop_from(&mut self, peer: SocketAddrV4) -> Option<Vec<u8>> {
        let data = self.peers.get_mut(&peer)?.pop()?;
        if let Some(pos) = self.arrivals.iter().position(|p| *p == peer) {
            self.arrivals.remove(pos);
        }
        Some(data)
    }

    pub fn endpoint(&self, peer: SocketAddrV4) -> Option<&UdpEndpoint> {
        self.peers.get(&peer)
    }

    /// Remote peers seen so far.
    pub fn peers(&self) -> impl Iterator<Item = SocketAddrV4> + '_ {
        self.peers.keys().copied()
    }

    /// Datagrams queued across all peers.
    pub fn pending(&self) -> usize {
        self.arrivals.len()
    }
}
