//! Socket tables and inbound demultiplexing.
//!
//! [`SocketManager`] is the single owner of every piece of protocol state:
//!
//! ```text
//!   sockets      SocketId   ──▶ SocketEntry { protocol, local, role }
//!   connections  FourTuple  ──▶ TcpConnection + owner
//!   listeners    local addr ──▶ SocketId (role = Listener)
//!   udp          local addr ──▶ SocketId (role = Datagram → UdpBinding)
//! ```
//!
//! Inbound frames enter through [`SocketManager::dispatch`], which never
//! fails: every frame is either delivered or dropped with a
//! [`DropReason`].  Replies and application data leave through an outbound
//! queue the event loop drains into the device after each callback.
//!
//! TCP routing: exact 4-tuple first, then a listener on the destination
//! (exact address before `0.0.0.0`), otherwise the segment is dropped
//! without a RST.  UDP routing: bound socket on the destination (exact
//! before wildcard), then per-peer endpoint inside it.
//!
//! Operations that wait for the network return a [`Pending`] that the
//! dispatcher completes when it applies the awaited transition.  Nothing in
//! here blocks or sleeps; TIME_WAIT linger is a deadline surfaced through
//! [`SocketManager::next_deadline`] and fired by
//! [`SocketManager::poll_timers`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

use rand::Rng;
use tokio::sync::watch;

use crate::config::StackConfig;
use crate::connection::{FourTuple, ReadOutcome, TcpConnection, TcpError};
use crate::packet::{
    self, flags, protocol, Ipv4Header, PacketError, TcpHeader, TcpSegment, UdpHeader,
    IPV4_HEADER_LEN, UDP_HEADER_LEN,
};
use crate::socket::{Completer, Pending, Protocol, SocketError, SocketEvent, SocketId};
use crate::state::TcpState;
use crate::timer::TimerQueue;
use crate::udp::UdpBinding;

const EPHEMERAL_FIRST: u16 = 49152;
const EPHEMERAL_LAST: u16 = 65535;
const EPHEMERAL_ATTEMPTS: usize = 64;

// ---------------------------------------------------------------------------
// Dispatch outcome
// ---------------------------------------------------------------------------

/// Why an inbound frame was discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Structurally invalid header (the MalformedPacket class).
    Malformed(PacketError),
    UnsupportedVersion(u8),
    /// IPv4 fragment; reassembly is not supported.
    Fragment,
    UnsupportedProtocol(u8),
    BadChecksum,
    /// No connection, listener, or bound socket matches the destination.
    NoSocket,
    /// A SYN arrived for a listener whose backlog is full.
    BacklogFull,
    /// The UDP endpoint for this peer has no room left.
    QueueFull,
}

/// What [`SocketManager::dispatch`] did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Delivered,
    Dropped(DropReason),
}

impl Disposition {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Disposition::Delivered)
    }
}

/// Snapshot of one socket, returned by [`SocketManager::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketInfo {
    pub id: SocketId,
    pub protocol: Protocol,
    pub local: Option<SocketAddrV4>,
    pub remote: Option<SocketAddrV4>,
    /// Connection state for TCP sockets; `None` for UDP.
    pub state: Option<TcpState>,
}

// ---------------------------------------------------------------------------
// Internal tables
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SocketEntry {
    protocol: Protocol,
    local: Option<SocketAddrV4>,
    role: Role,
}

#[derive(Debug)]
enum Role {
    /// Created, possibly bound, not yet listening or connected.
    Idle,
    Listener(Listener),
    Stream(Stream),
    Datagram(Datagram),
}

#[derive(Debug)]
struct Listener {
    backlog: usize,
    /// Children still in SYN_RECEIVED.
    embryonic: HashSet<FourTuple>,
    /// Handshake-completed children waiting for `accept`, oldest first.
    ready: VecDeque<FourTuple>,
    waiters: VecDeque<Completer<(SocketId, SocketAddrV4)>>,
}

impl Listener {
    fn new(backlog: usize) -> Self {
        Self {
            backlog,
            embryonic: HashSet::new(),
            ready: VecDeque::new(),
            waiters: VecDeque::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.embryonic.len() + self.ready.len() >= self.backlog
    }
}

#[derive(Debug)]
struct Stream {
    key: FourTuple,
    connect: Option<Completer<()>>,
    recv: Option<RecvWaiter>,
    reset: bool,
}

impl Stream {
    fn new(key: FourTuple) -> Self {
        Self {
            key,
            connect: None,
            recv: None,
            reset: false,
        }
    }
}

#[derive(Debug)]
struct RecvWaiter {
    want: usize,
    tx: Completer<Vec<u8>>,
}

#[derive(Debug)]
struct Datagram {
    binding: UdpBinding,
    waiters: VecDeque<Completer<(Vec<u8>, SocketAddrV4)>>,
}

/// Who a connection in the table belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Socket(SocketId),
    /// Not yet accepted; counted against this listener's backlog.
    Backlog(SocketId),
    /// The application closed its socket; teardown finishes on its own.
    Orphan,
}

#[derive(Debug)]
struct Slot {
    conn: TcpConnection,
    owner: Owner,
}

// ---------------------------------------------------------------------------
// SocketManager
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SocketManager {
    config: StackConfig,
    next_id: u32,
    sockets: HashMap<SocketId, SocketEntry>,
    connections: HashMap<FourTuple, Slot>,
    listeners: HashMap<SocketAddrV4, SocketId>,
    udp: HashMap<SocketAddrV4, SocketId>,
    outbound: VecDeque<Vec<u8>>,
    events: VecDeque<SocketEvent>,
    time_wait: TimerQueue<FourTuple>,
    ident: u16,
}

impl SocketManager {
    pub fn new(config: StackConfig) -> Self {
        Self {
            config,
            next_id: 1,
            sockets: HashMap::new(),
            connections: HashMap::new(),
            listeners: HashMap::new(),
            udp: HashMap::new(),
            outbound: VecDeque::new(),
            events: VecDeque::new(),
            time_wait: TimerQueue::new(),
            ident: rand::rng().random(),
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Socket lifecycle
    // -----------------------------------------------------------------------

    /// Allocate a new, unbound socket.
    pub fn create(&mut self, protocol: Protocol) -> SocketId {
        let id = SocketId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.sockets.insert(
            id,
            SocketEntry {
                protocol,
                local: None,
                role: Role::Idle,
            },
        );
        log::debug!("[sock] {id} created ({protocol})");
        id
    }

    pub fn get(&self, id: SocketId) -> Option<SocketInfo> {
        let entry = self.sockets.get(&id)?;
        let (remote, state) = match &entry.role {
            Role::Idle => (None, Some(TcpState::Closed)),
            Role::Listener(_) => (None, Some(TcpState::Listen)),
            Role::Stream(s) => (
                Some(s.key.remote),
                Some(
                    self.connections
                        .get(&s.key)
                        .map_or(TcpState::Closed, |slot| slot.conn.state()),
                ),
            ),
            Role::Datagram(_) => (None, None),
        };
        Some(SocketInfo {
            id,
            protocol: entry.protocol,
            local: entry.local,
            remote,
            state: state.filter(|_| !entry.protocol.capabilities().connectionless),
        })
    }

    /// Release a socket.
    ///
    /// The table entry disappears immediately.  A connected stream starts an
    /// orderly close and finishes it without an owner; pending operations on
    /// the socket resolve with [`SocketError::Closed`].  Closing an unknown or
    /// already-closed socket is a no-op.
    pub fn close(&mut self, id: SocketId) {
        let Some(entry) = self.sockets.remove(&id) else {
            return;
        };
        let now = Instant::now();
        match entry.role {
            Role::Idle => {}
            Role::Listener(listener) => {
                if let Some(local) = entry.local {
                    if self.listeners.get(&local) == Some(&id) {
                        self.listeners.remove(&local);
                    }
                }
                for key in listener.embryonic.iter().chain(listener.ready.iter()) {
                    self.abandon(*key, now);
                }
            }
            Role::Stream(stream) => self.abandon(stream.key, now),
            Role::Datagram(d) => {
                self.udp.remove(&d.binding.local);
            }
        }
        log::debug!("[sock] {id} closed");
    }

    /// Assign a local address.  Port `0` picks an ephemeral port.
    pub fn bind(&mut self, id: SocketId, addr: SocketAddrV4) -> Result<(), SocketError> {
        let entry = self.entry(id)?;
        if entry.local.is_some() {
            return Err(SocketError::AlreadyBound);
        }
        let protocol = entry.protocol;
        let port = match addr.port() {
            0 => self.ephemeral_port(protocol)?,
            p => p,
        };
        let addr = SocketAddrV4::new(*addr.ip(), port);
        if self.addr_in_use(protocol, addr) {
            return Err(SocketError::AddressInUse);
        }

        let depth = self.config.udp_queue_depth;
        let entry = self.entry_mut(id)?;
        entry.local = Some(addr);
        if protocol.capabilities().connectionless {
            entry.role = Role::Datagram(Datagram {
                binding: UdpBinding::new(addr, depth),
                waiters: VecDeque::new(),
            });
            self.udp.insert(addr, id);
        }
        log::debug!("[sock] {id} bound to {addr}");
        Ok(())
    }

    /// Start accepting connections; `0` selects the configured default
    /// backlog.  Calling it again on a listener adjusts the backlog.
    pub fn listen(&mut self, id: SocketId, backlog: usize) -> Result<(), SocketError> {
        let backlog = if backlog == 0 {
            self.config.default_backlog
        } else {
            backlog
        };
        let entry = self.entry(id)?;
        if !entry.protocol.capabilities().listen_capable {
            return Err(wrong_protocol("listen", entry.protocol));
        }
        let local = entry.local.ok_or(SocketError::NotBound)?;
        if let Role::Stream(s) = &entry.role {
            let state = self.conn_state(&s.key);
            return Err(TcpError::InvalidState { op: "listen", state }.into());
        }

        let entry = self.entry_mut(id)?;
        match &mut entry.role {
            Role::Listener(l) => l.backlog = backlog,
            role => *role = Role::Listener(Listener::new(backlog)),
        }
        self.listeners.insert(local, id);
        log::debug!("[sock] {id} listening on {local} (backlog {backlog})");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stream operations
    // -----------------------------------------------------------------------

    /// Take the oldest completed connection, waiting for one if the backlog
    /// is empty.  Resolves to the new socket and the peer's address.
    pub fn accept(&mut self, id: SocketId) -> Pending<(SocketId, SocketAddrV4)> {
        match self.try_accept(id) {
            Ok(Some(accepted)) => Pending::ready(Ok(accepted)),
            Ok(None) => {
                let (tx, pending) = Pending::channel();
                if let Ok(l) = self.listener_mut(id) {
                    l.waiters.push_back(tx);
                }
                pending
            }
            Err(e) => Pending::ready(Err(e)),
        }
    }

    /// Non-waiting [`SocketManager::accept`]: `None` when the backlog is empty.
    pub fn try_accept(
        &mut self,
        id: SocketId,
    ) -> Result<Option<(SocketId, SocketAddrV4)>, SocketError> {
        let Some(key) = self.listener_mut(id)?.ready.pop_front() else {
            return Ok(None);
        };
        let child = self.adopt(key);
        log::debug!("[sock] {id} accepted {child} from {}", key.remote);
        Ok(Some((child, key.remote)))
    }

    /// Active open.  Unbound sockets get the configured local address and an
    /// ephemeral port.  Resolves when the handshake completes.
    pub fn connect(&mut self, id: SocketId, remote: SocketAddrV4) -> Pending<()> {
        match self.start_connect(id, remote) {
            Ok(pending) => pending,
            Err(e) => Pending::ready(Err(e)),
        }
    }

    fn start_connect(
        &mut self,
        id: SocketId,
        remote: SocketAddrV4,
    ) -> Result<Pending<()>, SocketError> {
        let entry = self.entry(id)?;
        if entry.protocol.capabilities().connectionless {
            return Err(wrong_protocol("connect", entry.protocol));
        }
        let state = match &entry.role {
            Role::Idle => None,
            Role::Listener(_) => Some(TcpState::Listen),
            Role::Stream(s) => Some(self.conn_state(&s.key)),
            Role::Datagram(_) => Some(TcpState::Closed),
        };
        if let Some(state) = state {
            return Err(TcpError::InvalidState { op: "connect", state }.into());
        }

        let local = match entry.local {
            Some(bound) => SocketAddrV4::new(self.source_ip(*bound.ip()), bound.port()),
            None => SocketAddrV4::new(
                self.config.local_addr,
                self.ephemeral_port(Protocol::Tcp)?,
            ),
        };
        let key = FourTuple::new(local, remote);
        if self.connections.contains_key(&key) {
            return Err(SocketError::AddressInUse);
        }

        let mut conn = TcpConnection::new(key, &self.config);
        let syn = conn.connect()?;
        self.connections.insert(
            key,
            Slot {
                conn,
                owner: Owner::Socket(id),
            },
        );

        let (tx, pending) = Pending::channel();
        let mut stream = Stream::new(key);
        stream.connect = Some(tx);
        let entry = self.entry_mut(id)?;
        entry.local = Some(local);
        entry.role = Role::Stream(stream);

        log::debug!("[sock] {id} connecting {key}");
        self.emit_tcp(&key, syn);
        Ok(pending)
    }

    /// Queue stream data; returns the number of bytes accepted.
    pub fn send(&mut self, id: SocketId, data: &[u8]) -> Result<usize, SocketError> {
        let key = self.stream_key(id, "send")?;
        let slot = self.connections.get_mut(&key).ok_or(SocketError::NotConnected)?;
        let segments = slot.conn.send(data)?;
        for seg in segments {
            self.emit_tcp(&key, seg);
        }
        Ok(data.len())
    }

    /// Wait until at least `n` bytes are buffered (or the peer closed) and
    /// return up to `n` of them.  An empty result means end of stream.
    ///
    /// Only one `recv` may be outstanding per socket; a second call replaces
    /// the first, which then resolves with [`SocketError::Closed`].
    pub fn recv(&mut self, id: SocketId, n: usize) -> Pending<Vec<u8>> {
        let key = match self.stream_key(id, "recv") {
            Ok(key) => key,
            Err(e) => return Pending::ready(Err(e)),
        };
        let Some(slot) = self.connections.get_mut(&key) else {
            return Pending::ready(Err(SocketError::NotConnected));
        };
        let conn = &mut slot.conn;
        if !conn.readable() {
            return Pending::ready(Err(TcpError::InvalidState {
                op: "recv",
                state: conn.state(),
            }
            .into()));
        }

        let want = n.max(1);
        if conn.buffered() >= want || conn.fin_received() {
            return Pending::ready(take_bytes(conn, want));
        }

        let (tx, pending) = Pending::channel();
        if let Some(Role::Stream(s)) = self.sockets.get_mut(&id).map(|e| &mut e.role) {
            s.recv = Some(RecvWaiter { want, tx });
        }
        pending
    }

    /// Take up to `max` buffered bytes without waiting.
    pub fn read(&mut self, id: SocketId, max: usize) -> Result<ReadOutcome, SocketError> {
        let key = self.stream_key(id, "read")?;
        let slot = self.connections.get_mut(&key).ok_or(SocketError::NotConnected)?;
        Ok(slot.conn.read(max)?)
    }

    /// Observe the connection state of a stream socket.
    pub fn subscribe(&self, id: SocketId) -> Result<watch::Receiver<TcpState>, SocketError> {
        let key = self.stream_key(id, "subscribe")?;
        self.connections
            .get(&key)
            .map(|slot| slot.conn.subscribe())
            .ok_or(SocketError::NotConnected)
    }

    // -----------------------------------------------------------------------
    // Datagram operations
    // -----------------------------------------------------------------------

    /// Send one datagram.  An unbound socket is bound to an ephemeral port
    /// first.
    pub fn sendto(
        &mut self,
        id: SocketId,
        data: &[u8],
        dest: SocketAddrV4,
    ) -> Result<usize, SocketError> {
        let entry = self.entry(id)?;
        if !entry.protocol.capabilities().connectionless {
            return Err(wrong_protocol("sendto", entry.protocol));
        }
        let max = self.config.mtu.saturating_sub(IPV4_HEADER_LEN + UDP_HEADER_LEN);
        if data.len() > max {
            return Err(SocketError::MessageTooLong {
                len: data.len(),
                max,
            });
        }
        let bound = entry.local;
        let local = match bound {
            Some(local) => local,
            None => {
                self.bind(id, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
                self.entry(id)?.local.ok_or(SocketError::NotBound)?
            }
        };
        let src = SocketAddrV4::new(self.source_ip(*local.ip()), local.port());

        let ident = self.next_ident();
        let frame = packet::build_udp_frame(src, dest, data, ident, self.config.ttl);
        log::debug!("[sock] udp {src} → {dest} len={}", data.len());
        self.outbound.push_back(frame);
        Ok(data.len())
    }

    /// Wait for the next datagram from any peer.
    pub fn recvfrom(&mut self, id: SocketId) -> Pending<(Vec<u8>, SocketAddrV4)> {
        match self.try_recvfrom(id) {
            Ok(Some(datagram)) => Pending::ready(Ok(datagram)),
            Ok(None) => {
                let (tx, pending) = Pending::channel();
                if let Ok(d) = self.datagram_mut(id) {
                    d.waiters.push_back(tx);
                }
                pending
            }
            Err(e) => Pending::ready(Err(e)),
        }
    }

    /// Non-waiting [`SocketManager::recvfrom`].
    pub fn try_recvfrom(
        &mut self,
        id: SocketId,
    ) -> Result<Option<(Vec<u8>, SocketAddrV4)>, SocketError> {
        Ok(self.datagram_mut(id)?.binding.pop_any())
    }

    /// Peers a UDP socket has heard from, each with its queued datagram count.
    pub fn udp_peers(&self, id: SocketId) -> Result<Vec<(SocketAddrV4, usize)>, SocketError> {
        let entry = self.entry(id)?;
        match &entry.role {
            Role::Datagram(d) => Ok(d
                .binding
                .peers()
                .map(|peer| {
                    let queued = d.binding.endpoint(peer).map_or(0, |ep| ep.len());
                    (peer, queued)
                })
                .collect()),
            _ if !entry.protocol.capabilities().connectionless => {
                Err(wrong_protocol("udp_peers", entry.protocol))
            }
            _ => Err(SocketError::NotBound),
        }
    }

    // -----------------------------------------------------------------------
    // Dispatcher interface
    // -----------------------------------------------------------------------

    /// Route one inbound IP datagram.  Never fails; see [`Disposition`].
    pub fn dispatch(&mut self, frame: &[u8]) -> Disposition {
        self.dispatch_at(frame, Instant::now())
    }

    /// [`SocketManager::dispatch`] with an explicit clock, so TIME_WAIT
    /// deadlines can be tested deterministically.
    pub fn dispatch_at(&mut self, frame: &[u8], now: Instant) -> Disposition {
        let (ip, payload) = match Ipv4Header::decode(frame) {
            Ok(parsed) => parsed,
            Err(e) => return malformed(e),
        };
        if ip.version != 4 {
            log::debug!("[sock] dropping IP version {} datagram", ip.version);
            return Disposition::Dropped(DropReason::UnsupportedVersion(ip.version));
        }
        if !packet::verify_ipv4_checksum(frame) {
            log::warn!("[sock] IPv4 header checksum mismatch from {}", ip.src);
            return Disposition::Dropped(DropReason::BadChecksum);
        }
        if ip.is_fragment() {
            log::debug!("[sock] dropping fragment from {} id={}", ip.src, ip.identification);
            return Disposition::Dropped(DropReason::Fragment);
        }

        match ip.protocol {
            protocol::TCP => self.dispatch_tcp(&ip, payload, now),
            protocol::UDP => self.dispatch_udp(&ip, payload),
            other => {
                log::debug!("[sock] dropping protocol {other} from {}", ip.src);
                Disposition::Dropped(DropReason::UnsupportedProtocol(other))
            }
        }
    }

    fn dispatch_tcp(&mut self, ip: &Ipv4Header, segment: &[u8], now: Instant) -> Disposition {
        let (h, data) = match TcpHeader::decode(segment) {
            Ok(parsed) => parsed,
            Err(e) => return malformed(e),
        };
        if packet::pseudo_header_checksum(ip.src, ip.dst, protocol::TCP, segment) != 0 {
            log::warn!("[sock] TCP checksum mismatch from {}:{}", ip.src, h.src_port);
            return Disposition::Dropped(DropReason::BadChecksum);
        }
        let key = FourTuple::new(
            SocketAddrV4::new(ip.dst, h.dst_port),
            SocketAddrV4::new(ip.src, h.src_port),
        );

        if let Some(slot) = self.connections.get_mut(&key) {
            let (prev, prev_buffered) = (slot.conn.state(), slot.conn.buffered());
            if let Some(reply) = slot.conn.on_segment(&h, data) {
                self.emit_tcp(&key, reply);
            }
            self.after_update(key, prev, prev_buffered, now);
            return Disposition::Delivered;
        }

        let Some(lid) = self.find_listener(key.local) else {
            log::debug!("[sock] no socket for {key}; dropping");
            return Disposition::Dropped(DropReason::NoSocket);
        };
        if !h.has(flags::SYN) || h.has(flags::ACK) || h.has(flags::RST) {
            log::debug!("[sock] non-SYN segment for listener {lid} from {}", key.remote);
            return Disposition::Dropped(DropReason::NoSocket);
        }
        let Ok(listener) = self.listener_mut(lid) else {
            return Disposition::Dropped(DropReason::NoSocket);
        };
        if listener.is_full() {
            log::warn!(
                "[sock] backlog of {lid} full ({}); dropping SYN from {}",
                listener.backlog,
                key.remote
            );
            return Disposition::Dropped(DropReason::BacklogFull);
        }
        listener.embryonic.insert(key);

        let mut conn = TcpConnection::passive(key, &self.config);
        let reply = conn.on_segment(&h, data);
        self.connections.insert(
            key,
            Slot {
                conn,
                owner: Owner::Backlog(lid),
            },
        );
        if let Some(syn_ack) = reply {
            self.emit_tcp(&key, syn_ack);
        }
        Disposition::Delivered
    }

    fn dispatch_udp(&mut self, ip: &Ipv4Header, datagram: &[u8]) -> Disposition {
        let (h, data) = match UdpHeader::decode(datagram) {
            Ok(parsed) => parsed,
            Err(e) => return malformed(e),
        };
        // Zero means the sender did not compute a checksum.
        if h.checksum != 0 {
            let covered = &datagram[..usize::from(h.length)];
            if packet::pseudo_header_checksum(ip.src, ip.dst, protocol::UDP, covered) != 0 {
                log::warn!("[sock] UDP checksum mismatch from {}:{}", ip.src, h.src_port);
                return Disposition::Dropped(DropReason::BadChecksum);
            }
        }

        let local = SocketAddrV4::new(ip.dst, h.dst_port);
        let Some(id) = lookup(&self.udp, local) else {
            log::debug!("[sock] no UDP socket on {local}; dropping");
            return Disposition::Dropped(DropReason::NoSocket);
        };
        let from = SocketAddrV4::new(ip.src, h.src_port);
        let Some(Role::Datagram(d)) = self.sockets.get_mut(&id).map(|e| &mut e.role) else {
            return Disposition::Dropped(DropReason::NoSocket);
        };

        let mut item = Ok((data.to_vec(), from));
        while let Some(waiter) = d.waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => return Disposition::Delivered,
                Err(back) => item = back,
            }
        }
        let Ok((payload, from)) = item else {
            return Disposition::Delivered;
        };
        if !d.binding.deliver(from, payload) {
            return Disposition::Dropped(DropReason::QueueFull);
        }
        self.events.push_back(SocketEvent::Datagram(id));
        Disposition::Delivered
    }

    /// Fire every TIME_WAIT linger due at `now`; returns how many
    /// connections were released.
    pub fn poll_timers(&mut self, now: Instant) -> usize {
        let mut released = 0;
        for key in self.time_wait.pop_expired(now) {
            let Some(slot) = self.connections.get_mut(&key) else {
                continue;
            };
            let (prev, buffered) = (slot.conn.state(), slot.conn.buffered());
            if slot.conn.expire_time_wait() {
                self.after_update(key, prev, buffered, now);
                released += 1;
            }
        }
        released
    }

    /// Earliest pending deadline, for the event loop's poll timeout.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.time_wait.next_deadline()
    }

    /// Take every frame queued for the device, in emission order.
    pub fn drain_outbound(&mut self) -> Vec<Vec<u8>> {
        self.outbound.drain(..).collect()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Take the application events queued since the last call.
    pub fn take_events(&mut self) -> Vec<SocketEvent> {
        self.events.drain(..).collect()
    }

    /// Connections currently in the table, including unaccepted and
    /// orphaned ones.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_state(&self, key: &FourTuple) -> Option<TcpState> {
        self.connections.get(key).map(|slot| slot.conn.state())
    }

    // -----------------------------------------------------------------------
    // Transition bookkeeping
    // -----------------------------------------------------------------------

    /// Apply the side effects of a connection moving from `prev`: wake
    /// waiters, queue events, schedule TIME_WAIT, and release CLOSED entries.
    fn after_update(&mut self, key: FourTuple, prev: TcpState, prev_buffered: usize, now: Instant) {
        let Some(slot) = self.connections.get(&key) else {
            return;
        };
        let state = slot.conn.state();
        let owner = slot.owner;

        if state == TcpState::TimeWait && prev != TcpState::TimeWait {
            self.time_wait.schedule(now + self.config.time_wait, key);
        }

        match owner {
            Owner::Backlog(lid) => self.update_backlog(lid, key, prev, state),
            Owner::Socket(id) => self.update_stream(id, key, prev, prev_buffered),
            Owner::Orphan => {}
        }

        if state == TcpState::Closed {
            self.connections.remove(&key);
            log::debug!("[sock] {key} released");
        }
    }

    fn update_backlog(&mut self, lid: SocketId, key: FourTuple, prev: TcpState, state: TcpState) {
        let Ok(listener) = self.listener_mut(lid) else {
            return;
        };
        if state == TcpState::Closed {
            listener.embryonic.remove(&key);
            listener.ready.retain(|k| *k != key);
            return;
        }
        if !prev.is_synchronized() && state.is_synchronized() && listener.embryonic.remove(&key) {
            self.handshake_complete(lid, key);
        }
    }

    /// Hand a freshly established child to a waiting `accept`, or queue it.
    fn handshake_complete(&mut self, lid: SocketId, key: FourTuple) {
        loop {
            let Some(waiter) = self.listener_mut(lid).ok().and_then(|l| l.waiters.pop_front())
            else {
                break;
            };
            if waiter.is_closed() {
                continue;
            }
            let child = self.adopt(key);
            match waiter.send(Ok((child, key.remote))) {
                Ok(()) => {
                    log::debug!("[sock] {lid} accepted {child} from {}", key.remote);
                    return;
                }
                Err(_) => {
                    self.sockets.remove(&child);
                    if let Some(slot) = self.connections.get_mut(&key) {
                        slot.owner = Owner::Backlog(lid);
                    }
                }
            }
        }
        if let Ok(listener) = self.listener_mut(lid) {
            listener.ready.push_back(key);
            log::debug!("[sock] {key} ready for accept on {lid}");
            self.events.push_back(SocketEvent::Acceptable(lid));
        }
    }

    fn update_stream(&mut self, id: SocketId, key: FourTuple, prev: TcpState, prev_buffered: usize) {
        let Some(Role::Stream(stream)) = self.sockets.get_mut(&id).map(|e| &mut e.role) else {
            return;
        };
        let Some(slot) = self.connections.get_mut(&key) else {
            return;
        };
        let conn = &mut slot.conn;
        let state = conn.state();

        if !prev.is_synchronized() && state.is_synchronized() {
            if let Some(tx) = stream.connect.take() {
                let _ = tx.send(Ok(()));
            }
            self.events.push_back(SocketEvent::Connected(id));
        }

        if state == TcpState::Closed {
            let err = if conn.was_reset() {
                stream.reset = true;
                SocketError::ConnectionReset
            } else {
                SocketError::Closed
            };
            if let Some(tx) = stream.connect.take() {
                let _ = tx.send(Err(err.clone()));
            }
            if let Some(w) = stream.recv.take() {
                let _ = w.tx.send(Err(err));
            }
            self.events.push_back(SocketEvent::Closed(id));
            return;
        }

        if conn.buffered() > prev_buffered {
            self.events.push_back(SocketEvent::Readable(id));
        }
        if state.peer_closed() && !prev.peer_closed() {
            self.events.push_back(SocketEvent::PeerClosed(id));
        }

        let satisfied = stream
            .recv
            .as_ref()
            .is_some_and(|w| conn.buffered() >= w.want || conn.fin_received());
        if satisfied {
            if let Some(w) = stream.recv.take() {
                let _ = w.tx.send(take_bytes(conn, w.want));
            }
        }
    }

    /// Detach a connection from its socket and begin an orderly close.
    fn abandon(&mut self, key: FourTuple, now: Instant) {
        let Some(slot) = self.connections.get_mut(&key) else {
            return;
        };
        slot.owner = Owner::Orphan;
        let (prev, buffered) = (slot.conn.state(), slot.conn.buffered());
        if let Some(fin) = slot.conn.close() {
            self.emit_tcp(&key, fin);
        }
        self.after_update(key, prev, buffered, now);
    }

    /// Give an unaccepted connection its own socket.
    fn adopt(&mut self, key: FourTuple) -> SocketId {
        let child = self.create(Protocol::Tcp);
        if let Some(entry) = self.sockets.get_mut(&child) {
            entry.local = Some(key.local);
            entry.role = Role::Stream(Stream::new(key));
        }
        if let Some(slot) = self.connections.get_mut(&key) {
            slot.owner = Owner::Socket(child);
        }
        child
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn emit_tcp(&mut self, key: &FourTuple, seg: TcpSegment) {
        let ident = self.next_ident();
        log::debug!(
            "[sock] {key} → flags={:#04x} seq={} ack={} len={}",
            seg.header.flags,
            seg.header.seq,
            seg.header.ack,
            seg.payload.len()
        );
        let frame = packet::build_tcp_frame(
            *key.local.ip(),
            *key.remote.ip(),
            &seg,
            ident,
            self.config.ttl,
        );
        self.outbound.push_back(frame);
    }

    fn next_ident(&mut self) -> u16 {
        let ident = self.ident;
        self.ident = self.ident.wrapping_add(1);
        ident
    }

    fn source_ip(&self, bound: Ipv4Addr) -> Ipv4Addr {
        if bound.is_unspecified() {
            self.config.local_addr
        } else {
            bound
        }
    }

    fn entry(&self, id: SocketId) -> Result<&SocketEntry, SocketError> {
        self.sockets.get(&id).ok_or(SocketError::UnknownSocket(id))
    }

    fn entry_mut(&mut self, id: SocketId) -> Result<&mut SocketEntry, SocketError> {
        self.sockets.get_mut(&id).ok_or(SocketError::UnknownSocket(id))
    }

    fn listener_mut(&mut self, id: SocketId) -> Result<&mut Listener, SocketError> {
        let entry = self.entry_mut(id)?;
        let protocol = entry.protocol;
        match &mut entry.role {
            Role::Listener(l) => Ok(l),
            _ if !protocol.capabilities().listen_capable => Err(wrong_protocol("accept", protocol)),
            _ => Err(SocketError::NotListening),
        }
    }

    fn datagram_mut(&mut self, id: SocketId) -> Result<&mut Datagram, SocketError> {
        let entry = self.entry_mut(id)?;
        let protocol = entry.protocol;
        match &mut entry.role {
            Role::Datagram(d) => Ok(d),
            _ if !protocol.capabilities().connectionless => {
                Err(wrong_protocol("recvfrom", protocol))
            }
            _ => Err(SocketError::NotBound),
        }
    }

    fn stream_key(&self, id: SocketId, op: &'static str) -> Result<FourTuple, SocketError> {
        let entry = self.entry(id)?;
        if entry.protocol.capabilities().connectionless {
            return Err(wrong_protocol(op, entry.protocol));
        }
        match &entry.role {
            Role::Stream(s) if s.reset => Err(SocketError::ConnectionReset),
            Role::Stream(s) => Ok(s.key),
            _ => Err(SocketError::NotConnected),
        }
    }

    fn conn_state(&self, key: &FourTuple) -> TcpState {
        self.connection_state(key).unwrap_or(TcpState::Closed)
    }

    fn find_listener(&self, local: SocketAddrV4) -> Option<SocketId> {
        lookup(&self.listeners, local)
    }

    fn addr_in_use(&self, protocol: Protocol, addr: SocketAddrV4) -> bool {
        if protocol.capabilities().connectionless {
            return self.udp.contains_key(&addr);
        }
        self.listeners.contains_key(&addr)
            || self.sockets.values().any(|e| {
                e.protocol == protocol
                    && e.local == Some(addr)
                    && !matches!(e.role, Role::Stream(_))
            })
    }

    fn port_in_use(&self, protocol: Protocol, port: u16) -> bool {
        if protocol.capabilities().connectionless {
            return self.udp.keys().any(|a| a.port() == port);
        }
        self.sockets
            .values()
            .any(|e| e.protocol == protocol && e.local.is_some_and(|a| a.port() == port))
            || self.connections.keys().any(|k| k.local.port() == port)
    }

    fn ephemeral_port(&self, protocol: Protocol) -> Result<u16, SocketError> {
        let mut rng = rand::rng();
        for _ in 0..EPHEMERAL_ATTEMPTS {
            let port = rng.random_range(EPHEMERAL_FIRST..=EPHEMERAL_LAST);
            if !self.port_in_use(protocol, port) {
                return Ok(port);
            }
        }
        Err(SocketError::AddressInUse)
    }
}

/// Exact address first, then the wildcard on the same port.
fn lookup(table: &HashMap<SocketAddrV4, SocketId>, local: SocketAddrV4) -> Option<SocketId> {
    table
        .get(&local)
        .or_else(|| table.get(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local.port())))
        .copied()
}

fn malformed(e: PacketError) -> Disposition {
    log::debug!("[sock] dropping malformed frame: {e}");
    Disposition::Dropped(DropReason::Malformed(e))
}

fn wrong_protocol(op: &'static str, protocol: Protocol) -> SocketError {
    SocketError::WrongProtocol { op, protocol }
}

/// Read up to `want` bytes for a completed `recv`; EOF yields an empty vec.
fn take_bytes(conn: &mut TcpConnection, want: usize) -> Result<Vec<u8>, SocketError> {
    match conn.read(want)? {
        ReadOutcome::Data(bytes) => Ok(bytes),
        ReadOutcome::Eof | ReadOutcome::WouldBlock => Ok(Vec::new()),
    }
}
