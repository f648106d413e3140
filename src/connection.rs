//! Per-connection TCP state machine.
//!
//! A [`TcpConnection`] owns the complete protocol state for one 4-tuple.
//! Its responsibilities are:
//! - Driving the FSM (see [`crate::state`]) on local calls and inbound
//!   segments.
//! - Coordinating [`crate::sender::SendBuffer`] and
//!   [`crate::receiver::RecvBuffer`].
//! - Producing the reply segment, if any, for every input.
//! - Publishing every state change on a `watch` channel so waiters can
//!   suspend on transitions instead of polling.
//!
//! The connection never performs I/O and never blocks; the socket manager
//! wraps its output in IP frames and queues them for the device.
//!
//! Simplifications relative to RFC 793: no retransmission timer, no
//! out-of-order reassembly, no option negotiation, no congestion control.
//! A production stack must add a retransmission timer keyed to the bytes
//! still held by the send buffer.

use std::fmt;
use std::net::SocketAddrV4;

use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::StackConfig;
use crate::packet::{flags, TcpHeader, TcpSegment};
use crate::receiver::RecvBuffer;
use crate::sender::SendBuffer;
use crate::state::TcpState;

/// The 4-tuple identifying one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
}

impl FourTuple {
    pub fn new(local: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self { local, remote }
    }
}

impl fmt::Display for FourTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.local, self.remote)
    }
}

/// Operation attempted in a state that does not permit it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TcpError {
    #[error("{op} is not permitted in state {state}")]
    InvalidState { op: &'static str, state: TcpState },
}

/// Result of a non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Buffered bytes, at most the requested amount.
    Data(Vec<u8>),
    /// The peer's FIN has been consumed and the buffer is empty.
    Eof,
    /// Nothing buffered yet; the stream is still open.
    WouldBlock,
}

/// One TCP connection.
#[derive(Debug)]
pub struct TcpConnection {
    pub key: FourTuple,
    state: TcpState,
    iss: u32,
    pub sender: SendBuffer,
    pub receiver: RecvBuffer,
    /// Sequence number carried by our FIN, once sent.
    fin_seq: Option<u32>,
    /// Window last advertised by the peer.
    peer_window: u16,
    reset: bool,
    state_tx: watch::Sender<TcpState>,
}

impl TcpConnection {
    /// New connection in CLOSED with an initial sequence number drawn from
    /// the thread-local CSPRNG.
    pub fn new(key: FourTuple, config: &StackConfig) -> Self {
        Self::with_isn(key, config, rand::rng().random())
    }

    /// New connection in CLOSED with a caller-chosen initial sequence number.
    pub fn with_isn(key: FourTuple, config: &StackConfig, iss: u32) -> Self {
        let (state_tx, _) = watch::channel(TcpState::Closed);
        Self {
            key,
            state: TcpState::Closed,
            iss,
            sender: SendBuffer::new(iss, config.mss),
            receiver: RecvBuffer::new(config.window),
            fin_seq: None,
            peer_window: 0,
            reset: false,
            state_tx,
        }
    }

    /// Passive endpoint in LISTEN, ready to take one inbound SYN.
    pub fn passive(key: FourTuple, config: &StackConfig) -> Self {
        let mut conn = Self::new(key, config);
        conn.set_state(TcpState::Listen);
        conn
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    /// Receiver that observes every subsequent state change.
    pub fn subscribe(&self) -> watch::Receiver<TcpState> {
        self.state_tx.subscribe()
    }

    pub fn iss(&self) -> u32 {
        self.iss
    }

    /// Oldest sequence number of ours the peer has not acknowledged.
    pub fn sequence_number(&self) -> u32 {
        self.sender.snd_una
    }

    /// Next sequence number expected from the peer.
    pub fn acknowledgment_number(&self) -> u32 {
        self.receiver.ack_number()
    }

    pub fn peer_window(&self) -> u16 {
        self.peer_window
    }

    /// `true` if the connection reached CLOSED because of an inbound RST.
    pub fn was_reset(&self) -> bool {
        self.reset
    }

    /// Bytes buffered for the application.
    pub fn buffered(&self) -> usize {
        self.receiver.len()
    }

    /// `true` in the states where [`TcpConnection::read`] is legal.
    pub fn readable(&self) -> bool {
        matches!(
            self.state,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        ) || self.receiver.fin_received()
    }

    /// `true` once the peer's FIN has been received.
    pub fn fin_received(&self) -> bool {
        self.receiver.fin_received()
    }

    // -----------------------------------------------------------------------
    // Local operations
    // -----------------------------------------------------------------------

    /// Active open: emit SYN and move to SYN_SENT.
    pub fn connect(&mut self) -> Result<TcpSegment, TcpError> {
        if self.state != TcpState::Closed {
            return Err(self.invalid("connect"));
        }
        let seq = self.sender.consume_control();
        self.set_state(TcpState::SynSent);
        Ok(self.segment(seq, flags::SYN, Vec::new()))
    }

    /// Queue `data` and return the PSH|ACK segments carrying it.
    pub fn send(&mut self, data: &[u8]) -> Result<Vec<TcpSegment>, TcpError> {
        if !self.state.can_send() {
            return Err(self.invalid("send"));
        }
        let segments = self
            .sender
            .queue(data)
            .into_iter()
            .map(|(seq, chunk)| self.segment(seq, flags::PSH | flags::ACK, chunk))
            .collect::<Vec<_>>();
        log::debug!(
            "[tcp] {} queued {} bytes in {} segment(s)",
            self.key,
            data.len(),
            segments.len()
        );
        Ok(segments)
    }

    /// Take up to `max` buffered bytes without waiting.
    ///
    /// Legal while the peer may still send (ESTABLISHED, FIN_WAIT_1,
    /// FIN_WAIT_2) and after the peer's FIN, to drain what is left.
    pub fn read(&mut self, max: usize) -> Result<ReadOutcome, TcpError> {
        if !self.readable() {
            return Err(self.invalid("recv"));
        }
        if !self.receiver.is_empty() {
            Ok(ReadOutcome::Data(self.receiver.read(max)))
        } else if self.receiver.fin_received() {
            Ok(ReadOutcome::Eof)
        } else {
            Ok(ReadOutcome::WouldBlock)
        }
    }

    /// Begin (or continue) an orderly close.
    ///
    /// Returns the FIN+ACK to transmit, if this call emitted one.  Closing a
    /// connection that is already closed or closing is a no-op.
    pub fn close(&mut self) -> Option<TcpSegment> {
        match self.state {
            TcpState::Listen | TcpState::SynSent => {
                self.set_state(TcpState::Closed);
                None
            }
            TcpState::SynReceived | TcpState::Established => {
                let fin = self.emit_fin();
                self.set_state(TcpState::FinWait1);
                Some(fin)
            }
            TcpState::CloseWait => {
                let fin = self.emit_fin();
                self.set_state(TcpState::LastAck);
                Some(fin)
            }
            TcpState::Closed
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::Closing
            | TcpState::LastAck
            | TcpState::TimeWait => None,
        }
    }

    /// TIME_WAIT linger elapsed: free the connection.
    ///
    /// Returns `false` if the connection was not lingering.
    pub fn expire_time_wait(&mut self) -> bool {
        if self.state != TcpState::TimeWait {
            return false;
        }
        self.set_state(TcpState::Closed);
        true
    }

    // -----------------------------------------------------------------------
    // Inbound segments
    // -----------------------------------------------------------------------

    /// Process one inbound segment and return the reply to send, if any.
    pub fn on_segment(&mut self, h: &TcpHeader, payload: &[u8]) -> Option<TcpSegment> {
        if h.has(flags::RST) {
            self.on_reset(h);
            return None;
        }

        match self.state {
            TcpState::Closed => None,
            TcpState::Listen => {
                if !h.has(flags::SYN) || h.has(flags::ACK) {
                    return None;
                }
                self.receiver.on_syn(h.seq);
                self.peer_window = h.window;
                let seq = self.sender.consume_control();
                self.set_state(TcpState::SynReceived);
                Some(self.segment(seq, flags::SYN | flags::ACK, Vec::new()))
            }
            TcpState::SynSent => {
                if !h.has(flags::SYN | flags::ACK) || h.ack != self.sender.snd_nxt {
                    return None;
                }
                self.receiver.on_syn(h.seq);
                self.sender.on_ack(h.ack);
                self.peer_window = h.window;
                self.set_state(TcpState::Established);
                Some(self.ack_segment())
            }
            TcpState::SynReceived => {
                if h.has(flags::SYN) && !h.has(flags::ACK) {
                    // Peer repeated its SYN; answer with the same SYN+ACK.
                    if h.seq.wrapping_add(1) == self.receiver.ack_number() {
                        return Some(self.segment(self.iss, flags::SYN | flags::ACK, Vec::new()));
                    }
                    return None;
                }
                if !h.has(flags::ACK) || !self.sender.is_new_ack(h.ack) {
                    return None;
                }
                self.sender.on_ack(h.ack);
                self.peer_window = h.window;
                self.set_state(TcpState::Established);
                // The completing ACK may already carry data or a FIN.
                if payload.is_empty() && !h.has(flags::FIN) {
                    None
                } else {
                    self.on_synchronized(h, payload)
                }
            }
            _ => self.on_synchronized(h, payload),
        }
    }

    /// Segment processing once both sides are synchronized.
    fn on_synchronized(&mut self, h: &TcpHeader, payload: &[u8]) -> Option<TcpSegment> {
        if h.has(flags::SYN) {
            log::debug!("[tcp] {} ignoring SYN in {}", self.key, self.state);
            return None;
        }

        let mut reply = false;

        if h.has(flags::ACK) {
            self.peer_window = h.window;
            let acked = self.sender.on_ack(h.ack);
            if acked > 0 {
                log::debug!("[tcp] {} ← ACK ack={} ({} bytes)", self.key, h.ack, acked);
            }
            if self.our_fin_acked() {
                match self.state {
                    TcpState::FinWait1 => self.set_state(TcpState::FinWait2),
                    TcpState::Closing => self.set_state(TcpState::TimeWait),
                    TcpState::LastAck => {
                        self.set_state(TcpState::Closed);
                        return None;
                    }
                    _ => {}
                }
            }
        }

        if !payload.is_empty() {
            let open = matches!(
                self.state,
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
            );
            let taken = if open {
                self.receiver.on_segment(h.seq, payload)
            } else {
                0
            };
            if taken > 0 {
                log::debug!(
                    "[tcp] {} ← DATA seq={} len={} took={}; → ACK ack={}",
                    self.key,
                    h.seq,
                    payload.len(),
                    taken,
                    self.receiver.ack_number()
                );
            } else {
                log::debug!(
                    "[tcp] {} discarding seq={} len={} (expected {}, window {})",
                    self.key,
                    h.seq,
                    payload.len(),
                    self.receiver.ack_number(),
                    self.receiver.window_size()
                );
            }
            reply = true;
        }

        if h.has(flags::FIN) {
            let fin_seq = h.seq.wrapping_add(payload.len() as u32);
            if self.receiver.on_fin(fin_seq) {
                match self.state {
                    TcpState::Established => self.set_state(TcpState::CloseWait),
                    TcpState::FinWait1 => self.set_state(TcpState::Closing),
                    TcpState::FinWait2 => self.set_state(TcpState::TimeWait),
                    _ => {}
                }
                reply = true;
            } else if self.receiver.fin_received() {
                // Repeated FIN: our ACK was presumably lost.
                reply = true;
            }
        }

        reply.then(|| self.ack_segment())
    }

    fn on_reset(&mut self, h: &TcpHeader) {
        let acceptable = match self.state {
            TcpState::Closed | TcpState::Listen => false,
            TcpState::SynSent => h.has(flags::ACK) && h.ack == self.sender.snd_nxt,
            _ => h.seq == self.receiver.ack_number(),
        };
        if acceptable {
            log::debug!("[tcp] {} ← RST in {}", self.key, self.state);
            self.reset = true;
            self.set_state(TcpState::Closed);
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn our_fin_acked(&self) -> bool {
        self.fin_seq.is_some() && self.sender.all_acked()
    }

    fn emit_fin(&mut self) -> TcpSegment {
        let seq = self.sender.consume_control();
        self.fin_seq = Some(seq);
        self.segment(seq, flags::FIN | flags::ACK, Vec::new())
    }

    fn ack_segment(&self) -> TcpSegment {
        self.segment(self.sender.snd_nxt, flags::ACK, Vec::new())
    }

    fn segment(&self, seq: u32, bits: u8, payload: Vec<u8>) -> TcpSegment {
        let ack = if bits & flags::ACK != 0 {
            self.receiver.ack_number()
        } else {
            0
        };
        TcpSegment {
            header: TcpHeader::new(
                self.key.local.port(),
                self.key.remote.port(),
                seq,
                ack,
                bits,
                self.receiver.window_size(),
            ),
            payload,
        }
    }

    fn set_state(&mut self, next: TcpState) {
        if self.state != next {
            log::debug!("[tcp] {} {} -> {}", self.key, self.state, next);
            self.state = next;
            self.state_tx.send_replace(next);
        }
    }

    fn invalid(&self, op: &'static str) -> TcpError {
        TcpError::InvalidState {
            op,
            state: self.state,
        }
    }
}
