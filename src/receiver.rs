//! Inbound byte stream state for one TCP connection.
//!
//! [`RecvBuffer`] is responsible for everything that happens *after* a
//! segment has been matched to a connection and *before* the application
//! reads contiguous bytes:
//! - Accepting only the segment that starts exactly at `RCV.NXT`, and only
//!   as much of it as the advertised window allows.
//! - Buffering accepted payload for the application.
//! - Recording the peer's FIN, which consumes one sequence number.
//! - Computing the ACK number and advertised window for outbound segments.
//!
//! Out-of-order segments are discarded, never reassembled.  The caller still
//! sends a duplicate ACK so the peer learns where the stream stands.

use std::collections::VecDeque;

/// Receive-side state for one connection.
#[derive(Debug)]
pub struct RecvBuffer {
    /// Next expected sequence number (`RCV.NXT`).
    pub rcv_nxt: u32,
    /// In-order payload bytes not yet consumed by the application.
    data: VecDeque<u8>,
    /// Window advertised when the buffer is empty.
    capacity: u16,
    fin_received: bool,
}

impl RecvBuffer {
    pub fn new(capacity: u16) -> Self {
        Self {
            rcv_nxt: 0,
            data: VecDeque::new(),
            capacity,
            fin_received: false,
        }
    }

    /// Record the peer's SYN; the first data byte is `peer_isn + 1`.
    pub fn on_syn(&mut self, peer_isn: u32) {
        self.rcv_nxt = peer_isn.wrapping_add(1);
    }

    /// Process an inbound payload.
    ///
    /// A segment starting exactly at `RCV.NXT` is accepted up to the free
    /// window; bytes past it are left unacknowledged for the peer to resend.
    /// Returns the number of bytes taken, `0` for duplicates, gaps, data
    /// after the peer's FIN, or a closed window.
    pub fn on_segment(&mut self, seq: u32, payload: &[u8]) -> usize {
        if self.fin_received || seq != self.rcv_nxt {
            return 0;
        }
        let take = payload.len().min(usize::from(self.window_size()));
        self.data.extend(payload[..take].iter().copied());
        self.rcv_nxt = self.rcv_nxt.wrapping_add(take as u32);
        take
    }

    /// Advance `RCV.NXT` past the peer's FIN.
    ///
    /// Returns `false` if the FIN does not sit at `RCV.NXT`.
    pub fn on_fin(&mut self, fin_seq: u32) -> bool {
        if self.fin_received || fin_seq != self.rcv_nxt {
            return false;
        }
        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        self.fin_received = true;
        true
    }

    /// Cumulative ACK number for the next outbound segment.
    pub fn ack_number(&self) -> u32 {
        self.rcv_nxt
    }

    /// Window to advertise: capacity minus bytes waiting for the application.
    pub fn window_size(&self) -> u16 {
        let used = u16::try_from(self.data.len()).unwrap_or(u16::MAX);
        self.capacity.saturating_sub(used)
    }

    pub fn fin_received(&self) -> bool {
        self.fin_received
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remove and return up to `max` buffered bytes.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.data.len());
        self.data.drain(..n).collect()
    }
}
