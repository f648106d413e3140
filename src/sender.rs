//! Outbound byte stream state for one TCP connection.
//!
//! [`SendBuffer`] tracks sequence numbers and the bytes that have been
//! transmitted but not yet acknowledged.  It does **not** touch the device;
//! [`crate::connection::TcpConnection`] turns its output into segments.
//!
//! # Contract
//! - Queued data is cut into chunks of at most `mss` bytes, each stamped
//!   with the sequence number of its first byte.
//! - ACKs are **cumulative**: an ACK covering N new sequence numbers advances
//!   `snd_una` by N and drops the acknowledged prefix of the buffer.
//! - Nothing is ever retransmitted; unacknowledged bytes simply stay queued.
//!
//! ```text
//!   snd_una                  snd_nxt
//!      │                        │
//!  ────┼────────────────────────┼──────────▶ seq space
//!      │ <── sent, unacked ──▶  │
//! ```

use std::collections::VecDeque;

/// Returns `true` when sequence number `a` is ≤ `b` in wrap-around space.
///
/// The comparison works correctly as long as the two values are less than
/// `u32::MAX / 2` apart, which is always the case for a sane window.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) <= (u32::MAX / 2)
}

/// Strict variant of [`seq_le`].
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    a != b && seq_le(a, b)
}

/// Send-side state for one connection.
#[derive(Debug)]
pub struct SendBuffer {
    /// Oldest unacknowledged sequence number (SND.UNA).
    pub snd_una: u32,
    /// Sequence number the next new byte (or SYN/FIN) will carry (SND.NXT).
    pub snd_nxt: u32,
    /// Unacknowledged payload; the front byte carries `snd_una` once the SYN
    /// has been acknowledged.
    unacked: VecDeque<u8>,
    mss: usize,
}

impl SendBuffer {
    /// Create a buffer starting at the initial send sequence number `iss`.
    pub fn new(iss: u32, mss: u16) -> Self {
        Self {
            snd_una: iss,
            snd_nxt: iss,
            unacked: VecDeque::new(),
            mss: usize::from(mss.max(1)),
        }
    }

    /// Consume one sequence number for a SYN or FIN.
    pub fn consume_control(&mut self) -> u32 {
        let seq = self.snd_nxt;
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        seq
    }

    /// Queue `data` and return it cut into `(seq, chunk)` pairs of at most
    /// `mss` bytes, ready to transmit.
    pub fn queue(&mut self, data: &[u8]) -> Vec<(u32, Vec<u8>)> {
        let mut chunks = Vec::with_capacity(data.len().div_ceil(self.mss));
        for chunk in data.chunks(self.mss) {
            chunks.push((self.snd_nxt, chunk.to_vec()));
            self.unacked.extend(chunk.iter().copied());
            self.snd_nxt = self.snd_nxt.wrapping_add(chunk.len() as u32);
        }
        chunks
    }

    /// `true` when `ack` acknowledges something sent but not yet acknowledged.
    pub fn is_new_ack(&self, ack: u32) -> bool {
        seq_lt(self.snd_una, ack) && seq_le(ack, self.snd_nxt)
    }

    /// Process a cumulative ACK number.
    ///
    /// Returns the number of payload bytes newly acknowledged.  Duplicate,
    /// stale, or future ACKs change nothing and return `0`.
    pub fn on_ack(&mut self, ack: u32) -> usize {
        if !self.is_new_ack(ack) {
            return 0;
        }
        let covered = ack.wrapping_sub(self.snd_una) as usize;
        let dropped = covered.min(self.unacked.len());
        self.unacked.drain(..dropped);
        self.snd_una = ack;
        dropped
    }

    /// `true` once every transmitted sequence number has been acknowledged.
    pub fn all_acked(&self) -> bool {
        self.snd_una == self.snd_nxt
    }

    /// Payload bytes still awaiting acknowledgement.
    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn mss(&self) -> usize {
        self.mss
    }
}
