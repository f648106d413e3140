//! TCP connection finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::connection::TcpConnection`]
//! can occupy, mirroring the TCP state diagram (RFC 793 §3.2).  Transitions
//! live in [`crate::connection`]; this module only names the states and
//! answers questions about them.
//!
//! ```text
//!                         connect()                     inbound SYN
//!   CLOSED ───────────────────────▶ SYN_SENT    LISTEN ───────────▶ SYN_RECEIVED
//!                                      │ SYN+ACK / ACK                  │ ACK
//!                                      ▼                                ▼
//!                                 ESTABLISHED ◀─────────────────────────┘
//!             close() / FIN+ACK        │        inbound FIN / ACK
//!             ┌────────────────────────┴──────────────────────┐
//!             ▼                                               ▼
//!        FIN_WAIT_1 ──FIN (ours unacked)──▶ CLOSING       CLOSE_WAIT
//!         │ ACK    └──FIN+ACK──┐              │ ACK           │ close() / FIN+ACK
//!         ▼                    ▼              ▼               ▼
//!        FIN_WAIT_2 ──FIN──▶ TIME_WAIT ◀──────┘            LAST_ACK
//!                              │ linger elapses               │ ACK
//!                              ▼                              ▼
//!                            CLOSED                         CLOSED
//! ```

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TcpState {
    /// No connection exists; initial and terminal state.
    #[default]
    Closed,
    /// Passive endpoint waiting for a SYN.
    Listen,
    /// SYN has been sent; waiting for SYN+ACK.
    SynSent,
    /// SYN received; SYN+ACK sent; waiting for ACK.
    SynReceived,
    /// Three-way handshake complete; data transfer in progress.
    Established,
    /// Local side sent FIN; waiting for its ACK.
    FinWait1,
    /// Local FIN acknowledged; waiting for the peer's FIN.
    FinWait2,
    /// Peer's FIN received; local close pending.
    CloseWait,
    /// Both sides sent FIN before either was acknowledged.
    Closing,
    /// Local FIN sent after the peer's; waiting for the final ACK.
    LastAck,
    /// Lingering so delayed duplicates expire before the 4-tuple is reused.
    TimeWait,
}

impl TcpState {
    /// States in which both sides have exchanged initial sequence numbers.
    pub fn is_synchronized(self) -> bool {
        !matches!(
            self,
            TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynReceived
        )
    }

    /// States in which application data may still be queued for sending.
    pub fn can_send(self) -> bool {
        self == TcpState::Established
    }

    /// States in which the peer has sent its FIN.
    pub fn peer_closed(self) -> bool {
        matches!(
            self,
            TcpState::CloseWait | TcpState::Closing | TcpState::LastAck | TcpState::TimeWait
        )
    }
}

impl std::fmt::Display for TcpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}
