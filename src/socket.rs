//! Socket handles and the types shared by every socket operation.
//!
//! Applications never hold a [`crate::connection::TcpConnection`] or a
//! [`crate::udp::UdpBinding`] directly.  They hold a [`SocketId`] and call
//! into [`crate::socket_manager::SocketManager`], which owns all protocol
//! state.  This module defines:
//! - [`SocketId`]: an opaque handle.
//! - [`Protocol`]: the closed set of supported transports and their
//!   [`Capabilities`].
//! - [`SocketError`]: every failure a socket call can report.
//! - [`Pending`]: the completion returned by operations that must wait for
//!   the network (`connect`, `accept`, `recv`, `recvfrom`).
//! - [`SocketEvent`]: readiness notifications for callback-style
//!   applications.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::connection::TcpError;

/// Opaque socket handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub(crate) u32);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Transport protocol of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// What a protocol supports, queried instead of matching on the variant
/// wherever behavior differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `listen` / `accept` are available.
    pub listen_capable: bool,
    /// Data is exchanged as addressed datagrams without a handshake.
    pub connectionless: bool,
}

impl Protocol {
    pub fn capabilities(self) -> Capabilities {
        match self {
            Protocol::Tcp => Capabilities {
                listen_capable: true,
                connectionless: false,
            },
            Protocol::Udp => Capabilities {
                listen_capable: false,
                connectionless: true,
            },
        }
    }

    /// IP protocol number carried in the IPv4 header.
    pub fn number(self) -> u8 {
        match self {
            Protocol::Tcp => crate::packet::protocol::TCP,
            Protocol::Udp => crate::packet::protocol::UDP,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors reported synchronously (or through a [`Pending`]) to the caller of
/// a socket operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("no such socket: {0}")]
    UnknownSocket(SocketId),
    #[error("{op} is not supported on a {protocol} socket")]
    WrongProtocol { op: &'static str, protocol: Protocol },
    #[error("address already in use")]
    AddressInUse,
    #[error("socket is already bound")]
    AlreadyBound,
    #[error("datagram of {len} bytes exceeds the {max}-byte limit")]
    MessageTooLong { len: usize, max: usize },
    #[error("socket is not bound")]
    NotBound,
    #[error("socket is not listening")]
    NotListening,
    #[error("socket is not connected")]
    NotConnected,
    #[error(transparent)]
    InvalidState(#[from] TcpError),
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("socket closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Pending
// ---------------------------------------------------------------------------

pub(crate) type Completer<T> = oneshot::Sender<Result<T, SocketError>>;

/// Result of an operation that completes when the dispatcher observes the
/// awaited transition.
///
/// `Pending` is a [`Future`], so async applications simply `.await` it.
/// Code running inside the event loop itself must not block; it calls
/// [`Pending::try_take`] from a later callback instead.  If the socket is
/// closed before completion the result is [`SocketError::Closed`].
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, SocketError>>,
}

impl<T> Pending<T> {
    pub(crate) fn channel() -> (Completer<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A completion that is already resolved.
    pub(crate) fn ready(result: Result<T, SocketError>) -> Self {
        let (tx, pending) = Self::channel();
        // The receiver is held by `pending`, so this cannot fail.
        let _ = tx.send(result);
        pending
    }

    /// Take the result if it is available, without waiting.
    pub fn try_take(&mut self) -> Option<Result<T, SocketError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(SocketError::Closed)),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, SocketError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(SocketError::Closed)))
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Readiness notification queued by the socket manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    /// An active open completed.
    Connected(SocketId),
    /// A listener has a completed connection waiting in its backlog.
    Acceptable(SocketId),
    /// New stream bytes are buffered.
    Readable(SocketId),
    /// The peer sent FIN; reads drain the buffer and then report EOF.
    PeerClosed(SocketId),
    /// The connection reached CLOSED (orderly or by reset).
    Closed(SocketId),
    /// A datagram was queued on a UDP socket.
    Datagram(SocketId),
}

impl SocketEvent {
    pub fn socket(&self) -> SocketId {
        match *self {
            SocketEvent::Connected(id)
            | SocketEvent::Acceptable(id)
            | SocketEvent::Readable(id)
            | SocketEvent::PeerClosed(id)
            | SocketEvent::Closed(id)
            | SocketEvent::Datagram(id) => id,
        }
    }
}
