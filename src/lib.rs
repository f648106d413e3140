//! `tun-tcpip`: a user-space TCP/IP engine that speaks IPv4, TCP, and UDP
//! over a TUN device.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐ frames ┌──────────────────────────────────────────┐
//!  │ Device (TUN) │◀──────▶│               SocketManager              │
//!  └──────┬───────┘        │  dispatch ─▶ TcpConnection (per 4-tuple) │
//!         │ fd             │           └▶ UdpBinding → UdpEndpoint    │
//!  ┌──────▼───────┐        │  outbound frames, events, TIME_WAIT      │
//!  │  EventLoop   │───────▶└──────────────────────────────────────────┘
//!  │ poll + timers│ callbacks          ▲
//!  └──────────────┘                    │ socket API
//!                                 application
//! ```
//!
//! [`stack::Stack`] wires the three together; everything runs on the loop's
//! thread.
//!
//! Each module has a single responsibility:
//! - [`packet`]: IPv4/TCP/UDP wire format and checksums
//! - [`state`]: TCP connection states
//! - [`sender`]: send sequence space
//! - [`receiver`]: receive sequence space and stream buffer
//! - [`connection`]: per-connection TCP state machine
//! - [`udp`]: per-peer datagram queues
//! - [`socket`]: socket ids, errors, events, and completions
//! - [`socket_manager`]: socket tables and inbound demultiplexing
//! - [`timer`]: deadline queue
//! - [`event_loop`]: `poll(2)` readiness dispatcher
//! - [`device`]: TUN/TAP device I/O
//! - [`simulator`]: in-memory device with fault injection
//! - [`stack`]: device + sockets + loop
//! - [`config`]: tunables

pub mod config;
pub mod connection;
pub mod device;
pub mod event_loop;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod socket_manager;
pub mod stack;
pub mod state;
pub mod timer;
pub mod udp;
