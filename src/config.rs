//! Tunable parameters for the stack and the device it runs on.
//!
//! Both structs carry sensible defaults; the binary overrides individual
//! fields from command-line flags.  Interface addressing and link state are
//! deliberately absent: those are configured with OS tooling.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Whether the virtual device carries raw IP datagrams or Ethernet frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeviceMode {
    /// Layer-3 device: every frame is an IP datagram.
    #[default]
    Tun,
    /// Layer-2 device: every frame is an Ethernet frame.
    Tap,
}

/// Parameters for opening the virtual network device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Requested interface name; the kernel may pick another if empty.
    pub name: String,
    pub mode: DeviceMode,
    /// Largest frame read from or written to the device.
    pub mtu: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "tun0".to_string(),
            mode: DeviceMode::Tun,
            mtu: 1500,
        }
    }
}

/// Protocol parameters shared by every socket of one stack instance.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Address used as the source of outbound datagrams and the default
    /// local address of unbound sockets.
    pub local_addr: Ipv4Addr,
    /// Largest payload carried by one outbound TCP segment.
    pub mss: u16,
    /// Receive window advertised by an idle connection.
    pub window: u16,
    /// Backlog used when `listen` is called with zero.
    pub default_backlog: usize,
    /// TTL stamped on outbound datagrams.
    pub ttl: u8,
    /// How long a connection lingers in TIME_WAIT before it is freed.
    pub time_wait: Duration,
    /// Datagrams queued per remote peer before new ones are dropped.
    pub udp_queue_depth: usize,
    /// Read buffer size for one device frame.
    pub mtu: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            local_addr: Ipv4Addr::new(10, 0, 0, 2),
            mss: 1460,
            window: 65535,
            default_backlog: 5,
            ttl: 64,
            time_wait: Duration::from_secs(60),
            udp_queue_depth: 64,
            mtu: 1500,
        }
    }
}
