//! Two socket managers wired back to back.
//!
//! Frames emitted by one side are dispatched into the other until both
//! outbound queues are empty, so tests can drive complete exchanges without
//! a device or an event loop.

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddrV4};

use tun_tcpip::config::StackConfig;
use tun_tcpip::socket::{Protocol, SocketId};
use tun_tcpip::socket_manager::{Disposition, SocketManager};

pub const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

pub fn config(local: Ipv4Addr) -> StackConfig {
    StackConfig {
        local_addr: local,
        ..StackConfig::default()
    }
}

pub fn server_addr(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(SERVER_IP, port)
}

pub struct Link {
    pub client: SocketManager,
    pub server: SocketManager,
    /// Dispositions of every frame delivered into the server, in order.
    pub server_log: Vec<Disposition>,
    pub client_log: Vec<Disposition>,
}

impl Link {
    pub fn new() -> Self {
        Self::with_configs(config(CLIENT_IP), config(SERVER_IP))
    }

    pub fn with_configs(client: StackConfig, server: StackConfig) -> Self {
        Self {
            client: SocketManager::new(client),
            server: SocketManager::new(server),
            server_log: Vec::new(),
            client_log: Vec::new(),
        }
    }

    /// Shuttle frames until neither side has anything left to send.
    /// Returns the number of frames moved.
    pub fn settle(&mut self) -> usize {
        let mut moved = 0;
        for _ in 0..64 {
            let to_server = self.client.drain_outbound();
            let to_client = self.server.drain_outbound();
            if to_server.is_empty() && to_client.is_empty() {
                return moved;
            }
            moved += to_server.len() + to_client.len();
            for frame in to_server {
                self.server_log.push(self.server.dispatch(&frame));
            }
            for frame in to_client {
                self.client_log.push(self.client.dispatch(&frame));
            }
        }
        panic!("link did not settle");
    }

    /// A listening TCP socket on `0.0.0.0:port` at the server.
    pub fn listen(&mut self, port: u16, backlog: usize) -> SocketId {
        let id = self.server.create(Protocol::Tcp);
        self.server
            .bind(id, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
            .unwrap();
        self.server.listen(id, backlog).unwrap();
        id
    }

    /// Establish one connection; returns `(client socket, server socket)`.
    pub fn connect(&mut self, listener: SocketId, port: u16) -> (SocketId, SocketId) {
        let client = self.client.create(Protocol::Tcp);
        let mut connecting = self.client.connect(client, server_addr(port));
        self.settle();
        assert_eq!(connecting.try_take(), Some(Ok(())));
        let (server, _) = self
            .server
            .try_accept(listener)
            .unwrap()
            .expect("completed connection in backlog");
        (client, server)
    }
}
