//! Inbound frame validation and the full stack over a simulated device.

mod common;

use std::cell::Cell;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use common::{config, server_addr, CLIENT_IP, SERVER_IP};
use tun_tcpip::config::DeviceMode;
use tun_tcpip::connection::ReadOutcome;
use tun_tcpip::device::Device;
use tun_tcpip::event_loop::LoopState;
use tun_tcpip::packet::{self, protocol, Ipv4Header, PacketError, IP_FLAG_MORE_FRAGMENTS};
use tun_tcpip::simulator::{FaultConfig, SimulatedDevice, Wire};
use tun_tcpip::socket::{Protocol, SocketEvent, SocketId};
use tun_tcpip::socket_manager::{Disposition, DropReason, SocketManager};
use tun_tcpip::stack::Stack;

fn dropped(reason: DropReason) -> Disposition {
    Disposition::Dropped(reason)
}

/// A server manager with a UDP socket bound on `0.0.0.0:53`.
fn udp_server() -> (SocketManager, SocketId) {
    let mut m = SocketManager::new(config(SERVER_IP));
    let id = m.create(Protocol::Udp);
    m.bind(id, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 53)).unwrap();
    (m, id)
}

fn udp_frame(payload: &[u8]) -> Vec<u8> {
    packet::build_udp_frame(
        SocketAddrV4::new(CLIENT_IP, 40000),
        server_addr(53),
        payload,
        1,
        64,
    )
}

// ---------------------------------------------------------------------------
// IPv4 layer
// ---------------------------------------------------------------------------

#[test]
fn truncated_frame_is_malformed() {
    let (mut m, _) = udp_server();
    assert_eq!(
        m.dispatch(&[0x45, 0, 0]),
        dropped(DropReason::Malformed(PacketError::Truncated { needed: 20, got: 3 }))
    );
}

#[test]
fn short_header_length_is_malformed() {
    let (mut m, _) = udp_server();
    let mut frame = udp_frame(b"x");
    frame[0] = 0x44;
    assert_eq!(
        m.dispatch(&frame),
        dropped(DropReason::Malformed(PacketError::BadHeaderLength(4)))
    );
}

#[test]
fn non_ipv4_version_is_dropped() {
    let (mut m, _) = udp_server();
    let mut frame = udp_frame(b"x");
    frame[0] = 0x65;
    assert_eq!(m.dispatch(&frame), dropped(DropReason::UnsupportedVersion(6)));
}

#[test]
fn header_checksum_mismatch_is_dropped() {
    let (mut m, id) = udp_server();
    let mut frame = udp_frame(b"x");
    frame[8] -= 1; // TTL
    assert_eq!(m.dispatch(&frame), dropped(DropReason::BadChecksum));
    assert_eq!(m.try_recvfrom(id), Ok(None));
}

#[test]
fn fragments_are_dropped() {
    let (mut m, _) = udp_server();
    let whole = udp_frame(b"part");
    let udp = &whole[packet::IPV4_HEADER_LEN..];
    let mut ip = Ipv4Header::new(CLIENT_IP, SERVER_IP, protocol::UDP, udp.len(), 7, 64);
    ip.flags_fragment = IP_FLAG_MORE_FRAGMENTS;
    ip.fill_checksum();
    assert_eq!(m.dispatch(&ip.encode(udp)), dropped(DropReason::Fragment));
}

#[test]
fn unknown_protocol_is_dropped() {
    let (mut m, _) = udp_server();
    let icmp_echo = [8u8, 0, 0xf7, 0xff, 0, 0, 0, 0];
    let mut ip = Ipv4Header::new(CLIENT_IP, SERVER_IP, 1, icmp_echo.len(), 7, 64);
    ip.fill_checksum();
    assert_eq!(
        m.dispatch(&ip.encode(&icmp_echo)),
        dropped(DropReason::UnsupportedProtocol(1))
    );
}

#[test]
fn link_padding_after_datagram_is_ignored() {
    let (mut m, id) = udp_server();
    let mut frame = udp_frame(b"padded");
    frame.extend_from_slice(&[0; 6]);
    assert!(m.dispatch(&frame).is_delivered());
    assert_eq!(m.try_recvfrom(id).unwrap().unwrap().0, b"padded");
}

// ---------------------------------------------------------------------------
// Transport layer
// ---------------------------------------------------------------------------

#[test]
fn tcp_checksum_mismatch_is_dropped() {
    let mut server = SocketManager::new(config(SERVER_IP));
    let listener = server.create(Protocol::Tcp);
    server.bind(listener, server_addr(80)).unwrap();
    server.listen(listener, 0).unwrap();

    let mut client = SocketManager::new(config(CLIENT_IP));
    let id = client.create(Protocol::Tcp);
    let _connecting = client.connect(id, server_addr(80));
    let mut syn = client.drain_outbound().remove(0);
    syn[packet::IPV4_HEADER_LEN + 14] ^= 0xff; // window

    assert_eq!(server.dispatch(&syn), dropped(DropReason::BadChecksum));
    assert_eq!(server.connection_count(), 0);
    assert!(!server.has_outbound());
}

#[test]
fn segment_without_connection_or_syn_is_dropped() {
    let mut server = SocketManager::new(config(SERVER_IP));
    let listener = server.create(Protocol::Tcp);
    server.bind(listener, server_addr(80)).unwrap();
    server.listen(listener, 0).unwrap();

    let stray = packet::TcpSegment {
        header: packet::TcpHeader::new(40000, 80, 1, 1, packet::flags::ACK, 1024),
        payload: Vec::new(),
    };
    let frame = packet::build_tcp_frame(CLIENT_IP, SERVER_IP, &stray, 3, 64);
    assert_eq!(server.dispatch(&frame), dropped(DropReason::NoSocket));
    assert!(!server.has_outbound());
}

#[test]
fn zero_udp_checksum_is_not_verified() {
    let (mut m, id) = udp_server();
    let mut frame = udp_frame(b"no checksum");
    let at = packet::IPV4_HEADER_LEN + 6;
    frame[at..at + 2].copy_from_slice(&[0, 0]);
    assert!(m.dispatch(&frame).is_delivered());
    let (data, from) = m.try_recvfrom(id).unwrap().unwrap();
    assert_eq!(data, b"no checksum");
    assert_eq!(from, SocketAddrV4::new(CLIENT_IP, 40000));
}

#[test]
fn udp_checksum_mismatch_is_dropped() {
    let (mut m, _) = udp_server();
    let mut frame = udp_frame(b"payload");
    let last = frame.len() - 1;
    frame[last] ^= 0x01;
    assert_eq!(m.dispatch(&frame), dropped(DropReason::BadChecksum));
}

#[test]
fn udp_length_beyond_datagram_is_malformed() {
    let (mut m, _) = udp_server();
    let mut frame = udp_frame(b"abc");
    let at = packet::IPV4_HEADER_LEN + 4;
    frame[at..at + 2].copy_from_slice(&200u16.to_be_bytes());
    assert!(matches!(
        m.dispatch(&frame),
        Disposition::Dropped(DropReason::Malformed(PacketError::LengthMismatch { .. }))
    ));
}

#[test]
fn udp_to_unbound_port_is_dropped() {
    let mut m = SocketManager::new(config(SERVER_IP));
    assert_eq!(m.dispatch(&udp_frame(b"x")), dropped(DropReason::NoSocket));
}

#[test]
fn exact_udp_binding_preferred_over_wildcard() {
    let (mut m, wildcard) = udp_server();
    let exact = m.create(Protocol::Udp);
    m.bind(exact, server_addr(53)).unwrap();

    assert!(m.dispatch(&udp_frame(b"x")).is_delivered());
    assert!(m.try_recvfrom(exact).unwrap().is_some());
    assert_eq!(m.try_recvfrom(wildcard), Ok(None));
}

// ---------------------------------------------------------------------------
// Full stack over a simulated device
// ---------------------------------------------------------------------------

/// Move frames between a remote peer and the stack until both go quiet.
fn exchange<D: Device + 'static>(stack: &mut Stack<D>, wire: &Wire, peer: &mut SocketManager) {
    for _ in 0..16 {
        let outbound = peer.drain_outbound();
        for frame in &outbound {
            wire.inject(frame).unwrap();
        }
        stack.run_once(Duration::from_millis(20)).unwrap();
        let replies = wire.drain().unwrap();
        for frame in &replies {
            peer.dispatch(frame);
        }
        if outbound.is_empty() && replies.is_empty() && !peer.has_outbound() {
            return;
        }
    }
}

/// Uppercasing TCP echo plus UDP echo, both served from event callbacks.
fn echo_stack(wire_faults: FaultConfig) -> (Stack<SimulatedDevice>, Wire) {
    let (device, wire) = SimulatedDevice::with_faults("sim0", wire_faults).unwrap();
    let mut stack = Stack::new(device, config(SERVER_IP)).unwrap();
    let (listener, echo) = {
        let mut sockets = stack.sockets();
        let listener = sockets.create(Protocol::Tcp);
        sockets
            .bind(listener, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7))
            .unwrap();
        sockets.listen(listener, 0).unwrap();
        let echo = sockets.create(Protocol::Udp);
        sockets
            .bind(echo, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7))
            .unwrap();
        (listener, echo)
    };

    stack.set_app(move |sockets, event| match event {
        SocketEvent::Acceptable(id) if id == listener => {
            while let Ok(Some(_)) = sockets.try_accept(id) {}
        }
        SocketEvent::Readable(id) => {
            if let Ok(ReadOutcome::Data(bytes)) = sockets.read(id, 1024) {
                sockets.send(id, &bytes.to_ascii_uppercase()).unwrap();
            }
        }
        SocketEvent::PeerClosed(id) => sockets.close(id),
        SocketEvent::Datagram(id) if id == echo => {
            while let Ok(Some((data, from))) = sockets.try_recvfrom(id) {
                sockets.sendto(id, &data, from).unwrap();
            }
        }
        _ => {}
    });
    (stack, wire)
}

#[test]
fn stack_serves_tcp_over_simulated_device() {
    let (mut stack, wire) = echo_stack(FaultConfig::default());
    let mut peer = SocketManager::new(config(CLIENT_IP));
    let client = peer.create(Protocol::Tcp);
    let mut connecting = peer.connect(client, server_addr(7));

    exchange(&mut stack, &wire, &mut peer);
    assert_eq!(connecting.try_take(), Some(Ok(())));
    assert_eq!(stack.loop_state(), LoopState::Running);
    assert_eq!(stack.sockets().connection_count(), 1);

    peer.send(client, b"hello stack").unwrap();
    exchange(&mut stack, &wire, &mut peer);
    assert_eq!(
        peer.read(client, 64),
        Ok(ReadOutcome::Data(b"HELLO STACK".to_vec()))
    );

    // The stack closes its side when ours closes; it ends in CLOSED while
    // we linger in TIME_WAIT.
    peer.close(client);
    exchange(&mut stack, &wire, &mut peer);
    assert_eq!(stack.sockets().connection_count(), 0);
    assert_eq!(peer.connection_count(), 1);
}

#[test]
fn stack_echoes_udp_over_simulated_device() {
    let (mut stack, wire) = echo_stack(FaultConfig::default());
    let mut peer = SocketManager::new(config(CLIENT_IP));
    let udp = peer.create(Protocol::Udp);
    peer.sendto(udp, b"ping", server_addr(7)).unwrap();

    exchange(&mut stack, &wire, &mut peer);
    let (reply, from) = peer.try_recvfrom(udp).unwrap().unwrap();
    assert_eq!(reply, b"ping");
    assert_eq!(from, server_addr(7));
}

/// Corrupted frames are discarded by checksum and never stop the loop.
#[test]
fn stack_discards_corrupted_frames() {
    let faults = FaultConfig {
        corrupt_rate: 1.0,
        ..FaultConfig::default()
    };
    let (mut stack, wire) = echo_stack(faults);
    let mut peer = SocketManager::new(config(CLIENT_IP));
    let client = peer.create(Protocol::Tcp);
    let mut connecting = peer.connect(client, server_addr(7));

    exchange(&mut stack, &wire, &mut peer);
    assert!(connecting.try_take().is_none());
    assert_eq!(stack.sockets().connection_count(), 0);
    assert_eq!(stack.loop_state(), LoopState::Listening);
}

#[test]
fn stack_stops_from_handle() {
    let (mut stack, _wire) = echo_stack(FaultConfig::default());
    let handle = stack.stop_handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        handle.stop().unwrap();
    });
    stack.run().unwrap();
    stopper.join().unwrap();
    assert_eq!(stack.loop_state(), LoopState::Stopped);
}

/// A device that reports TAP mode and counts reads.
struct TapDevice {
    reads: Rc<Cell<u32>>,
}

impl Device for TapDevice {
    fn name(&self) -> &str {
        "tap0"
    }

    fn mode(&self) -> DeviceMode {
        DeviceMode::Tap
    }

    fn raw_fd(&self) -> RawFd {
        -1
    }

    fn read_frame(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        self.reads.set(self.reads.get() + 1);
        Ok(0)
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        Ok(frame.len())
    }
}

#[test]
fn stack_rejects_tap_devices() {
    let reads = Rc::new(Cell::new(0));
    let device = TapDevice {
        reads: Rc::clone(&reads),
    };
    let err = Stack::new(device, config(SERVER_IP)).err().unwrap();
    assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    assert_eq!(reads.get(), 0);
}
