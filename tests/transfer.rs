//! Integration tests for data transfer, teardown, and datagrams.

mod common;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use common::{config, server_addr, Link, CLIENT_IP, SERVER_IP};
use tun_tcpip::connection::{FourTuple, ReadOutcome};
use tun_tcpip::packet::{self, flags, Ipv4Header, TcpHeader, TcpSegment};
use tun_tcpip::socket::{Protocol, SocketError, SocketEvent};
use tun_tcpip::socket_manager::{Disposition, DropReason};
use tun_tcpip::state::TcpState;

fn tcp_of(frame: &[u8]) -> (TcpHeader, Vec<u8>) {
    let (_, segment) = Ipv4Header::decode(frame).unwrap();
    let (h, payload) = TcpHeader::decode(segment).unwrap();
    (h, payload.to_vec())
}

// ---------------------------------------------------------------------------
// Stream data
// ---------------------------------------------------------------------------

#[test]
fn data_flows_in_both_directions() {
    let mut link = Link::new();
    let listener = link.listen(80, 5);
    let (client, server) = link.connect(listener, 80);
    link.server.take_events();

    assert_eq!(link.client.send(client, b"Hello Server"), Ok(12));
    link.settle();
    assert_eq!(link.server.take_events(), vec![SocketEvent::Readable(server)]);
    assert_eq!(
        link.server.read(server, 1024),
        Ok(ReadOutcome::Data(b"Hello Server".to_vec()))
    );
    assert_eq!(link.server.read(server, 1024), Ok(ReadOutcome::WouldBlock));

    link.server.send(server, b"Hello Client").unwrap();
    link.settle();
    let mut reply = link.client.recv(client, 12);
    assert_eq!(reply.try_take(), Some(Ok(b"Hello Client".to_vec())));
}

/// Payloads larger than the MSS leave as several segments and arrive whole.
#[test]
fn large_send_is_segmented_by_mss() {
    let mut client_cfg = config(CLIENT_IP);
    client_cfg.mss = 4;
    let mut link = Link::with_configs(client_cfg, config(SERVER_IP));
    let listener = link.listen(80, 5);
    let (client, server) = link.connect(listener, 80);

    link.client.send(client, b"Hello Server").unwrap();
    let frames = link.client.drain_outbound();
    assert_eq!(frames.len(), 3);
    let seqs: Vec<u32> = frames.iter().map(|f| tcp_of(f).0.seq).collect();
    assert_eq!(seqs[1], seqs[0].wrapping_add(4));
    assert_eq!(seqs[2], seqs[0].wrapping_add(8));

    for frame in &frames {
        assert!(link.server.dispatch(frame).is_delivered());
    }
    link.settle();
    assert_eq!(
        link.server.read(server, 64),
        Ok(ReadOutcome::Data(b"Hello Server".to_vec()))
    );
}

/// `recv(n)` stays pending until `n` bytes are buffered.
#[test]
fn recv_waits_for_requested_bytes() {
    let mut link = Link::new();
    let listener = link.listen(80, 5);
    let (client, server) = link.connect(listener, 80);

    let mut pending = link.server.recv(server, 5);
    link.client.send(client, b"abc").unwrap();
    link.settle();
    assert!(pending.try_take().is_none());

    link.client.send(client, b"defg").unwrap();
    link.settle();
    assert_eq!(pending.try_take(), Some(Ok(b"abcde".to_vec())));
    assert_eq!(
        link.server.read(server, 10),
        Ok(ReadOutcome::Data(b"fg".to_vec()))
    );
}

/// A second outstanding `recv` replaces the first.
#[test]
fn second_recv_replaces_first() {
    let mut link = Link::new();
    let listener = link.listen(80, 5);
    let (client, server) = link.connect(listener, 80);

    let mut first = link.server.recv(server, 4);
    let mut second = link.server.recv(server, 4);
    assert_eq!(first.try_take(), Some(Err(SocketError::Closed)));

    link.client.send(client, b"data").unwrap();
    link.settle();
    assert_eq!(second.try_take(), Some(Ok(b"data".to_vec())));
}

/// A peer that ignores the advertised window gets only the window's worth
/// of bytes buffered and acknowledged.
#[test]
fn receiver_takes_no_more_than_its_window() {
    let mut server_cfg = config(SERVER_IP);
    server_cfg.window = 16;
    let mut link = Link::with_configs(config(CLIENT_IP), server_cfg);
    let listener = link.listen(80, 5);
    let (client, server) = link.connect(listener, 80);

    link.client.send(client, &[7u8; 1000]).unwrap();
    let frames = link.client.drain_outbound();
    assert_eq!(frames.len(), 1);
    let data_seq = tcp_of(&frames[0]).0.seq;
    assert!(link.server.dispatch(&frames[0]).is_delivered());

    let acks = link.server.drain_outbound();
    assert_eq!(acks.len(), 1);
    let (ack, _) = tcp_of(&acks[0]);
    assert_eq!(ack.ack, data_seq.wrapping_add(16));
    assert_eq!(ack.window, 0);
    for frame in &acks {
        link.client.dispatch(frame);
    }
    link.settle();

    assert_eq!(
        link.server.read(server, 2048),
        Ok(ReadOutcome::Data(vec![7u8; 16]))
    );
    assert_eq!(link.server.read(server, 2048), Ok(ReadOutcome::WouldBlock));
}

/// A segment beyond RCV.NXT is discarded and answered with a duplicate ACK.
#[test]
fn out_of_order_data_gets_duplicate_ack() {
    let mut link = Link::new();
    let listener = link.listen(80, 5);
    let (client, server) = link.connect(listener, 80);
    let client_port = link.client.get(client).unwrap().local.unwrap().port();

    link.client.send(client, b"a").unwrap();
    let frame = link.client.drain_outbound().remove(0);
    let (sent, _) = tcp_of(&frame);
    link.server.dispatch(&frame);
    let (ack, _) = tcp_of(&link.server.drain_outbound()[0]);
    assert_eq!(ack.ack, sent.seq.wrapping_add(1));

    let gap = TcpSegment {
        header: TcpHeader::new(
            client_port,
            80,
            sent.seq.wrapping_add(101),
            sent.ack,
            flags::PSH | flags::ACK,
            65535,
        ),
        payload: b"late".to_vec(),
    };
    let frame = packet::build_tcp_frame(CLIENT_IP, SERVER_IP, &gap, 9, 64);
    assert!(link.server.dispatch(&frame).is_delivered());

    let (dup, _) = tcp_of(&link.server.drain_outbound()[0]);
    assert_eq!(dup.flags, flags::ACK);
    assert_eq!(dup.ack, ack.ack);
    assert_eq!(
        link.server.read(server, 64),
        Ok(ReadOutcome::Data(b"a".to_vec()))
    );
    assert_eq!(link.server.read(server, 64), Ok(ReadOutcome::WouldBlock));
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

/// Active close walks FIN_WAIT_1 → FIN_WAIT_2 → TIME_WAIT and lingers until
/// the timer fires; the passive side walks CLOSE_WAIT → LAST_ACK → CLOSED.
#[test]
fn orderly_teardown_lingers_in_time_wait() {
    let mut link = Link::new();
    let listener = link.listen(80, 5);
    let (client, server) = link.connect(listener, 80);
    let key = FourTuple::new(link.client.get(client).unwrap().local.unwrap(), server_addr(80));
    link.server.take_events();

    link.client.close(client);
    assert_eq!(link.client.connection_state(&key), Some(TcpState::FinWait1));
    link.settle();
    assert_eq!(link.client.connection_state(&key), Some(TcpState::FinWait2));
    assert_eq!(link.server.get(server).unwrap().state, Some(TcpState::CloseWait));
    assert_eq!(link.server.take_events(), vec![SocketEvent::PeerClosed(server)]);
    assert_eq!(link.server.read(server, 64), Ok(ReadOutcome::Eof));

    link.server.close(server);
    link.settle();
    assert_eq!(link.client.connection_state(&key), Some(TcpState::TimeWait));
    assert_eq!(link.server.connection_count(), 0);

    // Nothing is released before the linger ends.
    assert!(link.client.next_deadline().is_some());
    assert_eq!(link.client.poll_timers(Instant::now()), 0);
    assert_eq!(
        link.client.poll_timers(Instant::now() + Duration::from_secs(61)),
        1
    );
    assert_eq!(link.client.connection_count(), 0);
    assert!(link.client.next_deadline().is_none());
}

/// Both sides closing at once meet in CLOSING and then TIME_WAIT.
#[test]
fn simultaneous_close_passes_through_closing() {
    let mut link = Link::new();
    let listener = link.listen(80, 5);
    let (client, server) = link.connect(listener, 80);
    let client_local = link.client.get(client).unwrap().local.unwrap();
    let client_key = FourTuple::new(client_local, server_addr(80));
    let server_key = FourTuple::new(server_addr(80), client_local);

    link.client.close(client);
    link.server.close(server);
    let to_server = link.client.drain_outbound();
    let to_client = link.server.drain_outbound();
    link.server.dispatch(&to_server[0]);
    link.client.dispatch(&to_client[0]);
    assert_eq!(link.client.connection_state(&client_key), Some(TcpState::Closing));
    assert_eq!(link.server.connection_state(&server_key), Some(TcpState::Closing));

    link.settle();
    assert_eq!(link.client.connection_state(&client_key), Some(TcpState::TimeWait));
    assert_eq!(link.server.connection_state(&server_key), Some(TcpState::TimeWait));
}

/// After the peer's FIN, a pending `recv` drains data and then reports EOF
/// as an empty buffer.
#[test]
fn recv_after_peer_fin_reports_end_of_stream() {
    let mut link = Link::new();
    let listener = link.listen(80, 5);
    let (client, server) = link.connect(listener, 80);

    link.client.send(client, b"bye").unwrap();
    link.client.close(client);
    link.settle();

    let mut first = link.server.recv(server, 100);
    assert_eq!(first.try_take(), Some(Ok(b"bye".to_vec())));
    let mut second = link.server.recv(server, 100);
    assert_eq!(second.try_take(), Some(Ok(Vec::new())));
    assert!(matches!(
        link.server.send(server, b"late"),
        Err(SocketError::InvalidState(_))
    ));
}

/// An acceptable RST closes the connection and fails pending waiters.
#[test]
fn reset_fails_pending_recv() {
    let mut link = Link::new();
    let listener = link.listen(80, 5);
    let (client, _server) = link.connect(listener, 80);
    let client_port = link.client.get(client).unwrap().local.unwrap().port();
    link.client.take_events();

    // The server's ACK carries its current send sequence number.
    link.client.send(client, b"ping").unwrap();
    for frame in link.client.drain_outbound() {
        link.server.dispatch(&frame);
    }
    let ack_frame = link.server.drain_outbound().remove(0);
    let (ack, _) = tcp_of(&ack_frame);
    link.client.dispatch(&ack_frame);

    let mut pending = link.client.recv(client, 10);
    let rst = |seq: u32| TcpSegment {
        header: TcpHeader::new(80, client_port, seq, 0, flags::RST, 0),
        payload: Vec::new(),
    };

    // Out-of-window resets are ignored.
    let stale = packet::build_tcp_frame(SERVER_IP, CLIENT_IP, &rst(ack.seq.wrapping_add(1000)), 1, 64);
    link.client.dispatch(&stale);
    assert_eq!(
        link.client.get(client).unwrap().state,
        Some(TcpState::Established)
    );
    assert!(pending.try_take().is_none());

    let frame = packet::build_tcp_frame(SERVER_IP, CLIENT_IP, &rst(ack.seq), 2, 64);
    assert!(link.client.dispatch(&frame).is_delivered());
    assert_eq!(pending.try_take(), Some(Err(SocketError::ConnectionReset)));
    assert_eq!(link.client.take_events(), vec![SocketEvent::Closed(client)]);
    assert_eq!(link.client.send(client, b"x"), Err(SocketError::ConnectionReset));
    assert_eq!(link.client.connection_count(), 0);
}

#[test]
fn send_before_connect_is_rejected() {
    let mut link = Link::new();
    let id = link.client.create(Protocol::Tcp);
    assert_eq!(link.client.send(id, b"x"), Err(SocketError::NotConnected));
    assert!(matches!(
        link.client.recv(id, 1).try_take(),
        Some(Err(SocketError::NotConnected))
    ));
}

// ---------------------------------------------------------------------------
// Datagrams
// ---------------------------------------------------------------------------

fn udp_server(link: &mut Link, port: u16) -> tun_tcpip::socket::SocketId {
    let id = link.server.create(Protocol::Udp);
    link.server
        .bind(id, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        .unwrap();
    id
}

#[test]
fn datagrams_are_delivered_with_source() {
    let mut link = Link::new();
    let server = udp_server(&mut link, 53);
    let client = link.client.create(Protocol::Udp);

    link.client.sendto(client, b"query", server_addr(53)).unwrap();
    link.settle();
    assert_eq!(link.server.take_events(), vec![SocketEvent::Datagram(server)]);

    let from = link.client.get(client).unwrap().local.unwrap();
    let (data, source) = link.server.try_recvfrom(server).unwrap().unwrap();
    assert_eq!(data, b"query");
    assert_eq!(source.port(), from.port());
    assert_eq!(*source.ip(), CLIENT_IP);

    // Reply straight back to the source.
    link.server.sendto(server, b"answer", source).unwrap();
    link.settle();
    let (reply, replier) = link.client.try_recvfrom(client).unwrap().unwrap();
    assert_eq!(reply, b"answer");
    assert_eq!(replier, server_addr(53));
}

#[test]
fn datagrams_from_two_peers_keep_arrival_order() {
    let mut link = Link::new();
    let server = udp_server(&mut link, 53);
    let a = link.client.create(Protocol::Udp);
    let b = link.client.create(Protocol::Udp);

    link.client.sendto(a, b"one", server_addr(53)).unwrap();
    link.client.sendto(b, b"two", server_addr(53)).unwrap();
    link.client.sendto(a, b"three", server_addr(53)).unwrap();
    link.settle();

    let mut peers = link.server.udp_peers(server).unwrap();
    peers.sort_by_key(|(_, queued)| *queued);
    assert_eq!(peers.iter().map(|(_, q)| *q).collect::<Vec<_>>(), vec![1, 2]);

    let order: Vec<Vec<u8>> = std::iter::from_fn(|| link.server.try_recvfrom(server).unwrap())
        .map(|(data, _)| data)
        .collect();
    assert_eq!(order, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
}

#[test]
fn full_peer_queue_drops_datagrams() {
    let mut server_cfg = config(SERVER_IP);
    server_cfg.udp_queue_depth = 2;
    let mut link = Link::with_configs(config(CLIENT_IP), server_cfg);
    let server = udp_server(&mut link, 53);
    let client = link.client.create(Protocol::Udp);

    for payload in [b"1", b"2", b"3"] {
        link.client.sendto(client, payload, server_addr(53)).unwrap();
    }
    link.settle();
    assert_eq!(
        link.server_log,
        vec![
            Disposition::Delivered,
            Disposition::Delivered,
            Disposition::Dropped(DropReason::QueueFull),
        ]
    );
    assert_eq!(link.server.try_recvfrom(server).unwrap().unwrap().0, b"1");
}

#[tokio::test]
async fn recvfrom_waiter_takes_datagram_directly() {
    let mut link = Link::new();
    let server = udp_server(&mut link, 53);
    let waiting = link.server.recvfrom(server);
    let client = link.client.create(Protocol::Udp);

    link.client.sendto(client, b"ping", server_addr(53)).unwrap();
    link.settle();

    let (data, _) = waiting.await.unwrap();
    assert_eq!(data, b"ping");
    assert!(link.server.take_events().is_empty());
    assert_eq!(link.server.try_recvfrom(server), Ok(None));
}
