//! End-to-end TCP tests over the loopback interface: an in-process echo
//! server accepts real connections from in-process clients, all driven by a
//! single event loop.

mod common;

use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use millrace::prelude::*;
use millrace::NetMetrics;

use common::{expect_closed, expect_connected, probe, recv_until, ConnEvent, WAIT};

#[derive(Debug)]
enum ServerEvent {
    Bound(SocketAddr),
    PeerUp,
    PeerClosed,
    ListenerClosed,
}

/// Per-peer connection that writes every received chunk straight back.
struct EchoPeer {
    handle: ServerPeer,
    tx: Sender<ServerEvent>,
}

impl Connection for EchoPeer {
    fn connected(&mut self, _addr: Option<SocketAddr>) {
        let _ = self.tx.send(ServerEvent::PeerUp);
    }

    fn received(&mut self, _from: Option<SocketAddr>, data: Bytes) {
        self.handle
            .send(None, Some(data), Box::new(|_result: Result<()>| {}));
    }

    fn failed(&mut self, _err: NetError) {}

    fn closed(&mut self) {
        let _ = self.tx.send(ServerEvent::PeerClosed);
    }
}

struct EchoListener {
    tx: Sender<ServerEvent>,
}

impl Listener for EchoListener {
    fn connected(&mut self, local: SocketAddr) {
        let _ = self.tx.send(ServerEvent::Bound(local));
    }

    fn connecting(&mut self, _peer: SocketAddr, sender: ServerPeer) -> Box<dyn Connection> {
        Box::new(EchoPeer {
            handle: sender,
            tx: self.tx.clone(),
        })
    }

    fn failed(&mut self, err: NetError) {
        panic!("listener failed: {err}");
    }

    fn closed(&mut self) {
        let _ = self.tx.send(ServerEvent::ListenerClosed);
    }
}

fn start_echo_server(
    ev: &EventLoop,
    config: SocketConfig,
) -> (TcpServer, SocketAddr, Receiver<ServerEvent>) {
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(ev, bind, config);
    let (tx, rx) = mpsc::channel();
    server.listen(Box::new(EchoListener { tx })).unwrap();
    let local = match rx.recv_timeout(WAIT).expect("listener never bound") {
        ServerEvent::Bound(local) => local,
        other => panic!("expected bound, got {other:?}"),
    };
    (server, local, rx)
}

fn send_probe(
    client: &impl Connecting,
    payload: &'static [u8],
) -> Receiver<Result<()>> {
    let (tx, rx) = mpsc::channel();
    client.send(
        None,
        Some(Bytes::from_static(payload)),
        Box::new(move |result: Result<()>| {
            let _ = tx.send(result);
        }),
    );
    rx
}

#[test]
fn echo_roundtrip() {
    let ev = EventLoop::new().unwrap();
    let (server, addr, _server_rx) = start_echo_server(&ev, SocketConfig::default());

    let client = TcpClient::new(&ev, addr, SocketConfig::default());
    let (conn, rx) = probe();
    client.connect(conn).unwrap();
    assert_eq!(expect_connected(&rx), Some(addr));

    let sent = send_probe(&client, b"hello");
    assert!(sent.recv_timeout(WAIT).unwrap().is_ok());
    assert_eq!(&recv_until(&rx, 5)[..], b"hello");

    client.close();
    expect_closed(&rx);
    server.close();
    ev.close();
    ev.join();
}

#[test]
fn send_callbacks_resolve_in_fifo_order() {
    let ev = EventLoop::new().unwrap();
    let (server, addr, _server_rx) = start_echo_server(&ev, SocketConfig::default());

    let client = TcpClient::new(&ev, addr, SocketConfig::default());
    let (conn, rx) = probe();
    client.connect(conn).unwrap();
    expect_connected(&rx);

    let (tx, outcomes) = mpsc::channel();
    for i in 0..5u32 {
        let tx = tx.clone();
        client.send(
            None,
            Some(Bytes::from(vec![i as u8; 16])),
            Box::new(move |result: Result<()>| {
                let _ = tx.send((i, result.is_ok()));
            }),
        );
    }
    let order: Vec<(u32, bool)> = (0..5)
        .map(|_| outcomes.recv_timeout(WAIT).unwrap())
        .collect();
    assert_eq!(order, vec![(0, true), (1, true), (2, true), (3, true), (4, true)]);

    client.close();
    server.close();
    ev.close();
    ev.join();
}

#[test]
fn write_ceiling_is_advisory_on_streams() {
    let metrics = Arc::new(NetMetrics::new());
    let ev = EventLoop::new().unwrap();
    let (server, addr, _server_rx) = start_echo_server(&ev, SocketConfig::default());

    let config = SocketConfig::builder()
        .write_ceiling(1)
        .metrics(Arc::clone(&metrics))
        .build();
    let client = TcpClient::new(&ev, addr, config);
    let (conn, rx) = probe();
    client.connect(conn).unwrap();
    expect_connected(&rx);

    // Both writes blow past the 1-byte ceiling yet must still complete.
    let first = send_probe(&client, &[1u8; 10]);
    let second = send_probe(&client, &[2u8; 10]);
    assert!(first.recv_timeout(WAIT).unwrap().is_ok());
    assert!(second.recv_timeout(WAIT).unwrap().is_ok());

    // The connection stays usable and the overrun was recorded.
    assert_eq!(recv_until(&rx, 20).len(), 20);
    assert!(metrics.outstanding_high_water() >= 10);

    client.close();
    server.close();
    ev.close();
    ev.join();
}

#[test]
fn graceful_close_flushes_then_rejects_later_sends() {
    let ev = EventLoop::new().unwrap();
    let (server, addr, _server_rx) = start_echo_server(&ev, SocketConfig::default());

    let client = TcpClient::new(&ev, addr, SocketConfig::default());
    let (conn, rx) = probe();
    client.connect(conn).unwrap();
    expect_connected(&rx);

    let (tx, outcomes) = mpsc::channel();
    for (tag, payload) in [
        (1u32, Some(Bytes::from_static(b"flush me"))),
        (2, None), // graceful-close sentinel
        (3, Some(Bytes::from_static(b"too late"))),
    ] {
        let tx = tx.clone();
        client.send(
            None,
            payload,
            Box::new(move |result: Result<()>| {
                let _ = tx.send((tag, result));
            }),
        );
    }

    let (tag, result) = outcomes.recv_timeout(WAIT).unwrap();
    assert_eq!(tag, 1);
    assert!(result.is_ok());
    let (tag, result) = outcomes.recv_timeout(WAIT).unwrap();
    assert_eq!(tag, 2);
    assert!(result.is_ok());
    let (tag, result) = outcomes.recv_timeout(WAIT).unwrap();
    assert_eq!(tag, 3);
    assert!(matches!(result, Err(NetError::Closed)));

    server.close();
    ev.close();
    ev.join();
}

#[test]
fn server_close_tears_down_peers_before_listener() {
    let ev = EventLoop::new().unwrap();
    let (server, addr, server_rx) = start_echo_server(&ev, SocketConfig::default());

    let mut clients = Vec::new();
    for _ in 0..3 {
        let client = TcpClient::new(&ev, addr, SocketConfig::default());
        let (conn, rx) = probe();
        client.connect(conn).unwrap();
        expect_connected(&rx);
        clients.push((client, rx));
    }
    for _ in 0..3 {
        match server_rx.recv_timeout(WAIT).unwrap() {
            ServerEvent::PeerUp => {}
            other => panic!("expected peer up, got {other:?}"),
        }
    }

    server.close();
    let order: Vec<ServerEvent> = (0..4)
        .map(|_| server_rx.recv_timeout(WAIT).unwrap())
        .collect();
    for event in &order[..3] {
        assert!(matches!(event, ServerEvent::PeerClosed), "got {event:?}");
    }
    assert!(matches!(order[3], ServerEvent::ListenerClosed));

    // Each client observes the orderly end-of-stream as closed().
    for (_client, rx) in &clients {
        expect_closed(rx);
    }

    ev.close();
    ev.join();
}

#[test]
fn close_racing_connect_reports_closed_not_connected() {
    let ev = EventLoop::new().unwrap();
    let (server, addr, _server_rx) = start_echo_server(&ev, SocketConfig::default());

    // Park the loop so the close lands before the setup job runs.
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    ev.execute(move || {
        let _ = gate_rx.recv_timeout(WAIT);
    })
    .unwrap();

    let client = TcpClient::new(&ev, addr, SocketConfig::default());
    let (conn, rx) = probe();
    client.connect(conn).unwrap();
    client.close();
    gate_tx.send(()).unwrap();

    // The terminal callback must be closed(); connected() would mean the
    // already-closed handle went on to establish a connection.
    expect_closed(&rx);
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    server.close();
    ev.close();
    ev.join();
}

#[test]
fn close_racing_listen_reports_closed_not_bound() {
    let ev = EventLoop::new().unwrap();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    ev.execute(move || {
        let _ = gate_rx.recv_timeout(WAIT);
    })
    .unwrap();

    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(&ev, bind, SocketConfig::default());
    let (tx, rx) = mpsc::channel();
    server.listen(Box::new(EchoListener { tx })).unwrap();
    server.close();
    gate_tx.send(()).unwrap();

    match rx.recv_timeout(WAIT).unwrap() {
        ServerEvent::ListenerClosed => {}
        other => panic!("expected listener closed, got {other:?}"),
    }
    ev.close();
    ev.join();
}

#[test]
fn resolve_failure_is_reported_on_the_loop_thread() {
    struct ThreadProbe {
        tx: Sender<(Option<String>, NetError)>,
    }

    impl Connection for ThreadProbe {
        fn connected(&mut self, _addr: Option<SocketAddr>) {}
        fn received(&mut self, _from: Option<SocketAddr>, _data: Bytes) {}
        fn failed(&mut self, err: NetError) {
            let name = std::thread::current().name().map(String::from);
            let _ = self.tx.send((name, err));
        }
        fn closed(&mut self) {}
    }

    let ev = EventLoop::new().unwrap();
    let client = TcpClient::new(
        &ev,
        Address::host("no-such-host.invalid", 1),
        SocketConfig::default(),
    );
    let (tx, rx) = mpsc::channel();
    client.connect(Box::new(ThreadProbe { tx })).unwrap();

    let (name, err) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(name.as_deref(), Some("millrace-loop"));
    assert!(matches!(err, NetError::Resolve(_)));
    ev.close();
    ev.join();
}

#[test]
fn close_delivers_closed_at_most_once() {
    let ev = EventLoop::new().unwrap();
    let (server, addr, _server_rx) = start_echo_server(&ev, SocketConfig::default());

    let client = TcpClient::new(&ev, addr, SocketConfig::default());
    let (conn, rx) = probe();
    client.connect(conn).unwrap();
    expect_connected(&rx);

    client.close();
    client.close();
    expect_closed(&rx);
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    server.close();
    ev.close();
    ev.join();
}

#[test]
fn connect_refused_surfaces_through_failed() {
    let ev = EventLoop::new().unwrap();
    // Bind and immediately drop a listener to obtain a port nobody serves.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let client = TcpClient::new(&ev, addr, SocketConfig::default());
    let (conn, rx) = probe();
    client.connect(conn).unwrap();

    match rx.recv_timeout(WAIT).unwrap() {
        ConnEvent::Failed(NetError::Io(e)) => {
            assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused)
        }
        other => panic!("expected refused, got {other:?}"),
    }
    ev.close();
    ev.join();
}
