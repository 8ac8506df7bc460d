#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use millrace::prelude::*;

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum ConnEvent {
    Connected(Option<SocketAddr>),
    Received(Option<SocketAddr>, Bytes),
    Failed(NetError),
    Closed,
}

/// Connection that forwards every callback into a channel the test thread
/// can block on.
pub struct Probe {
    tx: Sender<ConnEvent>,
}

impl Connection for Probe {
    fn connected(&mut self, addr: Option<SocketAddr>) {
        let _ = self.tx.send(ConnEvent::Connected(addr));
    }

    fn received(&mut self, from: Option<SocketAddr>, data: Bytes) {
        let _ = self.tx.send(ConnEvent::Received(from, data));
    }

    fn failed(&mut self, err: NetError) {
        let _ = self.tx.send(ConnEvent::Failed(err));
    }

    fn closed(&mut self) {
        let _ = self.tx.send(ConnEvent::Closed);
    }
}

pub fn probe() -> (Box<dyn Connection>, Receiver<ConnEvent>) {
    init_tracing();
    let (tx, rx) = mpsc::channel();
    (Box::new(Probe { tx }), rx)
}

/// Installs a subscriber honoring `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn expect_connected(rx: &Receiver<ConnEvent>) -> Option<SocketAddr> {
    match rx.recv_timeout(WAIT).expect("no connected event") {
        ConnEvent::Connected(addr) => addr,
        other => panic!("expected connected, got {other:?}"),
    }
}

pub fn expect_closed(rx: &Receiver<ConnEvent>) {
    match rx.recv_timeout(WAIT).expect("no closed event") {
        ConnEvent::Closed => {}
        other => panic!("expected closed, got {other:?}"),
    }
}

/// Collects received bytes until `n` have arrived, tolerating chunked
/// delivery on stream sockets.
pub fn recv_until(rx: &Receiver<ConnEvent>, n: usize) -> Bytes {
    let mut out = BytesMut::with_capacity(n);
    while out.len() < n {
        match rx.recv_timeout(WAIT).expect("no received event") {
            ConnEvent::Received(_, data) => out.extend_from_slice(&data),
            other => panic!("expected received, got {other:?}"),
        }
    }
    out.freeze()
}
