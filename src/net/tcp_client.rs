//! Outbound TCP stream socket.
//!
//! The handle is a thin, thread-safe front: `connect`, `send` and `close`
//! all marshal the real work onto the event loop thread and return
//! immediately. Lifecycle: Unconnected -> Connecting -> Connected -> Closed,
//! with a direct Unconnected -> Closed path when `close` races `connect`.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Token};
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

use crate::error::{NetError, Result};
use crate::net::config::SocketConfig;
use crate::net::queue::WriteEntry;
use crate::net::stream::StreamDriver;
use crate::net::traits::{Address, Connecting, Connection, SendCallback};
use crate::net::FailJob;
use crate::reactor::{Core, EventLoop, LoopJob, Task};

const STATE_NEW: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

pub struct TcpClient {
    ev: EventLoop,
    token: Token,
    peer: Address,
    config: SocketConfig,
    state: Arc<AtomicU8>,
}

impl TcpClient {
    pub fn new(ev: &EventLoop, peer: impl Into<Address>, config: SocketConfig) -> Self {
        TcpClient {
            ev: ev.clone(),
            token: ev.next_token(),
            peer: peer.into(),
            config,
            state: Arc::new(AtomicU8::new(STATE_NEW)),
        }
    }

    pub fn peer(&self) -> &Address {
        &self.peer
    }

    /// Starts the non-blocking connect. Rejects a second call and a call
    /// after `close`; every later outcome (including setup failure) arrives
    /// through `conn`.
    pub fn connect(&self, conn: Box<dyn Connection>) -> Result<()> {
        match self.state.compare_exchange(
            STATE_NEW,
            STATE_STARTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_CLOSED) => return Err(NetError::Closed),
            Err(_) => return Err(NetError::AlreadyConnected),
        }
        let peer = match self.peer.resolve() {
            Ok(peer) => peer,
            Err(e) => {
                let _ = self
                    .ev
                    .submit(Task::Setup(Box::new(FailJob { conn, err: e })));
                return Ok(());
            }
        };
        let job = ConnectJob {
            token: self.token,
            peer,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            conn,
        };
        // A closed loop cancels the job, which fails the callback.
        let _ = self.ev.submit(Task::Setup(Box::new(job)));
        Ok(())
    }
}

impl Connecting for TcpClient {
    fn send(&self, _dest: Option<Address>, payload: Option<Bytes>, cb: Box<dyn SendCallback>) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => cb.failed(NetError::Closed),
            STATE_NEW => cb.failed(NetError::NotConnected),
            _ => {
                let entry = WriteEntry {
                    dest: None,
                    payload,
                    cb,
                };
                let _ = self.ev.submit(Task::Send {
                    token: self.token,
                    entry,
                });
            }
        }
    }

    fn close(&self) {
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev == STATE_STARTED {
            let _ = self.ev.submit(Task::Close { token: self.token });
        }
    }
}

struct ConnectJob {
    token: Token,
    peer: SocketAddr,
    config: SocketConfig,
    state: Arc<AtomicU8>,
    conn: Box<dyn Connection>,
}

impl LoopJob for ConnectJob {
    fn run(self: Box<Self>, core: &mut Core) {
        let ConnectJob {
            token,
            peer,
            config,
            state,
            mut conn,
        } = *self;
        // A close that raced the connect lands in the task queue ahead of
        // this job and finds no driver; honor it here instead.
        if state.load(Ordering::Acquire) == STATE_CLOSED {
            conn.closed();
            return;
        }
        let mut stream = match open_stream(&config, peer) {
            Ok(stream) => stream,
            Err(e) => {
                conn.failed(NetError::Io(e));
                return;
            }
        };
        // Connect completion is reported as writability.
        if let Err(e) = core.registry().register(&mut stream, token, Interest::WRITABLE) {
            conn.failed(NetError::Io(e));
            return;
        }
        core.install(
            token,
            Box::new(StreamDriver::connecting(token, stream, conn, &config)),
        );
    }

    fn cancel(self: Box<Self>) {
        let mut conn = self.conn;
        conn.failed(NetError::LoopClosed);
    }
}

/// Opens a configured non-blocking stream socket and starts the connect.
fn open_stream(config: &SocketConfig, peer: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(peer), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if config.recv_buffer_size > 0 {
        socket.set_recv_buffer_size(config.recv_buffer_size)?;
    }
    if config.send_buffer_size > 0 {
        socket.set_send_buffer_size(config.send_buffer_size)?;
    }
    socket.set_nodelay(config.no_delay)?;
    if let Some(idle) = config.keep_alive {
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }
    if let Some(bind) = config.bind {
        socket.bind(&bind.into())?;
    }
    match socket.connect(&peer.into()) {
        Ok(()) => {}
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Err(e),
    }
    Ok(TcpStream::from_std(socket.into()))
}

#[cfg(unix)]
fn connect_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(windows)]
fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    struct NullConn;

    impl Connection for NullConn {
        fn connected(&mut self, _addr: Option<SocketAddr>) {}
        fn received(&mut self, _from: Option<SocketAddr>, _data: Bytes) {}
        fn failed(&mut self, _err: NetError) {}
        fn closed(&mut self) {}
    }

    #[test]
    fn connect_rejects_second_call() {
        let ev = EventLoop::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = listener.local_addr().unwrap();
        let client = TcpClient::new(&ev, peer, SocketConfig::default());

        client.connect(Box::new(NullConn)).unwrap();
        assert!(matches!(
            client.connect(Box::new(NullConn)),
            Err(NetError::AlreadyConnected)
        ));
        ev.close();
        ev.join();
    }

    #[test]
    fn connect_rejects_after_close() {
        let ev = EventLoop::new().unwrap();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let client = TcpClient::new(&ev, peer, SocketConfig::default());
        client.close();
        assert!(matches!(
            client.connect(Box::new(NullConn)),
            Err(NetError::Closed)
        ));
        ev.close();
        ev.join();
    }

    #[test]
    fn send_before_connect_fails_the_callback() {
        let ev = EventLoop::new().unwrap();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let client = TcpClient::new(&ev, peer, SocketConfig::default());

        let (tx, rx) = mpsc::channel();
        client.send(
            None,
            Some(Bytes::from_static(b"early")),
            Box::new(move |result: Result<()>| {
                tx.send(result).unwrap();
            }),
        );
        assert!(matches!(rx.try_recv(), Ok(Err(NetError::NotConnected))));
        ev.close();
        ev.join();
    }
}
