//! Listening TCP socket.
//!
//! The accept loop produces one independent peer context per accepted
//! client; each peer reuses the stream driver (own write queue, own
//! outstanding-bytes accounting, own closed state). Closing the server tears
//! down every live peer before the listener's own `closed()` fires.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tracing::{debug, trace, warn};

use crate::error::{NetError, Result};
use crate::event::Readiness;
use crate::handler::{ChannelDriver, DriverStatus, LoopCtx};
use crate::net::config::SocketConfig;
use crate::net::queue::WriteEntry;
use crate::net::stream::StreamDriver;
use crate::net::traits::{Address, Connecting, Listener, Listening, SendCallback};
use crate::reactor::{Core, EventLoop, LoopJob, Task};

const ACCEPT_BACKLOG: i32 = 1024;

const STATE_NEW: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

pub struct TcpServer {
    ev: EventLoop,
    token: Token,
    bind: SocketAddr,
    config: SocketConfig,
    state: Arc<AtomicU8>,
}

impl TcpServer {
    pub fn new(ev: &EventLoop, bind: SocketAddr, config: SocketConfig) -> Self {
        TcpServer {
            ev: ev.clone(),
            token: ev.next_token(),
            bind,
            config,
            state: Arc::new(AtomicU8::new(STATE_NEW)),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind
    }
}

impl Listening for TcpServer {
    /// Binds the listening channel and starts accepting. The actual bound
    /// address (ephemeral ports included) arrives via `cb.connected`.
    fn listen(&self, cb: Box<dyn Listener>) -> Result<()> {
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
        let job = ListenJob {
            token: self.token,
            bind: self.bind,
            config: self.config.clone(),
            ev: self.ev.clone(),
            state: Arc::clone(&self.state),
            cb,
        };
        let _ = self.ev.submit(Task::Setup(Box::new(job)));
        Ok(())
    }

    fn close(&self) {
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev == STATE_STARTED {
            let _ = self.ev.submit(Task::Close { token: self.token });
        }
    }
}

/// Write/close handle for one accepted peer, given to the supervising
/// [`Listener`] when the peer arrives.
#[derive(Clone)]
pub struct ServerPeer {
    ev: EventLoop,
    token: Token,
    peer: SocketAddr,
}

impl ServerPeer {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Connecting for ServerPeer {
    fn send(&self, _dest: Option<Address>, payload: Option<Bytes>, cb: Box<dyn SendCallback>) {
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

    fn close(&self) {
        let _ = self.ev.submit(Task::Close { token: self.token });
    }
}

struct ListenJob {
    token: Token,
    bind: SocketAddr,
    config: SocketConfig,
    ev: EventLoop,
    state: Arc<AtomicU8>,
    cb: Box<dyn Listener>,
}

impl LoopJob for ListenJob {
    fn run(self: Box<Self>, core: &mut Core) {
        let ListenJob {
            token,
            bind,
            config,
            ev,
            state,
            mut cb,
        } = *self;
        // A close that raced the listen is already queued as a no-op Close
        // task; honor it here instead of binding.
        if state.load(Ordering::Acquire) == STATE_CLOSED {
            cb.closed();
            return;
        }
        let mut listener = match open_listener(&config, bind) {
            Ok(listener) => listener,
            Err(e) => {
                cb.failed(NetError::Io(e));
                return;
            }
        };
        let local = match listener.local_addr() {
            Ok(local) => local,
            Err(e) => {
                cb.failed(NetError::Io(e));
                return;
            }
        };
        if let Err(e) = core.registry().register(&mut listener, token, Interest::READABLE) {
            cb.failed(NetError::Io(e));
            return;
        }
        debug!(%local, "listening");
        cb.connected(local);
        core.install(
            token,
            Box::new(ListenerDriver {
                token,
                listener,
                cb,
                children: Rc::new(RefCell::new(HashSet::new())),
                ev,
                config,
            }),
        );
    }

    fn cancel(self: Box<Self>) {
        let mut cb = self.cb;
        cb.failed(NetError::LoopClosed);
    }
}

struct ListenerDriver {
    token: Token,
    listener: TcpListener,
    cb: Box<dyn Listener>,
    /// Tokens of all live accepted peers; peers remove themselves on close.
    children: Rc<RefCell<HashSet<Token>>>,
    ev: EventLoop,
    config: SocketConfig,
}

impl ChannelDriver for ListenerDriver {
    fn ready(&mut self, ctx: &mut LoopCtx<'_>, readiness: Readiness) -> DriverStatus {
        if !readiness.readable {
            return DriverStatus::Open;
        }
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = self.ev.next_token();
                    let handle = ServerPeer {
                        ev: self.ev.clone(),
                        token,
                        peer,
                    };
                    let mut conn = self.cb.connecting(peer, handle);
                    configure_peer(&stream, &self.config);
                    if let Err(e) = ctx.registry.register(&mut stream, token, Interest::READABLE)
                    {
                        conn.failed(NetError::Io(e));
                        continue;
                    }
                    let mut driver = StreamDriver::accepted(
                        token,
                        stream,
                        conn,
                        &self.config,
                        Rc::clone(&self.children),
                    );
                    driver.announce_connected(peer);
                    self.children.borrow_mut().insert(token);
                    ctx.channels.insert(token, Box::new(driver));
                    debug!(%peer, token = token.0, "accepted");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return DriverStatus::Open,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // The client vanished between readiness and accept.
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed; listener stays up");
                    return DriverStatus::Open;
                }
            }
        }
    }

    fn enqueue(&mut self, _ctx: &mut LoopCtx<'_>, entry: WriteEntry) -> DriverStatus {
        entry.fail(NetError::NotConnected);
        DriverStatus::Open
    }

    fn close(&mut self, ctx: &mut LoopCtx<'_>) {
        // Peers first, listener callback last.
        let peers: Vec<Token> = self.children.borrow_mut().drain().collect();
        for token in peers {
            if let Some(mut driver) = ctx.channels.remove(&token) {
                driver.close(ctx);
            }
        }
        if let Err(e) = ctx.registry.deregister(&mut self.listener) {
            trace!(error = %e, "listener deregister failed");
        }
        debug!(token = self.token.0, "listener closed");
        self.cb.closed();
    }
}

fn open_listener(config: &SocketConfig, bind: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(bind), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    if config.recv_buffer_size > 0 {
        socket.set_recv_buffer_size(config.recv_buffer_size)?;
    }
    if config.send_buffer_size > 0 {
        socket.set_send_buffer_size(config.send_buffer_size)?;
    }
    socket.bind(&bind.into())?;
    socket.listen(ACCEPT_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Applies stream options to an accepted peer; option failures are logged,
/// never fatal to the connection.
fn configure_peer(stream: &TcpStream, config: &SocketConfig) {
    if let Err(e) = stream.set_nodelay(config.no_delay) {
        trace!(error = %e, "set_nodelay failed");
    }
    let sock = SockRef::from(stream);
    if let Some(idle) = config.keep_alive {
        if let Err(e) = sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle)) {
            trace!(error = %e, "set_tcp_keepalive failed");
        }
    }
    if config.recv_buffer_size > 0 {
        if let Err(e) = sock.set_recv_buffer_size(config.recv_buffer_size) {
            trace!(error = %e, "set_recv_buffer_size failed");
        }
    }
    if config.send_buffer_size > 0 {
        if let Err(e) = sock.set_send_buffer_size(config.send_buffer_size) {
            trace!(error = %e, "set_send_buffer_size failed");
        }
    }
}
