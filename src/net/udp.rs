//! Connectionless datagram socket.
//!
//! One channel, readiness-driven in both directions, no per-peer state.
//! Every queued write is a complete datagram: the OS either accepts the
//! whole buffer or the entry is failed and discarded, never retried from
//! a partial offset. The outstanding-byte ceiling is a hard drop here
//! (datagrams are discardable), unlike the advisory TCP ceiling.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::buffer::BufferAllocator;
use crate::error::{NetError, Result};
use crate::event::Readiness;
use crate::handler::{ChannelDriver, DriverStatus, LoopCtx};
use crate::metrics::NetMetrics;
use crate::net::config::SocketConfig;
use crate::net::queue::{WriteEntry, WriteQueue};
use crate::net::traits::{Address, Connecting, Connection, SendCallback};
use crate::net::FailJob;
use crate::reactor::{Core, EventLoop, LoopJob, Task};

const STATE_NEW: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

pub struct UdpSocket {
    ev: EventLoop,
    token: Token,
    config: SocketConfig,
    default_peer: Option<Address>,
    state: Arc<AtomicU8>,
}

impl UdpSocket {
    pub fn new(ev: &EventLoop, config: SocketConfig) -> Self {
        UdpSocket {
            ev: ev.clone(),
            token: ev.next_token(),
            config,
            default_peer: None,
            state: Arc::new(AtomicU8::new(STATE_NEW)),
        }
    }

    /// Like [`UdpSocket::new`], with a destination used by sends that pass
    /// no explicit address.
    pub fn with_default_peer(ev: &EventLoop, peer: Address, config: SocketConfig) -> Self {
        UdpSocket {
            default_peer: Some(peer),
            ..UdpSocket::new(ev, config)
        }
    }

    /// Opens and binds the datagram channel. "Connect" means "ready to send
    /// and receive", not a handshake; `conn.connected` carries the bound
    /// local address.
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
        if let Some(peer) = &self.default_peer {
            if let Err(e) = peer.resolve() {
                let _ = self
                    .ev
                    .submit(Task::Setup(Box::new(FailJob { conn, err: e })));
                return Ok(());
            }
        }
        let job = OpenJob {
            token: self.token,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            conn,
        };
        let _ = self.ev.submit(Task::Setup(Box::new(job)));
        Ok(())
    }
}

impl Connecting for UdpSocket {
    fn send(&self, dest: Option<Address>, payload: Option<Bytes>, cb: Box<dyn SendCallback>) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => return cb.failed(NetError::Closed),
            STATE_NEW => return cb.failed(NetError::NotConnected),
            _ => {}
        }
        let target = dest.or_else(|| self.default_peer.clone());
        let resolved = match &target {
            Some(addr) => match addr.resolve() {
                Ok(resolved) => Some(resolved),
                Err(e) => return cb.failed(e),
            },
            None => None,
        };
        if payload.is_some() && resolved.is_none() {
            return cb.failed(NetError::NoDestination);
        }
        let entry = WriteEntry {
            dest: resolved,
            payload,
            cb,
        };
        let _ = self.ev.submit(Task::Send {
            token: self.token,
            entry,
        });
    }

    fn close(&self) {
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev == STATE_STARTED {
            let _ = self.ev.submit(Task::Close { token: self.token });
        }
    }
}

struct OpenJob {
    token: Token,
    config: SocketConfig,
    state: Arc<AtomicU8>,
    conn: Box<dyn Connection>,
}

impl LoopJob for OpenJob {
    fn run(self: Box<Self>, core: &mut Core) {
        let OpenJob {
            token,
            config,
            state,
            mut conn,
        } = *self;
        // A close that raced the open is already queued as a no-op Close
        // task; honor it here instead of binding.
        if state.load(Ordering::Acquire) == STATE_CLOSED {
            conn.closed();
            return;
        }
        let mut socket = match open_socket(&config) {
            Ok(socket) => socket,
            Err(e) => {
                conn.failed(NetError::Io(e));
                return;
            }
        };
        let local = match socket.local_addr() {
            Ok(local) => local,
            Err(e) => {
                conn.failed(NetError::Io(e));
                return;
            }
        };
        if let Err(e) = core.registry().register(&mut socket, token, Interest::READABLE) {
            conn.failed(NetError::Io(e));
            return;
        }
        debug!(%local, token = token.0, "datagram socket open");
        conn.connected(Some(local));
        core.install(
            token,
            Box::new(UdpDriver {
                token,
                socket,
                conn,
                queue: WriteQueue::new(),
                interest: Interest::READABLE,
                write_ceiling: config.write_ceiling,
                allocator: Arc::clone(&config.allocator),
                metrics: Arc::clone(&config.metrics),
            }),
        );
    }

    fn cancel(self: Box<Self>) {
        let mut conn = self.conn;
        conn.failed(NetError::LoopClosed);
    }
}

fn open_socket(config: &SocketConfig) -> io::Result<MioUdpSocket> {
    let bind = config
        .bind
        .unwrap_or_else(|| "0.0.0.0:0".parse().expect("static address"));
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    if config.recv_buffer_size > 0 {
        socket.set_recv_buffer_size(config.recv_buffer_size)?;
    }
    if config.send_buffer_size > 0 {
        socket.set_send_buffer_size(config.send_buffer_size)?;
    }
    socket.bind(&bind.into())?;
    Ok(MioUdpSocket::from_std(socket.into()))
}

enum DatagramStep {
    QueueEmpty,
    Sentinel,
    Sent(usize),
    Blocked,
    Retry,
    EntryFailed(io::Error),
}

struct UdpDriver {
    token: Token,
    socket: MioUdpSocket,
    conn: Box<dyn Connection>,
    queue: WriteQueue,
    interest: Interest,
    write_ceiling: usize,
    allocator: Arc<dyn BufferAllocator>,
    metrics: Arc<NetMetrics>,
}

impl UdpDriver {
    fn read_ready(&mut self, registry: &Registry) -> DriverStatus {
        loop {
            let mut buf = self.allocator.allocate();
            let capacity = buf.len();
            // The OS truncates silently; one spare byte tells an
            // exactly-full datagram apart from a truncated one.
            buf.resize(capacity + 1, 0);
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if n > capacity {
                        warn!(%from, capacity, "datagram exceeds receive capacity, dropped");
                        continue;
                    }
                    buf.truncate(n);
                    self.metrics.record_received(n);
                    self.conn.received(Some(from), buf.freeze());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return DriverStatus::Open,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.teardown_failed(registry, e),
            }
        }
    }

    fn write_ready(&mut self, registry: &Registry) -> DriverStatus {
        loop {
            let step = match self.queue.front_mut() {
                None => DatagramStep::QueueEmpty,
                Some(entry) => match (&entry.payload, entry.dest) {
                    (None, _) => DatagramStep::Sentinel,
                    (Some(buf), Some(dest)) => match self.socket.send_to(&buf[..], dest) {
                        Ok(n) => DatagramStep::Sent(n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => DatagramStep::Blocked,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => DatagramStep::Retry,
                        Err(e) => DatagramStep::EntryFailed(e),
                    },
                    (Some(_), None) => DatagramStep::EntryFailed(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "datagram without destination",
                    )),
                },
            };
            match step {
                DatagramStep::QueueEmpty => {
                    self.set_write_interest(registry, false);
                    return DriverStatus::Open;
                }
                DatagramStep::Sentinel => {
                    // All prior datagrams are out; close the socket.
                    if let Some(entry) = self.queue.pop_front() {
                        entry.complete();
                    }
                    return self.teardown_closed(registry);
                }
                DatagramStep::Sent(n) => {
                    let entry = self.queue.pop_front().expect("sent from empty queue");
                    let len = entry.payload.as_ref().map_or(0, |buf| buf.len());
                    if n == len {
                        self.metrics.record_sent(n);
                        entry.complete();
                    } else {
                        entry.fail(NetError::Io(io::Error::new(
                            io::ErrorKind::WriteZero,
                            format!("datagram truncated by OS: {n} of {len} bytes"),
                        )));
                    }
                }
                DatagramStep::Blocked => {
                    self.set_write_interest(registry, true);
                    return DriverStatus::Open;
                }
                DatagramStep::Retry => continue,
                DatagramStep::EntryFailed(e) => {
                    // Per-datagram failure: discard the entry, keep the socket.
                    if let Some(entry) = self.queue.pop_front() {
                        entry.fail(NetError::Io(e));
                    }
                }
            }
        }
    }

    fn set_write_interest(&mut self, registry: &Registry, on: bool) {
        let want = if on {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        };
        if want == self.interest {
            return;
        }
        match registry.reregister(&mut self.socket, self.token, want) {
            Ok(()) => self.interest = want,
            Err(e) => trace!(error = %e, "interest reregister failed"),
        }
    }

    fn deregister(&mut self, registry: &Registry) {
        if let Err(e) = registry.deregister(&mut self.socket) {
            trace!(error = %e, "deregister failed");
        }
    }

    fn teardown_closed(&mut self, registry: &Registry) -> DriverStatus {
        self.deregister(registry);
        self.queue.fail_all(|| NetError::Closed);
        self.conn.closed();
        DriverStatus::Closed
    }

    fn teardown_failed(&mut self, registry: &Registry, e: io::Error) -> DriverStatus {
        debug!(token = self.token.0, error = %e, "datagram socket failed");
        self.deregister(registry);
        let cause = e.to_string();
        self.queue
            .fail_all(|| NetError::ClosedByError { cause: cause.clone() });
        self.conn.failed(NetError::Io(e));
        DriverStatus::Closed
    }
}

impl ChannelDriver for UdpDriver {
    fn ready(&mut self, ctx: &mut LoopCtx<'_>, readiness: Readiness) -> DriverStatus {
        if readiness.readable && self.read_ready(ctx.registry) == DriverStatus::Closed {
            return DriverStatus::Closed;
        }
        if readiness.writable {
            return self.write_ready(ctx.registry);
        }
        DriverStatus::Open
    }

    fn enqueue(&mut self, ctx: &mut LoopCtx<'_>, entry: WriteEntry) -> DriverStatus {
        if self.queue.shutdown_queued() {
            entry.fail(NetError::Closed);
            return DriverStatus::Open;
        }
        if let Some(buf) = &entry.payload {
            let projected = self.queue.outstanding() + buf.len();
            if self.write_ceiling > 0 && projected > self.write_ceiling {
                // Hard drop: only this send fails, the socket stays healthy.
                self.metrics.record_dropped();
                entry.fail(NetError::WriteCeiling {
                    limit: self.write_ceiling,
                });
                return DriverStatus::Open;
            }
        }
        self.queue.push(entry);
        self.metrics.observe_outstanding(self.queue.outstanding());
        self.write_ready(ctx.registry)
    }

    fn close(&mut self, ctx: &mut LoopCtx<'_>) {
        self.deregister(ctx.registry);
        self.queue.fail_all(|| NetError::Closed);
        self.conn.closed();
    }
}
