//! Stream-channel state machine shared by TCP clients and accepted server
//! peers: asynchronous connect completion, readiness-driven read loop, and
//! the FIFO write queue with partial-write retention.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::rc::Rc;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace};

use crate::buffer::BufferAllocator;
use crate::error::NetError;
use crate::event::Readiness;
use crate::handler::{ChannelDriver, DriverStatus, LoopCtx};
use crate::metrics::NetMetrics;
use crate::net::config::SocketConfig;
use crate::net::queue::{WriteEntry, WriteQueue};
use crate::net::traits::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    Connecting,
    Connected,
}

/// One outcome of inspecting the write-queue head, computed before any queue
/// mutation so the borrows stay simple.
enum WriteStep {
    QueueEmpty,
    Sentinel,
    Wrote(usize),
    WroteZero,
    Blocked,
    Retry,
    Fatal(io::Error),
}

pub(crate) struct StreamDriver {
    token: Token,
    stream: TcpStream,
    phase: StreamPhase,
    conn: Box<dyn Connection>,
    queue: WriteQueue,
    interest: Interest,
    write_ceiling: usize,
    allocator: Arc<dyn BufferAllocator>,
    metrics: Arc<NetMetrics>,
    /// Membership set of the owning listener; accepted peers remove
    /// themselves here on teardown. `None` for outbound clients.
    peers: Option<Rc<RefCell<HashSet<Token>>>>,
    /// Write half closed by the graceful-close sentinel.
    shut_down: bool,
}

impl StreamDriver {
    /// Driver for an outbound stream whose non-blocking connect is still in
    /// flight. The stream must already be registered with `WRITABLE`
    /// interest under `token`.
    pub(crate) fn connecting(
        token: Token,
        stream: TcpStream,
        conn: Box<dyn Connection>,
        config: &SocketConfig,
    ) -> Self {
        StreamDriver {
            token,
            stream,
            phase: StreamPhase::Connecting,
            conn,
            queue: WriteQueue::new(),
            interest: Interest::WRITABLE,
            write_ceiling: config.write_ceiling,
            allocator: Arc::clone(&config.allocator),
            metrics: Arc::clone(&config.metrics),
            peers: None,
            shut_down: false,
        }
    }

    /// Driver for an accepted peer, already connected on arrival. The stream
    /// must already be registered with `READABLE` interest under `token`.
    pub(crate) fn accepted(
        token: Token,
        stream: TcpStream,
        conn: Box<dyn Connection>,
        config: &SocketConfig,
        peers: Rc<RefCell<HashSet<Token>>>,
    ) -> Self {
        StreamDriver {
            token,
            stream,
            phase: StreamPhase::Connected,
            conn,
            queue: WriteQueue::new(),
            interest: Interest::READABLE,
            write_ceiling: config.write_ceiling,
            allocator: Arc::clone(&config.allocator),
            metrics: Arc::clone(&config.metrics),
            peers: Some(peers),
            shut_down: false,
        }
    }

    /// Delivers the initial `connected` callback for accepted peers.
    pub(crate) fn announce_connected(&mut self, peer: std::net::SocketAddr) {
        self.conn.connected(Some(peer));
    }

    fn finish_connect(&mut self, registry: &Registry) -> DriverStatus {
        match self.stream.take_error() {
            Ok(Some(e)) => return self.teardown_failed(registry, e),
            Ok(None) => {}
            Err(e) => return self.teardown_failed(registry, e),
        }
        match self.stream.peer_addr() {
            Ok(peer) => {
                self.phase = StreamPhase::Connected;
                let want = if self.queue.is_empty() {
                    Interest::READABLE
                } else {
                    Interest::READABLE.add(Interest::WRITABLE)
                };
                if let Err(e) = registry.reregister(&mut self.stream, self.token, want) {
                    return self.teardown_failed(registry, e);
                }
                self.interest = want;
                debug!(token = self.token.0, %peer, "stream connected");
                self.conn.connected(Some(peer));
                DriverStatus::Open
            }
            // Spurious wakeup while the handshake is still in flight.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => DriverStatus::Open,
            Err(e) => self.teardown_failed(registry, e),
        }
    }

    fn read_ready(&mut self, registry: &Registry) -> DriverStatus {
        loop {
            let mut buf = self.allocator.allocate();
            match self.stream.read(&mut buf) {
                // Zero-byte read is orderly peer close, not an error.
                Ok(0) => return self.teardown_closed(registry),
                Ok(n) => {
                    buf.truncate(n);
                    self.metrics.record_received(n);
                    self.conn.received(None, buf.freeze());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return DriverStatus::Open,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.teardown_failed(registry, e),
            }
        }
    }

    fn write_ready(&mut self, registry: &Registry) -> DriverStatus {
        if self.phase != StreamPhase::Connected {
            return DriverStatus::Open;
        }
        loop {
            let step = match self.queue.front_mut() {
                None => WriteStep::QueueEmpty,
                Some(entry) => match &entry.payload {
                    None => WriteStep::Sentinel,
                    Some(buf) => match self.stream.write(&buf[..]) {
                        Ok(0) => WriteStep::WroteZero,
                        Ok(n) => WriteStep::Wrote(n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => WriteStep::Blocked,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => WriteStep::Retry,
                        Err(e) => WriteStep::Fatal(e),
                    },
                },
            };
            match step {
                WriteStep::QueueEmpty => {
                    self.set_write_interest(registry, false);
                    return DriverStatus::Open;
                }
                WriteStep::Sentinel => {
                    // All prior entries are flushed; half-close and stop.
                    if let Err(e) = self.stream.shutdown(Shutdown::Write) {
                        trace!(error = %e, "shutdown after close sentinel failed");
                    }
                    self.shut_down = true;
                    if let Some(entry) = self.queue.pop_front() {
                        entry.complete();
                    }
                    self.set_write_interest(registry, false);
                    return DriverStatus::Open;
                }
                WriteStep::Wrote(n) => {
                    self.metrics.record_sent(n);
                    if self.queue.advance_front(n) {
                        if let Some(entry) = self.queue.pop_front() {
                            entry.complete();
                        }
                    } else {
                        // Partial write: the remainder stays at the head.
                        self.set_write_interest(registry, true);
                        return DriverStatus::Open;
                    }
                }
                WriteStep::WroteZero => {
                    let e = io::Error::new(io::ErrorKind::WriteZero, "stream accepted zero bytes");
                    return self.teardown_failed(registry, e);
                }
                WriteStep::Blocked => {
                    self.set_write_interest(registry, true);
                    return DriverStatus::Open;
                }
                WriteStep::Retry => continue,
                WriteStep::Fatal(e) => return self.teardown_failed(registry, e),
            }
        }
    }

    fn set_write_interest(&mut self, registry: &Registry, on: bool) {
        let want = if on {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        };
        if self.phase != StreamPhase::Connected || want == self.interest {
            return;
        }
        match registry.reregister(&mut self.stream, self.token, want) {
            Ok(()) => self.interest = want,
            Err(e) => trace!(error = %e, "interest reregister failed"),
        }
    }

    fn deregister(&mut self, registry: &Registry) {
        if let Err(e) = registry.deregister(&mut self.stream) {
            trace!(error = %e, "deregister failed");
        }
        if let Some(peers) = &self.peers {
            peers.borrow_mut().remove(&self.token);
        }
    }

    fn teardown_closed(&mut self, registry: &Registry) -> DriverStatus {
        self.deregister(registry);
        self.queue.fail_all(|| NetError::Closed);
        self.conn.closed();
        DriverStatus::Closed
    }

    fn teardown_failed(&mut self, registry: &Registry, e: io::Error) -> DriverStatus {
        debug!(token = self.token.0, error = %e, "stream failed");
        self.deregister(registry);
        let cause = e.to_string();
        self.queue
            .fail_all(|| NetError::ClosedByError { cause: cause.clone() });
        self.conn.failed(NetError::Io(e));
        DriverStatus::Closed
    }
}

impl ChannelDriver for StreamDriver {
    fn ready(&mut self, ctx: &mut LoopCtx<'_>, readiness: Readiness) -> DriverStatus {
        if self.phase == StreamPhase::Connecting {
            if !readiness.writable {
                return DriverStatus::Open;
            }
            if self.finish_connect(ctx.registry) == DriverStatus::Closed {
                return DriverStatus::Closed;
            }
            if self.phase != StreamPhase::Connected {
                return DriverStatus::Open;
            }
            // Flush anything queued while the connect was in flight.
            return self.write_ready(ctx.registry);
        }
        if readiness.readable && self.read_ready(ctx.registry) == DriverStatus::Closed {
            return DriverStatus::Closed;
        }
        if readiness.writable {
            return self.write_ready(ctx.registry);
        }
        DriverStatus::Open
    }

    fn enqueue(&mut self, ctx: &mut LoopCtx<'_>, entry: WriteEntry) -> DriverStatus {
        if self.shut_down || self.queue.shutdown_queued() {
            entry.fail(NetError::Closed);
            return DriverStatus::Open;
        }
        if let Some(buf) = &entry.payload {
            let projected = self.queue.outstanding() + buf.len();
            if self.write_ceiling > 0 && projected > self.write_ceiling {
                // Advisory on streams: bytes are not discardable, so the
                // overrun is recorded but the write is still accepted.
                trace!(
                    token = self.token.0,
                    outstanding = projected,
                    ceiling = self.write_ceiling,
                    "write ceiling exceeded"
                );
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
