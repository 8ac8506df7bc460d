//! The connection contract: the shared vocabulary every transport
//! implementation and every protocol layer above it speaks.

use std::net::{SocketAddr, ToSocketAddrs};

use bytes::Bytes;

use crate::error::{NetError, Result};
use crate::net::tcp_server::ServerPeer;

/// Destination or source endpoint.
///
/// Either an already-resolved socket address or a host name with a port.
/// Host names are resolved eagerly on the caller's thread, never on the event
/// loop thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Socket(SocketAddr),
    Host(String, u16),
}

impl Address {
    pub fn host(name: impl Into<String>, port: u16) -> Self {
        Address::Host(name.into(), port)
    }

    /// Resolves to a concrete socket address, taking the first result for
    /// host names.
    pub fn resolve(&self) -> Result<SocketAddr> {
        match self {
            Address::Socket(addr) => Ok(*addr),
            Address::Host(name, port) => (name.as_str(), *port)
                .to_socket_addrs()
                .map_err(|_| NetError::Resolve(format!("{name}:{port}")))?
                .next()
                .ok_or_else(|| NetError::Resolve(format!("{name}:{port}"))),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

/// Completion callback for a single `send`.
///
/// Exactly one of the two methods is invoked per send, eventually but not
/// necessarily synchronously. The consuming `Box<Self>` receivers make the
/// at-most-once guarantee structural.
pub trait SendCallback: Send {
    fn sent(self: Box<Self>);
    fn failed(self: Box<Self>, err: NetError);
}

impl<F> SendCallback for F
where
    F: FnOnce(Result<()>) + Send,
{
    fn sent(self: Box<Self>) {
        (*self)(Ok(()))
    }

    fn failed(self: Box<Self>, err: NetError) {
        (*self)(Err(err))
    }
}

/// Callback interface observed by the owner of a connection.
///
/// Contract: after `failed` or `closed`, no further calls are made; `closed`
/// is delivered at most once; `received` fires zero or more times between
/// `connected` and the terminal callback. All calls happen on the event loop
/// thread, with one exception: a terminal `failed(LoopClosed)` is delivered
/// on the submitting thread when the loop is already shut down.
pub trait Connection: Send {
    /// The channel is ready. TCP clients and server peers get the remote
    /// address; UDP sockets get their bound local address.
    fn connected(&mut self, addr: Option<SocketAddr>);

    /// Bytes arrived. Stream sockets pass `from = None` (no per-message
    /// address); datagram sockets pass the sender.
    fn received(&mut self, from: Option<SocketAddr>, data: Bytes);

    /// The connection was torn down by a setup or transport error. Terminal.
    fn failed(&mut self, err: NetError);

    /// The connection was closed in an orderly fashion (peer end-of-stream or
    /// local close). Terminal.
    fn closed(&mut self);
}

/// An actor that can queue writes and be closed: TCP clients, accepted server
/// peers and UDP sockets all implement this.
///
/// Both operations return immediately; the real work is marshaled onto the
/// event loop thread and completion is observed via callbacks only.
pub trait Connecting: Send + Sync {
    /// Queues one write. `dest` is required for unconnected datagram sockets
    /// and ignored by stream sockets. `payload = None` is the graceful-close
    /// sentinel: the channel shuts down once all prior entries are flushed,
    /// and every later send fails.
    fn send(&self, dest: Option<Address>, payload: Option<Bytes>, cb: Box<dyn SendCallback>);

    /// Hard, immediate teardown: queued writes are failed, not drained.
    /// Idempotent.
    fn close(&self);
}

/// Callback interface observed by the owner of a listening socket.
pub trait Listener: Send {
    /// The listener is bound; `local` carries the actual address, which is
    /// how callers learn an ephemeral port.
    fn connected(&mut self, local: SocketAddr);

    /// A client was accepted. Returns the [`Connection`] callback for the new
    /// peer; `sender` is the handle used to write to or close that peer.
    fn connecting(&mut self, peer: SocketAddr, sender: ServerPeer) -> Box<dyn Connection>;

    /// Binding or accepting failed fatally. Terminal.
    fn failed(&mut self, err: NetError);

    /// The listener was closed; fires after every accepted peer has been torn
    /// down. Terminal.
    fn closed(&mut self);
}

/// An actor that accepts inbound connections.
pub trait Listening: Send + Sync {
    fn listen(&self, cb: Box<dyn Listener>) -> Result<()>;
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_socket_address_verbatim() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(Address::from(addr).resolve().unwrap(), addr);
    }

    #[test]
    fn resolves_localhost() {
        let resolved = Address::host("localhost", 53).resolve().unwrap();
        assert_eq!(resolved.port(), 53);
        assert!(resolved.ip().is_loopback());
    }

    #[test]
    fn resolve_failure_reports_host() {
        let err = Address::host("no-such-host.invalid", 1).resolve().unwrap_err();
        assert!(matches!(err, NetError::Resolve(_)));
    }

    #[test]
    fn closure_send_callback_fires_once() {
        let (tx, rx) = std::sync::mpsc::channel();
        let cb: Box<dyn SendCallback> = Box::new(move |result: Result<()>| {
            tx.send(result.is_ok()).unwrap();
        });
        cb.sent();
        assert_eq!(rx.try_recv(), Ok(true));
    }
}
