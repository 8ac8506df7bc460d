//! Socket channels driven by the event loop: outbound TCP streams, TCP
//! listeners with per-peer contexts, and connectionless UDP.

pub mod config;
pub(crate) mod queue;
pub(crate) mod stream;
pub mod tcp_client;
pub mod tcp_server;
pub mod traits;
pub mod udp;

pub use config::{SocketConfig, SocketConfigBuilder};
pub use tcp_client::TcpClient;
pub use tcp_server::{ServerPeer, TcpServer};
pub use traits::{Address, Connecting, Connection, Listener, Listening, SendCallback};
pub use udp::UdpSocket;

use crate::error::NetError;
use crate::reactor::{Core, LoopJob};

/// Defers a setup failure onto the loop thread, keeping `Connection`
/// callback delivery single-threaded.
pub(crate) struct FailJob {
    pub(crate) conn: Box<dyn Connection>,
    pub(crate) err: NetError,
}

impl LoopJob for FailJob {
    fn run(self: Box<Self>, _core: &mut Core) {
        let mut conn = self.conn;
        conn.failed(self.err);
    }

    fn cancel(self: Box<Self>) {
        let mut conn = self.conn;
        conn.failed(NetError::LoopClosed);
    }
}
