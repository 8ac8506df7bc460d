//! Socket configuration.
//!
//! One [`SocketConfig`] is handed to each socket builder. The core never
//! loads configuration itself; callers assemble it with the builder.
//!
//! A value of `0` for the OS buffer sizes or the write ceiling means "use the
//! OS default" / "unbounded".

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{BufferAllocator, FixedAllocator};
use crate::metrics::NetMetrics;

#[derive(Clone)]
pub struct SocketConfig {
    /// Local address to bind before connecting (TCP client) or receiving
    /// (UDP); `None` lets the OS pick.
    pub bind: Option<SocketAddr>,
    /// SO_RCVBUF; 0 = OS default.
    pub recv_buffer_size: usize,
    /// SO_SNDBUF; 0 = OS default.
    pub send_buffer_size: usize,
    /// Outstanding-write-byte ceiling; 0 = unbounded. Advisory (high-water
    /// metric) for TCP, a hard per-send drop for UDP.
    pub write_ceiling: usize,
    /// TCP_NODELAY on stream sockets.
    pub no_delay: bool,
    /// SO_KEEPALIVE idle time on stream sockets.
    pub keep_alive: Option<Duration>,
    /// Supplies fresh receive buffers.
    pub allocator: Arc<dyn BufferAllocator>,
    /// Counter context the socket publishes into.
    pub metrics: Arc<NetMetrics>,
}

impl SocketConfig {
    pub fn builder() -> SocketConfigBuilder {
        SocketConfigBuilder::new()
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            bind: None,
            recv_buffer_size: 0,
            send_buffer_size: 0,
            write_ceiling: 0,
            no_delay: true,
            keep_alive: Some(Duration::from_secs(60)),
            allocator: Arc::new(FixedAllocator::default()),
            metrics: Arc::new(NetMetrics::new()),
        }
    }
}

/// Builder for [`SocketConfig`]; unset fields fall back to the defaults.
pub struct SocketConfigBuilder {
    config: SocketConfig,
}

impl SocketConfigBuilder {
    pub fn new() -> Self {
        SocketConfigBuilder {
            config: SocketConfig::default(),
        }
    }

    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.bind = Some(addr);
        self
    }

    pub fn recv_buffer_size(mut self, bytes: usize) -> Self {
        self.config.recv_buffer_size = bytes;
        self
    }

    pub fn send_buffer_size(mut self, bytes: usize) -> Self {
        self.config.send_buffer_size = bytes;
        self
    }

    pub fn write_ceiling(mut self, bytes: usize) -> Self {
        self.config.write_ceiling = bytes;
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.config.no_delay = enabled;
        self
    }

    pub fn keep_alive(mut self, duration: Option<Duration>) -> Self {
        self.config.keep_alive = duration;
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.config.allocator = allocator;
        self
    }

    pub fn metrics(mut self, metrics: Arc<NetMetrics>) -> Self {
        self.config.metrics = metrics;
        self
    }

    pub fn build(self) -> SocketConfig {
        self.config
    }
}

impl Default for SocketConfigBuilder {
    fn default() -> Self {
        SocketConfigBuilder::new()
    }
}
